// Copyright 2020-2022 The NATS Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! JetStream is the built-in persistence layer of NATS-compatible servers,
//! providing [Streams][crate::jetstream::stream::Stream] with *at least
//! once* delivery semantics.
//!
//! To start, create a new [Context], which is the entrypoint to the
//! JetStream API.
//!
//! # Examples
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), async_gnat::Error> {
//! let client = async_gnat::connect("localhost:4222").await?;
//! let jetstream = async_gnat::jetstream::new(client);
//!
//! let stream = jetstream
//!     .get_or_create_stream(async_gnat::jetstream::stream::Config {
//!         name: "events".to_string(),
//!         subjects: vec!["events.>".to_string()],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! jetstream.publish("events.one".to_string(), "data".into()).await?;
//!
//! let consumer = stream
//!     .create_consumer(async_gnat::jetstream::consumer::Config {
//!         durable_name: Some("processor".to_string()),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! while let Some(message) = consumer.pull_next(true).await? {
//!     println!("message received: {:?}", message);
//!     message.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::io;

use bytes::Bytes;
use time::OffsetDateTime;

use crate::Client;

pub mod consumer;
pub mod context;
pub mod kv;
pub mod publish;
pub mod response;
pub mod stream;

pub use context::Context;
pub use publish::PublishAck;
pub use response::ApiError;

const ACK_PREFIX: &str = "$JS.ACK";

/// Creates a new JetStream [Context] that provides the JetStream API for
/// managing and using [Streams][crate::jetstream::stream::Stream],
/// [Consumers][crate::jetstream::consumer::Consumer] and the key-value
/// store.
///
/// # Examples
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// let client = async_gnat::connect("localhost:4222").await?;
/// let jetstream = async_gnat::jetstream::new(client);
///
/// jetstream.publish("subject".to_string(), "data".into()).await?;
/// # Ok(())
/// # }
/// ```
pub fn new(client: Client) -> Context {
    Context::new(client)
}

/// Creates a new JetStream [Context] for the given JetStream domain.
///
/// # Examples
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// let client = async_gnat::connect("localhost:4222").await?;
/// let jetstream = async_gnat::jetstream::with_domain(client, "hub");
/// # Ok(())
/// # }
/// ```
pub fn with_domain<T: AsRef<str>>(client: Client, domain: T) -> Context {
    Context::with_domain(client, domain)
}

/// Creates a new JetStream [Context] with the given API prefix. By default
/// it is `$JS.API`.
///
/// # Examples
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// let client = async_gnat::connect("localhost:4222").await?;
/// let jetstream = async_gnat::jetstream::with_prefix(client, "$JS.hub.API");
/// # Ok(())
/// # }
/// ```
pub fn with_prefix(client: Client, prefix: &str) -> Context {
    Context::with_prefix(client, prefix)
}

/// A message delivered from a stream, bound to the [Context] it arrived
/// through so it can be acknowledged.
#[derive(Clone, Debug)]
pub struct Message {
    pub message: crate::Message,
    pub context: Context,
}

impl std::ops::Deref for Message {
    type Target = crate::Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl From<Message> for crate::Message {
    fn from(source: Message) -> crate::Message {
        source.message
    }
}

impl Message {
    /// Acknowledges the delivery by publishing an empty body to the
    /// message's reply subject.
    ///
    /// With [consumer::AckPolicy::All] or [consumer::AckPolicy::Explicit],
    /// unacknowledged messages are redelivered and the consumer cannot
    /// advance past them.
    pub async fn ack(&self) -> Result<(), crate::Error> {
        if let Some(ref reply) = self.reply {
            self.context
                .client()
                .publish(reply.to_string(), "".into())
                .await
        } else {
            Err(Box::new(io::Error::new(
                io::ErrorKind::Other,
                "no reply subject, not a JetStream message",
            )))
        }
    }

    /// Acknowledges the delivery with a chosen [AckKind] variant.
    pub async fn ack_with(&self, kind: AckKind) -> Result<(), crate::Error> {
        if let Some(ref reply) = self.reply {
            self.context
                .client()
                .publish(reply.to_string(), kind.into())
                .await
        } else {
            Err(Box::new(io::Error::new(
                io::ErrorKind::Other,
                "no reply subject, not a JetStream message",
            )))
        }
    }

    /// Acknowledges the delivery and waits for confirmation that the server
    /// received the acknowledgement. Useful for *exactly once* processing.
    pub async fn double_ack(&self) -> Result<(), crate::Error> {
        use futures::StreamExt;

        if let Some(ref reply) = self.reply {
            let client = self.context.client();
            let inbox = client.new_inbox();
            let mut subscription = client.subscribe(inbox.clone()).await?;
            client
                .publish_with_reply(reply.to_string(), inbox, AckKind::Ack.into())
                .await?;
            match subscription.next().await {
                Some(_) => Ok(()),
                None => Err(Box::new(io::Error::new(
                    io::ErrorKind::Other,
                    "subscription dropped before the ack was confirmed",
                ))),
            }
        } else {
            Err(Box::new(io::Error::new(
                io::ErrorKind::Other,
                "no reply subject, not a JetStream message",
            )))
        }
    }

    /// Parses the `$JS.ACK` reply subject into delivery metadata.
    ///
    /// Fails when the reply subject is absent, carries the wrong prefix or
    /// has fewer tokens than the acknowledged form requires; the raw message
    /// stays available for inspection either way.
    pub fn info(&self) -> Result<MessageInfo, crate::Error> {
        let reply = self.reply.as_deref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                "no reply subject, not a JetStream message",
            )
        })?;
        MessageInfo::parse(reply)
    }
}

/// Delivery metadata carried in the reply subject of a stream message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    /// JetStream domain, present in the long ack form.
    pub domain: Option<String>,
    /// Account hash, present in the long ack form.
    pub account_hash: Option<String>,
    /// Name of the originating stream.
    pub stream: String,
    /// Name of the consumer that delivered the message.
    pub consumer: String,
    /// How many times this message was delivered.
    pub delivered: u64,
    /// Sequence of the message in the stream.
    pub stream_sequence: u64,
    /// Sequence of the message for this consumer.
    pub consumer_sequence: u64,
    /// When the server received the message.
    pub published: OffsetDateTime,
    /// Messages left unconsumed for this consumer.
    pub pending: u64,
}

impl MessageInfo {
    fn parse(reply: &str) -> Result<MessageInfo, crate::Error> {
        fn malformed(reply: &str, detail: &str) -> crate::Error {
            Box::new(io::Error::new(
                io::ErrorKind::Other,
                format!("malformed ack reply subject {:?}: {}", reply, detail),
            ))
        }

        if !reply.starts_with(ACK_PREFIX) {
            return Err(malformed(reply, "missing $JS.ACK prefix"));
        }
        let tokens: Vec<&str> = reply.split('.').collect();

        // The 9 token form is `$JS.ACK.<stream>.<consumer>.<delivered>
        // .<stream seq>.<consumer seq>.<timestamp>.<pending>`; servers with
        // domains insert `<domain>.<account hash>` after the prefix.
        let (domain, account_hash, rest) = match tokens.len() {
            9 => (None, None, &tokens[2..]),
            n if n >= 11 => {
                let domain = match tokens[2] {
                    "_" => None,
                    domain => Some(domain.to_string()),
                };
                (domain, Some(tokens[3].to_string()), &tokens[4..])
            }
            _ => return Err(malformed(reply, "too few tokens")),
        };

        let parse_sequence = |token: &str| -> Result<u64, crate::Error> {
            token
                .parse()
                .map_err(|_| malformed(reply, "invalid integer token"))
        };

        let published_nanos: i128 = rest[5]
            .parse()
            .map_err(|_| malformed(reply, "invalid timestamp token"))?;
        let published = OffsetDateTime::from_unix_timestamp_nanos(published_nanos)
            .map_err(|_| malformed(reply, "timestamp out of range"))?;

        Ok(MessageInfo {
            domain,
            account_hash,
            stream: rest[0].to_string(),
            consumer: rest[1].to_string(),
            delivered: parse_sequence(rest[2])?,
            stream_sequence: parse_sequence(rest[3])?,
            consumer_sequence: parse_sequence(rest[4])?,
            published,
            pending: parse_sequence(rest[6])?,
        })
    }
}

/// The kinds of response used for acknowledging a processed message.
#[derive(Debug, Clone, Copy)]
pub enum AckKind {
    /// Acknowledges a message was completely handled.
    Ack,
    /// Signals that the message will not be processed now and processing
    /// can move onto the next message; NAK'd messages will be retried.
    Nak,
    /// When sent before the AckWait period indicates that work is ongoing
    /// and the period should be extended by another equal to AckWait.
    Progress,
    /// Acknowledges the message was handled and requests delivery of the
    /// next message to the reply subject. Only applies to pull mode.
    Next,
    /// Instructs the server to stop redelivery of a message without
    /// acknowledging it as successfully processed.
    Term,
}

impl From<AckKind> for Bytes {
    fn from(kind: AckKind) -> Self {
        use AckKind::*;
        match kind {
            Ack => Bytes::from_static(b"+ACK"),
            Nak => Bytes::from_static(b"-NAK"),
            Progress => Bytes::from_static(b"+WPI"),
            Next => Bytes::from_static(b"+NXT"),
            Term => Bytes::from_static(b"+TERM"),
        }
    }
}
