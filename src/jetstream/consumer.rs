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

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ClientError;
use crate::header;
use crate::jetstream::context::Context;
use crate::jetstream::Message;
use crate::{Error, Subscriber};

/// When to start delivering messages of a stream to a consumer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// Deliver every message retained by the stream.
    All,
    /// Start with the last message added to the stream.
    #[default]
    Last,
    /// Deliver only messages arriving after the consumer was created.
    New,
    /// Start with the last message for every matched subject.
    LastPerSubject,
    /// Start at the sequence given in `opt_start_seq`.
    ByStartSequence,
    /// Start at the timestamp given in `opt_start_time`.
    ByStartTime,
}

/// Which deliveries require acknowledgement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// No acknowledgements are required.
    None,
    /// Acknowledging a message acknowledges everything before it.
    All,
    /// Every delivery must be acknowledged individually.
    #[default]
    Explicit,
}

/// How fast retained messages are replayed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayPolicy {
    /// As fast as the consumer can take them.
    #[default]
    Instant,
    /// At the rate the messages were originally received.
    Original,
}

/// Configuration of a consumer.
///
/// A set `durable_name` makes the consumer durable, a set `deliver_subject`
/// makes it a push consumer; without one it delivers through pull requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Subject push deliveries are sent to; pull consumers leave this
    /// unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    /// A unique name; the consumer's state survives disconnects when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    /// Stream sequence to start at with [DeliverPolicy::ByStartSequence].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    /// Timestamp to start at with [DeliverPolicy::ByStartTime].
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub opt_start_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    /// How long a delivery may stay unacknowledged before redelivery.
    #[serde(default, with = "serde_nanos", skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<Duration>,
    /// How many times an unacknowledged message is redelivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    /// Only deliver messages matching this subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default)]
    pub replay_policy: ReplayPolicy,
    /// Ack sampling rate for observability, e.g. `"100"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_freq: Option<String>,
    /// Delivery rate cap in bits per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u64>,
    /// Maximum unacknowledged deliveries before the server suspends
    /// delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    /// Interval for status-100 heartbeats when the consumer is idle.
    #[serde(default, with = "serde_nanos", skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<Duration>,
    /// Enables flow-control status messages for push consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_control: Option<bool>,
    /// Outstanding pulls allowed on a pull consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<i64>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            deliver_subject: None,
            durable_name: None,
            deliver_policy: DeliverPolicy::default(),
            opt_start_seq: None,
            opt_start_time: None,
            ack_policy: AckPolicy::default(),
            ack_wait: None,
            max_deliver: None,
            filter_subject: None,
            replay_policy: ReplayPolicy::default(),
            sample_freq: None,
            rate_limit: None,
            max_ack_pending: None,
            idle_heartbeat: None,
            flow_control: None,
            max_waiting: None,
        }
    }
}

/// A consumer's position in its stream.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct SequenceInfo {
    /// Sequence of the consumer.
    #[serde(rename = "consumer_seq")]
    pub consumer_sequence: u64,
    /// Sequence of the stream.
    #[serde(rename = "stream_seq")]
    pub stream_sequence: u64,
}

/// Configuration and state of a consumer as reported by the server.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumerInfo {
    /// The stream the consumer belongs to.
    pub stream_name: String,
    /// The consumer's name, machine generated or the durable name.
    pub name: String,
    /// When the consumer was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    /// The active configuration.
    pub config: Config,
    /// The last message delivered from this consumer.
    pub delivered: SequenceInfo,
    /// The highest contiguous acknowledged message.
    pub ack_floor: SequenceInfo,
    /// Deliveries waiting for an acknowledgement.
    #[serde(default)]
    pub num_ack_pending: u64,
    /// Redeliveries performed so far.
    #[serde(default)]
    pub num_redelivered: u64,
    /// Pull requests waiting for messages.
    #[serde(default)]
    pub num_waiting: u64,
    /// Messages left unconsumed in this consumer.
    #[serde(default)]
    pub num_pending: u64,
}

/// A page of consumers returned by the list operation.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumersPage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(default, deserialize_with = "crate::jetstream::response::null_default")]
    pub consumers: Vec<ConsumerInfo>,
}

/// A page of consumer names returned by the names operation.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsumerNamesPage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(default, deserialize_with = "crate::jetstream::response::null_default")]
    pub consumers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateConsumerRequest {
    pub(crate) stream_name: String,
    pub(crate) config: Config,
}

#[derive(Debug, Serialize)]
pub(crate) struct NamesRequest {
    pub(crate) offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) subject: Option<String>,
}

/// Controls for the pull message loop.
#[derive(Clone, Copy, Debug)]
pub struct PullOptions {
    /// Messages requested per pull.
    pub batch: usize,
    /// Server-side expiry for each pull request.
    pub expires: Option<Duration>,
    /// Ask the server to answer immediately with a no-messages status
    /// instead of holding the pull open.
    pub no_wait: bool,
    /// Acknowledge every message before yielding it.
    pub auto_ack: bool,
    /// Stop after this many messages in total.
    pub max_messages: Option<usize>,
}

impl Default for PullOptions {
    fn default() -> PullOptions {
        PullOptions {
            batch: 1,
            expires: None,
            no_wait: false,
            auto_ack: true,
            max_messages: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct NextRequest {
    batch: usize,
    #[serde(with = "serde_nanos", skip_serializing_if = "Option::is_none")]
    expires: Option<Duration>,
    #[serde(skip_serializing_if = "is_false")]
    no_wait: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A handle to a consumer known to exist on the server.
#[derive(Clone, Debug)]
pub struct Consumer {
    context: Context,
    info: ConsumerInfo,
}

impl Consumer {
    pub(crate) fn new(context: Context, info: ConsumerInfo) -> Consumer {
        Consumer { context, info }
    }

    /// The info record fetched when this handle was created.
    pub fn cached_info(&self) -> &ConsumerInfo {
        &self.info
    }

    /// Fetches a fresh info record from the server.
    pub async fn info(&mut self) -> Result<&ConsumerInfo, Error> {
        self.info = self
            .context
            .consumer_info(&self.info.stream_name, &self.info.name)
            .await?;
        Ok(&self.info)
    }

    /// Pulls messages indefinitely, yielding them as an async sequence.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use futures::StreamExt;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), async_gnat::Error> {
    /// # let client = async_gnat::connect("localhost:4222").await?;
    /// # let jetstream = async_gnat::jetstream::new(client);
    /// let consumer = jetstream.get_consumer("events", "processor").await?;
    /// let mut messages = Box::pin(consumer.messages().await?.take(100));
    /// while let Some(message) = messages.next().await {
    ///     println!("received: {:?}", message?);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn messages(
        &self,
    ) -> Result<impl futures::Stream<Item = Result<Message, Error>>, Error> {
        self.stream_with(PullOptions::default()).await
    }

    /// Pulls up to `batch` messages and ends as soon as the server reports
    /// that none are left.
    pub async fn fetch(
        &self,
        batch: usize,
    ) -> Result<impl futures::Stream<Item = Result<Message, Error>>, Error> {
        self.stream_with(PullOptions {
            no_wait: true,
            max_messages: Some(batch),
            ..PullOptions::default()
        })
        .await
    }

    /// Pulls messages with explicit [PullOptions].
    ///
    /// Requests are issued on a private inbox, one
    /// `CONSUMER.MSG.NEXT.<stream>.<name>` request per message. The inbox
    /// subscription is removed when the returned sequence is dropped.
    pub async fn stream_with(
        &self,
        options: PullOptions,
    ) -> Result<impl futures::Stream<Item = Result<Message, Error>>, Error> {
        let client = self.context.client();
        let inbox = client.new_inbox();
        let subscriber = client.subscribe(inbox.clone()).await?;

        let state = PullState {
            context: self.context.clone(),
            subject: format!(
                "{}.CONSUMER.MSG.NEXT.{}.{}",
                self.context.prefix(),
                self.info.stream_name,
                self.info.name
            ),
            inbox,
            subscriber,
            options,
            yielded: 0,
            done: false,
        };
        Ok(futures::stream::unfold(state, pull_step))
    }

    /// Pulls a single message. With `no_wait` the call resolves to
    /// `Ok(None)` when the server has no message available instead of
    /// waiting for one.
    pub async fn pull_next(&self, no_wait: bool) -> Result<Option<Message>, Error> {
        let stream = self
            .stream_with(PullOptions {
                no_wait,
                max_messages: Some(1),
                ..PullOptions::default()
            })
            .await?;
        futures::pin_mut!(stream);

        match stream.next().await {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(err),
        }
    }
}

struct PullState {
    context: Context,
    subject: String,
    inbox: String,
    subscriber: Subscriber,
    options: PullOptions,
    yielded: usize,
    done: bool,
}

async fn pull_step(mut state: PullState) -> Option<(Result<Message, Error>, PullState)> {
    if state.done {
        return None;
    }
    if let Some(max) = state.options.max_messages {
        if state.yielded >= max {
            return None;
        }
    }

    loop {
        let request = NextRequest {
            batch: state.options.batch.max(1),
            expires: state.options.expires,
            no_wait: state.options.no_wait,
        };
        let body = match serde_json::to_vec(&request) {
            Ok(body) => body,
            Err(err) => {
                state.done = true;
                return Some((Err(Box::new(err)), state));
            }
        };
        if let Err(err) = state
            .context
            .client()
            .publish_with_reply(state.subject.clone(), state.inbox.clone(), body.into())
            .await
        {
            state.done = true;
            return Some((Err(err), state));
        }

        let message = match state.subscriber.next().await {
            Some(message) => message,
            None => return None,
        };

        if let Some(status) = message.status() {
            if message.payload.is_empty() {
                match status {
                    // No message available right now.
                    header::NOT_FOUND => {
                        if state.options.no_wait {
                            return None;
                        }
                        continue;
                    }
                    // The pull expired; issue the next one.
                    header::REQUEST_TIMEOUT => continue,
                    _ => {
                        state.done = true;
                        let description = message
                            .description()
                            .unwrap_or("pull request failed")
                            .to_string();
                        return Some((
                            Err(Box::new(ClientError::ServerError(format!(
                                "{} (status {})",
                                description, status
                            )))),
                            state,
                        ));
                    }
                }
            }
        }

        let message = Message {
            context: state.context.clone(),
            message,
        };
        if state.options.auto_ack {
            if let Err(err) = message.ack().await {
                state.done = true;
                return Some((Err(err), state));
            }
        }
        state.yielded += 1;
        return Some((Ok(message), state));
    }
}
