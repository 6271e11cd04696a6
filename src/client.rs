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

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::task::JoinHandle;

use crate::error::{ClientError, Error};
use crate::header::HeaderMap;
use crate::options::{ConnectOptions, ErrorCallback};
use crate::{
    ClientStatistics, Command, ConnectionState, Message, ServerInfo, Statistics,
};

const INBOX_PREFIX: &str = "_INBOX.";

/// Correlation state for the shared-inbox request engine.
struct RequestMultiplexer {
    prefix: OnceCell<String>,
    senders: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

/// Client is a cloneable handle to a connection.
///
/// Client should not be constructed directly; use [`crate::connect`] or
/// [`ConnectOptions::connect`].
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<Command>,
    next_sid: Arc<AtomicU64>,
    state: watch::Receiver<ConnectionState>,
    info: watch::Receiver<ServerInfo>,
    statistics: Arc<Statistics>,
    requests: Arc<RequestMultiplexer>,
    error_callback: Option<ErrorCallback>,
    request_timeout: Duration,
    drain_timeout: Duration,
    pending_msgs_limit: usize,
    pending_bytes_limit: usize,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) fn new(
        sender: mpsc::Sender<Command>,
        state: watch::Receiver<ConnectionState>,
        info: watch::Receiver<ServerInfo>,
        statistics: Arc<Statistics>,
        options: &ConnectOptions,
    ) -> Client {
        Client {
            sender,
            next_sid: Arc::new(AtomicU64::new(1)),
            state,
            info,
            statistics,
            requests: Arc::new(RequestMultiplexer {
                prefix: OnceCell::new(),
                senders: Mutex::new(HashMap::new()),
            }),
            error_callback: options.error_callback.clone(),
            request_timeout: options.request_timeout,
            drain_timeout: options.drain_timeout,
            pending_msgs_limit: options.subscription_pending_msgs_limit,
            pending_bytes_limit: options.subscription_pending_bytes_limit,
        }
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the connection reached its final closed state.
    pub fn is_closed(&self) -> bool {
        self.connection_state() == ConnectionState::Closed
    }

    /// The latest server-advertised info record.
    pub fn server_info(&self) -> ServerInfo {
        self.info.borrow().clone()
    }

    /// The maximum payload the connected server accepts.
    pub fn max_payload(&self) -> usize {
        self.info.borrow().max_payload
    }

    /// The server-assigned client id.
    pub fn client_id(&self) -> u64 {
        self.info.borrow().client_id
    }

    /// A snapshot of the connection counters.
    pub fn statistics(&self) -> ClientStatistics {
        ClientStatistics {
            in_msgs: self.statistics.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.statistics.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.statistics.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.statistics.out_bytes.load(Ordering::Relaxed),
            reconnects: self.statistics.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publishes a message to the given subject.
    pub async fn publish(&self, subject: String, payload: Bytes) -> Result<(), Error> {
        self.publish_inner(subject, None, None, payload).await
    }

    /// Publishes a message with a header map attached.
    pub async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.publish_inner(subject, None, Some(headers), payload)
            .await
    }

    /// Publishes a message carrying a reply subject for responses.
    pub async fn publish_with_reply(
        &self,
        subject: String,
        reply: String,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.publish_inner(subject, Some(reply), None, payload).await
    }

    /// Publishes a message carrying both a reply subject and headers.
    pub async fn publish_with_reply_and_headers(
        &self,
        subject: String,
        reply: String,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.publish_inner(subject, Some(reply), Some(headers), payload)
            .await
    }

    async fn publish_inner(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<(), Error> {
        match self.connection_state() {
            ConnectionState::Closed => return Err(Box::new(ClientError::ConnectionClosed)),
            ConnectionState::DrainingPublishes => {
                return Err(Box::new(ClientError::ConnectionDraining))
            }
            _ => {}
        }
        if !is_valid_subject(&subject) {
            return Err(Box::new(ClientError::BadSubject));
        }

        // The guard runs before anything reaches the wire.
        let max_payload = self.max_payload();
        if max_payload > 0 && payload.len() > max_payload {
            return Err(Box::new(ClientError::MaxPayload));
        }

        self.sender
            .send(Command::Publish {
                subject,
                reply,
                headers,
                payload,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }

    /// Sends a request and waits for the reply over the shared inbox
    /// subscription, up to the configured request timeout.
    pub async fn request(&self, subject: String, payload: Bytes) -> Result<Message, Error> {
        self.request_inner(subject, None, payload, self.request_timeout)
            .await
    }

    /// Sends a request with headers attached.
    pub async fn request_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<Message, Error> {
        self.request_inner(subject, Some(headers), payload, self.request_timeout)
            .await
    }

    /// Sends a request with an explicit timeout.
    pub async fn request_timeout(
        &self,
        subject: String,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.request_inner(subject, None, payload, timeout).await
    }

    async fn request_inner(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, Error> {
        let prefix = self.request_prefix().await?;

        let token = nuid::next();
        let (respond, receiver) = oneshot::channel();
        self.requests
            .senders
            .lock()
            .unwrap()
            .insert(token.clone(), respond);

        let reply = format!("{}{}", prefix, token);
        if let Err(err) = self
            .publish_inner(subject, Some(reply), headers, payload)
            .await
        {
            self.requests.senders.lock().unwrap().remove(&token);
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Box::new(ClientError::ConnectionClosed)),
            Err(_) => {
                self.requests.senders.lock().unwrap().remove(&token);
                Err(Box::new(ClientError::TimedOut))
            }
        }
    }

    /// Initializes the shared `_INBOX.<id>.*` subscription on first use and
    /// returns the per-client inbox prefix.
    async fn request_prefix(&self) -> Result<String, Error> {
        let prefix = self
            .requests
            .prefix
            .get_or_try_init(|| async {
                let prefix = format!("{}{}.", INBOX_PREFIX, nuid::next());
                let mut subscriber = self.subscribe(format!("{}*", prefix)).await?;

                let requests = self.requests.clone();
                let token_offset = prefix.len();
                tokio::spawn(async move {
                    while let Some(message) = subscriber.next().await {
                        let Some(token) = message.subject.get(token_offset..) else {
                            continue;
                        };
                        // Late replies for timed out requests fall through
                        // here and are dropped.
                        let respond = requests.senders.lock().unwrap().remove(token);
                        if let Some(respond) = respond {
                            let _ = respond.send(message);
                        }
                    }
                });

                Ok::<String, Error>(prefix)
            })
            .await?;
        Ok(prefix.clone())
    }

    /// Sends a request over a single-use inbox subscription instead of the
    /// shared one.
    pub async fn request_old_style(
        &self,
        subject: String,
        payload: Bytes,
    ) -> Result<Message, Error> {
        let inbox = self.new_inbox();
        let mut subscriber = self.subscribe(inbox.clone()).await?;
        subscriber.unsubscribe_after(1).await?;
        self.publish_with_reply(subject, inbox, payload).await?;

        match tokio::time::timeout(self.request_timeout, subscriber.next()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(Box::new(ClientError::ConnectionClosed)),
            Err(_) => {
                let _ = subscriber.unsubscribe().await;
                Err(Box::new(ClientError::TimedOut))
            }
        }
    }

    /// Creates a new globally unique inbox subject usable for replies.
    pub fn new_inbox(&self) -> String {
        format!("{}{}", INBOX_PREFIX, nuid::next())
    }

    /// Subscribes to a subject, delivering messages through the returned
    /// [`Subscriber`] stream.
    pub async fn subscribe(&self, subject: String) -> Result<Subscriber, Error> {
        self.subscribe_inner(
            subject,
            None,
            self.pending_msgs_limit,
            self.pending_bytes_limit,
        )
        .await
    }

    /// Subscribes as part of a queue group; each message is delivered to one
    /// member of the group.
    pub async fn queue_subscribe(
        &self,
        subject: String,
        queue_group: String,
    ) -> Result<Subscriber, Error> {
        self.subscribe_inner(
            subject,
            Some(queue_group),
            self.pending_msgs_limit,
            self.pending_bytes_limit,
        )
        .await
    }

    /// Subscribes with explicit backpressure limits instead of the
    /// client-wide defaults. Messages beyond either pending limit are
    /// dropped and reported as a slow consumer.
    pub async fn subscribe_with_limits(
        &self,
        subject: String,
        queue_group: Option<String>,
        pending_msgs_limit: usize,
        pending_bytes_limit: usize,
    ) -> Result<Subscriber, Error> {
        self.subscribe_inner(
            subject,
            queue_group,
            pending_msgs_limit.max(1),
            pending_bytes_limit,
        )
        .await
    }

    /// Subscribes with a callback invoked for every delivered message from a
    /// dedicated task. Callback failures are reported through the error
    /// callback and do not tear the subscription down.
    pub async fn subscribe_with_callback<F>(
        &self,
        subject: String,
        callback: F,
    ) -> Result<CallbackSubscription, Error>
    where
        F: FnMut(Message) -> Result<(), Error> + Send + 'static,
    {
        let mut subscriber = self.subscribe(subject).await?;
        let sid = subscriber.sid;
        let error_callback = self.error_callback.clone();

        let handle = tokio::spawn(async move {
            let mut callback = callback;
            while let Some(message) = subscriber.next().await {
                if let Err(err) = callback(message) {
                    if let Some(error_callback) = &error_callback {
                        error_callback(ClientError::Callback(err.to_string()));
                    }
                }
            }
        });

        Ok(CallbackSubscription {
            sid,
            sender: self.sender.clone(),
            handle,
        })
    }

    async fn subscribe_inner(
        &self,
        subject: String,
        queue_group: Option<String>,
        pending_msgs_limit: usize,
        pending_bytes_limit: usize,
    ) -> Result<Subscriber, Error> {
        match self.connection_state() {
            ConnectionState::Closed => return Err(Box::new(ClientError::ConnectionClosed)),
            ConnectionState::DrainingSubscriptions | ConnectionState::DrainingPublishes => {
                return Err(Box::new(ClientError::ConnectionDraining))
            }
            _ => {}
        }
        if !is_valid_subject(&subject) {
            return Err(Box::new(ClientError::BadSubject));
        }

        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(pending_msgs_limit);
        let pending_bytes = Arc::new(AtomicUsize::new(0));

        self.sender
            .send(Command::Subscribe {
                sid,
                subject,
                queue_group,
                sender,
                pending_bytes: pending_bytes.clone(),
                pending_bytes_limit,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        Ok(Subscriber {
            sid,
            receiver,
            sender: self.sender.clone(),
            pending_bytes,
        })
    }

    /// Performs a `PING`/`PONG` round trip, ensuring that everything written
    /// so far reached the server.
    pub async fn flush(&self) -> Result<(), Error> {
        self.flush_timeout(Duration::from_secs(60)).await
    }

    /// Like [`Client::flush`] with an explicit timeout.
    pub async fn flush_timeout(&self, timeout: Duration) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Box::new(ClientError::ConnectionClosed));
        }

        let (respond, receiver) = oneshot::channel();
        self.sender
            .send(Command::Ping {
                respond: Some(respond),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Box::new(ClientError::ConnectionClosed)),
            Err(_) => Err(Box::new(ClientError::TimedOut)),
        }
    }

    /// Unsubscribes everything, flushes outstanding publishes and closes the
    /// connection. Subscribers keep yielding messages that were already
    /// buffered and then observe end of stream.
    pub async fn drain(&self) -> Result<(), Error> {
        match self.connection_state() {
            ConnectionState::Closed => return Err(Box::new(ClientError::ConnectionClosed)),
            ConnectionState::DrainingSubscriptions | ConnectionState::DrainingPublishes => {
                return Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                return Err(Box::new(ClientError::ConnectionReconnecting))
            }
            _ => {}
        }

        let (respond, receiver) = oneshot::channel();
        self.sender
            .send(Command::Drain { respond })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;

        match tokio::time::timeout(self.drain_timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Box::new(ClientError::ConnectionClosed)),
            Err(_) => Err(Box::new(ClientError::TimedOut)),
        }
    }

    /// Closes the connection. Pending operations fail with a closed
    /// connection error.
    pub async fn close(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        // A send failure means the handler is already gone.
        let _ = self.sender.send(Command::Close).await;
        Ok(())
    }
}

/// Retrieves messages from a subscription created by [`Client::subscribe`].
///
/// Implements [`futures::Stream`] for ergonomic processing:
///
/// ```no_run
/// # use futures::StreamExt;
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// # let client = async_gnat::connect("demo.nats.io").await?;
/// let mut subscriber = client.subscribe("events.>".into()).await?;
/// while let Some(message) = subscriber.next().await {
///     println!("{:?}", message);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Subscriber {
    pub(crate) sid: u64,
    receiver: mpsc::Receiver<Message>,
    sender: mpsc::Sender<Command>,
    pending_bytes: Arc<AtomicUsize>,
}

impl Subscriber {
    /// Removes interest immediately; messages already buffered remain
    /// readable from the stream.
    pub async fn unsubscribe(&mut self) -> Result<(), Error> {
        self.sender
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }

    /// Removes interest automatically after `limit` messages in total have
    /// been received.
    pub async fn unsubscribe_after(&mut self, limit: u64) -> Result<(), Error> {
        self.sender
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: Some(limit),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }

    /// Removes interest and waits for the server to process it, so that no
    /// further deliveries can arrive. Buffered messages remain readable.
    pub async fn drain(&mut self) -> Result<(), Error> {
        self.unsubscribe().await?;
        let (respond, receiver) = oneshot::channel();
        self.sender
            .send(Command::Ping {
                respond: Some(respond),
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        receiver
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }
}

impl Stream for Subscriber {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(message)) => {
                self.pending_bytes
                    .fetch_sub(message.payload.len(), Ordering::AcqRel);
                Poll::Ready(Some(message))
            }
            other => other,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // Best effort: the handler also prunes subscriptions whose receiver
        // is gone the next time a message arrives for them.
        let _ = self.sender.try_send(Command::Unsubscribe {
            sid: self.sid,
            max: None,
        });
    }
}

/// Handle for a callback-mode subscription created with
/// [`Client::subscribe_with_callback`].
pub struct CallbackSubscription {
    sid: u64,
    sender: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl CallbackSubscription {
    /// Removes interest; the callback task finishes once buffered messages
    /// have been dispatched.
    pub async fn unsubscribe(self) -> Result<(), Error> {
        self.sender
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(())
    }

    /// Waits for the callback task to finish; useful after draining.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

pub(crate) fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty() && subject.bytes().all(|c| (33..=126).contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_validation() {
        assert!(is_valid_subject("foo.bar"));
        assert!(is_valid_subject("foo.*.bar"));
        assert!(is_valid_subject("foo.>"));
        assert!(is_valid_subject("$JS.API.STREAM.NAMES"));
        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("foo bar"));
        assert!(!is_valid_subject("foo\nbar"));
    }
}
