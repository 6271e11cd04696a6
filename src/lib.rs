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

//! An async Rust client for NATS-compatible messaging servers.
//!
//! The client maintains a single long-lived connection over which publishes,
//! subscriptions, request/reply exchanges and the JetStream persistence API
//! are multiplexed. Lost connections are re-established from a cluster-aware
//! server pool and live subscriptions are replayed transparently.
//!
//! ## Examples
//!
//! ### Publish and subscribe
//!
//! ```no_run
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), async_gnat::Error> {
//! let client = async_gnat::connect("demo.nats.io").await?;
//! let mut subscriber = client.subscribe("foo".into()).await?;
//!
//! for _ in 0..10 {
//!     client.publish("foo".into(), "data".into()).await?;
//! }
//!
//! while let Some(message) = subscriber.next().await {
//!     println!("received: {:?}", message);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Request/reply
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), async_gnat::Error> {
//! let client = async_gnat::connect("demo.nats.io").await?;
//! let response = client.request("service.echo".into(), "ping".into()).await?;
//! println!("reply: {:?}", response.payload);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::iter;
use std::option;
use std::slice;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{select, FutureExt};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tokio::io;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task;
use url::Url;

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");
pub(crate) const LANG: &str = "rust";

/// A re-export of the `rustls` crate used in this crate, for use in cases
/// where a manual client configuration must be provided through
/// [`ConnectOptions::tls_client_config`].
pub use tokio_rustls::rustls;

mod client;
mod connection;
mod connector;
mod error;
pub mod header;
pub mod jetstream;
mod options;
mod tls;

pub use client::{CallbackSubscription, Client, Subscriber};
pub use error::{ClientError, Error};
pub use header::{HeaderMap, HeaderName, HeaderValue};
pub use options::ConnectOptions;

use connection::{ClientOp, Connection, ServerOp};
use connector::Connector;

/// Information sent by the server back to this client during initial
/// connection, and possibly again later.
#[allow(unused)]
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerInfo {
    /// The unique identifier of the server.
    #[serde(default)]
    pub server_id: String,
    /// Generated server name.
    #[serde(default)]
    pub server_name: String,
    /// The host the server runs on.
    #[serde(default)]
    pub host: String,
    /// The port the server runs on.
    #[serde(default)]
    pub port: u16,
    /// The server version.
    #[serde(default)]
    pub version: String,
    /// Whether the client should try to authenticate.
    #[serde(default)]
    pub auth_required: bool,
    /// Whether the server requires TLS.
    #[serde(default)]
    pub tls_required: bool,
    /// Maximum payload size the server accepts.
    #[serde(default)]
    pub max_payload: usize,
    /// The protocol version in use.
    #[serde(default)]
    pub proto: i8,
    /// The server-assigned client id. May change during reconnection.
    #[serde(default)]
    pub client_id: u64,
    /// The version of golang the server was built with.
    #[serde(default)]
    pub go: String,
    /// The nonce to sign when authenticating with nkeys.
    #[serde(default)]
    pub nonce: String,
    /// A list of gossiped peer urls the client can connect to.
    #[serde(default)]
    pub connect_urls: Vec<String>,
    /// The client IP as known by the server.
    #[serde(default)]
    pub client_ip: String,
    /// Whether the server supports message headers.
    #[serde(default)]
    pub headers: bool,
    /// Whether the server is in lame duck mode.
    #[serde(default)]
    pub lame_duck_mode: bool,
}

/// State of the connection, tracked through the client lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    DrainingSubscriptions,
    DrainingPublishes,
    Closed,
}

/// A message received on a subject.
#[derive(Clone, Debug)]
pub struct Message {
    /// The subject the message was published to.
    pub subject: String,
    /// Optional subject a response should be published to.
    pub reply: Option<String>,
    /// The raw payload bytes.
    pub payload: Bytes,
    /// Optional headers, including inline status entries.
    pub headers: Option<HeaderMap>,
    /// The subscription that delivered this message.
    pub sid: u64,
}

impl Message {
    /// Returns the inline status code carried in the headers, if any.
    pub fn status(&self) -> Option<u16> {
        self.headers
            .as_ref()?
            .get(header::STATUS)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Returns the inline status description carried in the headers, if any.
    pub fn description(&self) -> Option<&str> {
        self.headers.as_ref()?.get(header::DESCRIPTION)?.to_str().ok()
    }

    /// Whether this message is the server's "no responders" notification
    /// for a request nobody was subscribed to.
    pub fn is_no_responders(&self) -> bool {
        self.payload.is_empty() && self.status() == Some(header::NO_RESPONDERS)
    }
}

/// Connection counters.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    pub(crate) in_msgs: AtomicU64,
    pub(crate) out_msgs: AtomicU64,
    pub(crate) in_bytes: AtomicU64,
    pub(crate) out_bytes: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

/// A point-in-time snapshot of the connection counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStatistics {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

/// Commands sent from [`Client`] handles to the connection handler.
#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
    Subscribe {
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        sender: mpsc::Sender<Message>,
        pending_bytes: Arc<AtomicUsize>,
        pending_bytes_limit: usize,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    Ping {
        respond: Option<oneshot::Sender<()>>,
    },
    Drain {
        respond: oneshot::Sender<()>,
    },
    Close,
}

struct SubscriptionEntry {
    subject: String,
    queue_group: Option<String>,
    sender: mpsc::Sender<Message>,
    max_msgs: Option<u64>,
    received: u64,
    pending_bytes: Arc<AtomicUsize>,
    pending_bytes_limit: usize,
}

enum HandlerFlow {
    Continue,
    Closed,
}

enum Removal {
    No,
    CapReached,
    ReceiverDropped,
}

/// Owns the socket, the subscription registry and the server pool. Runs as a
/// single background task per connected client.
struct ConnectionHandler {
    connection: Connection,
    connector: Connector,
    subscriptions: HashMap<u64, SubscriptionEntry>,
    pongs: VecDeque<Option<oneshot::Sender<()>>>,
    pings_outstanding: usize,
    info_sender: watch::Sender<ServerInfo>,
    state_sender: watch::Sender<ConnectionState>,
    statistics: Arc<Statistics>,
}

impl ConnectionHandler {
    async fn process(&mut self, mut receiver: mpsc::Receiver<Command>) {
        let period = self.connector.options.ping_interval;
        let mut ping_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ping_interval.tick().fuse() => {
                    self.pings_outstanding += 1;
                    if self.pings_outstanding > self.connector.options.max_outstanding_pings {
                        if !self.handle_disconnect(ClientError::StaleConnection).await {
                            break;
                        }
                    } else {
                        self.pongs.push_back(None);
                        if self.connection.write_op(&ClientOp::Ping).is_err() {
                            continue;
                        }
                        if let Err(err) = self.connection.flush().await {
                            if !self.handle_disconnect(err.into()).await {
                                break;
                            }
                        }
                    }
                }
                maybe_command = receiver.recv().fuse() => {
                    let command = match maybe_command {
                        Some(command) => command,
                        None => {
                            // Every client handle is gone.
                            self.close_connection().await;
                            break;
                        }
                    };
                    match self.handle_commands(command, &mut receiver).await {
                        Ok(HandlerFlow::Continue) => {}
                        Ok(HandlerFlow::Closed) => {
                            self.close_connection().await;
                            break;
                        }
                        Err(err) => {
                            if !self.handle_disconnect(err.into()).await {
                                break;
                            }
                        }
                    }
                }
                result = self.connection.read_op().fuse() => {
                    match result {
                        Ok(Some(op)) => {
                            if let Err(err) = self.handle_server_op(op).await {
                                if !self.handle_disconnect(err.into()).await {
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            // EOF while connected.
                            if !self.handle_disconnect(ClientError::StaleConnection).await {
                                break;
                            }
                        }
                        Err(err) => {
                            if !self.handle_disconnect(err.into()).await {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handles a batch of queued commands, flushing when the queue is
    /// momentarily empty or the pending buffer grows past `pending_size`.
    async fn handle_commands(
        &mut self,
        first: Command,
        receiver: &mut mpsc::Receiver<Command>,
    ) -> Result<HandlerFlow, io::Error> {
        let pending_size = self.connector.options.pending_size;

        let mut flow = self.handle_command(first).await?;
        while matches!(flow, HandlerFlow::Continue) {
            if self.connection.pending_len() > pending_size {
                self.connection.flush().await?;
            }
            match receiver.try_recv() {
                Ok(command) => flow = self.handle_command(command).await?,
                Err(_) => break,
            }
        }
        if matches!(flow, HandlerFlow::Closed) {
            return Ok(flow);
        }

        self.connection.flush().await?;
        Ok(HandlerFlow::Continue)
    }

    async fn handle_command(&mut self, command: Command) -> Result<HandlerFlow, io::Error> {
        match command {
            Command::Publish {
                subject,
                reply,
                headers,
                payload,
            } => {
                self.statistics.out_msgs.fetch_add(1, Ordering::Relaxed);
                self.statistics
                    .out_bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                self.connection.write_op(&ClientOp::Publish {
                    subject,
                    reply,
                    headers,
                    payload,
                })?;
            }
            Command::Subscribe {
                sid,
                subject,
                queue_group,
                sender,
                pending_bytes,
                pending_bytes_limit,
            } => {
                self.subscriptions.insert(
                    sid,
                    SubscriptionEntry {
                        subject: subject.clone(),
                        queue_group: queue_group.clone(),
                        sender,
                        max_msgs: None,
                        received: 0,
                        pending_bytes,
                        pending_bytes_limit,
                    },
                );
                self.connection.write_op(&ClientOp::Subscribe {
                    sid,
                    subject,
                    queue_group,
                })?;
            }
            Command::Unsubscribe { sid, max } => {
                // A limit of zero or one that is already met removes the
                // subscription outright; otherwise the cap is recorded and
                // the message path removes it once reached.
                let residual_cap = match self.subscriptions.get_mut(&sid) {
                    None => return Ok(HandlerFlow::Continue),
                    Some(subscription) => match max {
                        Some(max) if max > 0 && subscription.received < max => {
                            subscription.max_msgs = Some(max);
                            Some(max)
                        }
                        _ => None,
                    },
                };
                match residual_cap {
                    Some(max) => {
                        self.connection
                            .write_op(&ClientOp::Unsubscribe { sid, max: Some(max) })?;
                    }
                    None => {
                        self.subscriptions.remove(&sid);
                        self.connection
                            .write_op(&ClientOp::Unsubscribe { sid, max: None })?;
                    }
                }
            }
            Command::Ping { respond } => {
                self.pongs.push_back(respond);
                self.connection.write_op(&ClientOp::Ping)?;
                self.connection.flush().await?;
            }
            Command::Drain { respond } => {
                let _ = self.state_sender.send(ConnectionState::DrainingSubscriptions);
                let sids: Vec<u64> = self.subscriptions.keys().copied().collect();
                for sid in sids {
                    self.connection
                        .write_op(&ClientOp::Unsubscribe { sid, max: None })?;
                }
                // Dropping the senders lets every subscriber consume what is
                // already buffered and then observe end of stream.
                self.subscriptions.clear();
                let _ = self.state_sender.send(ConnectionState::DrainingPublishes);
                self.connection.flush().await?;
                let _ = respond.send(());
                return Ok(HandlerFlow::Closed);
            }
            Command::Close => return Ok(HandlerFlow::Closed),
        }

        Ok(HandlerFlow::Continue)
    }

    async fn handle_server_op(&mut self, op: ServerOp) -> Result<(), io::Error> {
        match op {
            ServerOp::Ping => {
                self.connection.write_op(&ClientOp::Pong)?;
                self.connection.flush().await?;
            }
            ServerOp::Pong => {
                self.pings_outstanding = 0;
                if let Some(Some(respond)) = self.pongs.pop_front() {
                    let _ = respond.send(());
                }
            }
            ServerOp::Ok => {}
            ServerOp::Info(info) => {
                let added = self.connector.merge_connect_urls(&info);
                let _ = self.info_sender.send(*info);
                if added > 0 {
                    tracing::debug!(count = added, "discovered servers through gossip");
                    if let Some(callback) = &self.connector.options.discovered_server_callback {
                        callback();
                    }
                }
            }
            ServerOp::Error(reason) => {
                let normalized = reason.to_lowercase();
                if normalized.contains("stale connection") {
                    return Err(ClientError::StaleConnection.into());
                }
                let error = if normalized.contains("authorization violation") {
                    ClientError::Authorization(reason)
                } else {
                    ClientError::ServerError(reason)
                };
                if normalized.contains("permissions violation") {
                    // The server keeps the connection open for these.
                    self.call_error(error);
                } else {
                    self.call_error(error.clone());
                    return Err(error.into());
                }
            }
            ServerOp::Message {
                sid,
                subject,
                reply,
                headers,
                payload,
            } => self.handle_message(sid, subject, reply, headers, payload),
        }

        Ok(())
    }

    fn handle_message(
        &mut self,
        sid: u64,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) {
        self.statistics.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.statistics
            .in_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let (dropped_subject, removal) = match self.subscriptions.get_mut(&sid) {
            // Unknown sid: the subscription raced an unsubscribe. Discard.
            None => return,
            Some(subscription) => {
                subscription.received += 1;
                let removal = if subscription
                    .max_msgs
                    .map_or(false, |max| subscription.received >= max)
                {
                    Removal::CapReached
                } else {
                    Removal::No
                };

                let payload_len = payload.len();
                let over_bytes = subscription.pending_bytes_limit > 0
                    && subscription.pending_bytes.load(Ordering::Acquire) + payload_len
                        > subscription.pending_bytes_limit;
                if over_bytes {
                    (Some(subscription.subject.clone()), removal)
                } else {
                    subscription
                        .pending_bytes
                        .fetch_add(payload_len, Ordering::AcqRel);
                    let message = Message {
                        subject,
                        reply,
                        payload,
                        headers,
                        sid,
                    };
                    match subscription.sender.try_send(message) {
                        Ok(()) => (None, removal),
                        Err(mpsc::error::TrySendError::Full(message)) => {
                            subscription
                                .pending_bytes
                                .fetch_sub(message.payload.len(), Ordering::AcqRel);
                            (Some(subscription.subject.clone()), removal)
                        }
                        Err(mpsc::error::TrySendError::Closed(message)) => {
                            subscription
                                .pending_bytes
                                .fetch_sub(message.payload.len(), Ordering::AcqRel);
                            (None, Removal::ReceiverDropped)
                        }
                    }
                }
            }
        };

        if let Some(subject) = dropped_subject {
            self.call_error(ClientError::SlowConsumer { sid, subject });
        }
        match removal {
            Removal::No => {}
            Removal::CapReached => {
                self.subscriptions.remove(&sid);
            }
            Removal::ReceiverDropped => {
                self.subscriptions.remove(&sid);
                let _ = self
                    .connection
                    .write_op(&ClientOp::Unsubscribe { sid, max: None });
            }
        }
    }

    /// Reacts to a broken transport: report, then reconnect or close.
    /// Returns whether the connection was recovered.
    async fn handle_disconnect(&mut self, error: ClientError) -> bool {
        tracing::warn!(error = %error, "connection lost");
        self.call_error(error);

        if !self.connector.options.allow_reconnect {
            self.close_connection().await;
            return false;
        }

        match self.reconnect().await {
            Ok(()) => true,
            Err(err) => {
                self.call_error(err);
                self.close_connection().await;
                false
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ClientError> {
        let _ = self.state_sender.send(ConnectionState::Reconnecting);
        if let Some(callback) = &self.connector.options.disconnect_callback {
            callback();
        }

        // The parser is reset by abandoning the old connection wholesale;
        // bytes that were serialized but never written are replayed below.
        let pending = self.connection.take_pending();
        self.pongs.clear();
        self.pings_outstanding = 0;

        loop {
            let (info, connection) = self.connector.connect().await?;
            self.connection = connection;
            let _ = self.info_sender.send(*info);

            // Subscriptions whose cap is already exhausted are dropped, the
            // rest are re-advertised with their residual limits.
            self.subscriptions
                .retain(|_, subscription| {
                    subscription
                        .max_msgs
                        .map_or(true, |max| subscription.received < max)
                });
            match self.replay(&pending).await {
                Ok(()) => break,
                Err(err) => {
                    self.call_error(err.into());
                    continue;
                }
            }
        }

        let _ = self.state_sender.send(ConnectionState::Connected);
        self.statistics.reconnects.fetch_add(1, Ordering::Relaxed);
        tracing::info!("reconnected");
        if let Some(callback) = &self.connector.options.reconnect_callback {
            callback();
        }
        Ok(())
    }

    async fn replay(&mut self, pending: &[u8]) -> Result<(), io::Error> {
        for (sid, subscription) in &self.subscriptions {
            self.connection.write_op(&ClientOp::Subscribe {
                sid: *sid,
                subject: subscription.subject.clone(),
                queue_group: subscription.queue_group.clone(),
            })?;
            if let Some(max) = subscription.max_msgs {
                let remaining = max - subscription.received;
                self.connection.write_op(&ClientOp::Unsubscribe {
                    sid: *sid,
                    max: Some(remaining),
                })?;
            }
        }
        self.connection.write_buffer.extend_from_slice(pending);
        self.connection.flush().await
    }

    async fn close_connection(&mut self) {
        let _ = self.state_sender.send(ConnectionState::Closed);
        // Dropping pending pongs and subscription senders completes every
        // waiting handle with a closed-connection failure.
        self.pongs.clear();
        self.subscriptions.clear();
        let _ = self.connection.flush().await;
        tracing::debug!("connection closed");
        if let Some(callback) = &self.connector.options.disconnect_callback {
            callback();
        }
        if let Some(callback) = &self.connector.options.close_callback {
            callback();
        }
    }

    fn call_error(&self, error: ClientError) {
        tracing::debug!(error = %error, "asynchronous client error");
        if let Some(callback) = &self.connector.options.error_callback {
            callback(error);
        }
    }
}

/// Connects to a server with the given options.
///
/// # Examples
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// let client = async_gnat::connect_with_options(
///     "demo.nats.io",
///     async_gnat::ConnectOptions::new().no_echo(),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect_with_options<A: ToServerAddrs>(
    addrs: A,
    options: ConnectOptions,
) -> Result<Client, Error> {
    let addrs: Vec<ServerAddr> = addrs.to_server_addrs()?.collect();
    if addrs.is_empty() {
        return Err(Box::new(ClientError::NoServers));
    }

    let mut connector = Connector::new(addrs, options.clone());

    let (state_sender, state_watch) = watch::channel(ConnectionState::Connecting);
    let (info_sender, info_watch) = watch::channel(ServerInfo::default());
    let statistics = Arc::new(Statistics::default());

    let (info, connection) = connector.connect().await?;
    let _ = info_sender.send(*info);
    let _ = state_sender.send(ConnectionState::Connected);

    let (sender, receiver) = mpsc::channel(options.flusher_queue_size);
    let client = Client::new(
        sender,
        state_watch,
        info_watch,
        statistics.clone(),
        &options,
    );

    let mut handler = ConnectionHandler {
        connection,
        connector,
        subscriptions: HashMap::new(),
        pongs: VecDeque::new(),
        pings_outstanding: 0,
        info_sender,
        state_sender,
        statistics,
    };
    task::spawn(async move { handler.process(receiver).await });

    Ok(client)
}

/// Connects to a server with the default options.
///
/// # Examples
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// let client = async_gnat::connect("demo.nats.io").await?;
/// client.publish("test".into(), "data".into()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn connect<A: ToServerAddrs>(addrs: A) -> Result<Client, Error> {
    connect_with_options(addrs, ConnectOptions::default()).await
}

/// Info to construct a CONNECT message.
#[derive(Clone, Debug, Serialize)]
#[doc(hidden)]
pub struct ConnectInfo {
    /// Turns on +OK protocol acknowledgements.
    pub verbose: bool,

    /// Turns on additional strict format checking, e.g. for properly formed
    /// subjects.
    pub pedantic: bool,

    /// User's JWT.
    #[serde(rename = "jwt", skip_serializing_if = "Option::is_none")]
    pub user_jwt: Option<String>,

    /// Public nkey.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,

    /// Signed nonce, encoded to Base64URL.
    #[serde(rename = "sig", skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Optional client name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// If set to `false`, the server will not send originating messages from
    /// this connection to its own subscriptions.
    pub echo: bool,

    /// The implementation language of the client.
    pub lang: String,

    /// The version of the client.
    pub version: String,

    /// Sending 0 (or absent) indicates client supports original protocol.
    /// Sending 1 indicates that the client supports dynamic reconfiguration
    /// of cluster topology changes by asynchronously receiving INFO messages
    /// with known servers it can reconnect to.
    pub protocol: Protocol,

    /// Indicates whether the client requires an SSL connection.
    pub tls_required: bool,

    /// Connection username (if `auth_required` is set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Connection password (if `auth_required` is set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,

    /// Client authorization token (if `auth_required` is set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Whether the client supports the usage of headers.
    pub headers: bool,

    /// Whether the client supports no_responders.
    pub no_responders: bool,
}

/// Protocol version used by the client.
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u8)]
pub enum Protocol {
    /// Original protocol.
    Original = 0,
    /// Protocol with dynamic reconfiguration of cluster and lame duck mode
    /// functionality.
    Dynamic = 1,
}

/// Address of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr(Url);

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_ref())
    }
}

impl FromStr for ServerAddr {
    type Err = io::Error;

    /// Parse an address of a server.
    ///
    /// If not stated explicitly the `nats://` scheme and port `4222` are
    /// assumed.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url: Url = if input.contains("://") {
            input.parse()
        } else {
            format!("nats://{}", input).parse()
        }
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("server URL is invalid: {}", e),
            )
        })?;

        Self::from_url(url)
    }
}

impl ServerAddr {
    /// Check if the URL is a valid server address.
    pub fn from_url(url: Url) -> io::Result<Self> {
        if url.scheme() != "nats" && url.scheme() != "tls" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid scheme for server URL: {}", url.scheme()),
            ));
        }
        if url.host_str().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "missing hostname in server URL",
            ));
        }

        Ok(Self(url))
    }

    /// Turn the server address into a standard URL.
    pub fn into_inner(self) -> Url {
        self.0
    }

    /// Returns if tls is required by the client for this server.
    pub fn tls_required(&self) -> bool {
        self.0.scheme() == "tls"
    }

    /// Returns if the server url had embedded username and password.
    pub fn has_user_pass(&self) -> bool {
        self.0.username() != ""
    }

    /// Returns the host.
    pub fn host(&self) -> &str {
        // Validated during construction.
        self.0.host_str().unwrap_or_default()
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.0.port().unwrap_or(4222)
    }

    /// Returns the optional username in the url.
    pub fn username(&self) -> Option<String> {
        let user = self.0.username();
        if user.is_empty() {
            None
        } else {
            Some(user.to_string())
        }
    }

    /// Returns the optional password in the url.
    pub fn password(&self) -> Option<String> {
        self.0.password().map(|password| password.to_string())
    }
}

/// Capability to convert into a list of server addresses.
///
/// There are several implementations ensuring the easy passing of one or more
/// server addresses to functions like [`crate::connect()`].
pub trait ToServerAddrs {
    /// Returned iterator over socket addresses which this type may correspond
    /// to.
    type Iter: Iterator<Item = ServerAddr>;

    fn to_server_addrs(&self) -> io::Result<Self::Iter>;
}

impl ToServerAddrs for ServerAddr {
    type Iter = option::IntoIter<ServerAddr>;
    fn to_server_addrs(&self) -> io::Result<Self::Iter> {
        Ok(Some(self.clone()).into_iter())
    }
}

impl ToServerAddrs for str {
    type Iter = option::IntoIter<ServerAddr>;
    fn to_server_addrs(&self) -> io::Result<Self::Iter> {
        self.parse::<ServerAddr>()
            .map(|addr| Some(addr).into_iter())
    }
}

impl ToServerAddrs for String {
    type Iter = option::IntoIter<ServerAddr>;
    fn to_server_addrs(&self) -> io::Result<Self::Iter> {
        (**self).to_server_addrs()
    }
}

impl<'a> ToServerAddrs for &'a [ServerAddr] {
    type Iter = iter::Cloned<slice::Iter<'a, ServerAddr>>;

    fn to_server_addrs(&self) -> io::Result<Self::Iter> {
        Ok(self.iter().cloned())
    }
}

impl<T: ToServerAddrs + ?Sized> ToServerAddrs for &T {
    type Iter = T::Iter;
    fn to_server_addrs(&self) -> io::Result<Self::Iter> {
        (**self).to_server_addrs()
    }
}
