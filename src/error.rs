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

use std::io;

/// Boxed error returned by most public operations.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The failure classes a client can run into.
///
/// Asynchronous failures (read loop, flusher, slow consumers) are delivered
/// through the error callback configured on [`ConnectOptions`][crate::ConnectOptions];
/// operations the caller initiated return them directly.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The server sent bytes that do not form a valid protocol operation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A control line exceeded the maximum permitted length.
    #[error("control line exceeds maximum length")]
    ControlLineExceeded,

    /// Too many unanswered pings, or EOF while connected.
    #[error("stale connection")]
    StaleConnection,

    /// The subject is empty or contains whitespace.
    #[error("invalid subject")]
    BadSubject,

    /// Payload is larger than the server-advertised `max_payload`.
    #[error("maximum payload exceeded")]
    MaxPayload,

    /// An operation did not complete within its allowed time.
    #[error("timed out")]
    TimedOut,

    /// The server pool has no candidates left to try.
    #[error("no servers remaining to connect to")]
    NoServers,

    /// The connection has been closed; no further operations are possible.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection is draining subscriptions or publishes.
    #[error("connection draining")]
    ConnectionDraining,

    /// The operation is not available while connecting or reconnecting.
    #[error("connection reconnecting")]
    ConnectionReconnecting,

    /// A subscription could not keep up and the message was dropped.
    #[error("slow consumer on subject {subject}, sid {sid}")]
    SlowConsumer { sid: u64, subject: String },

    /// The server rejected our credentials.
    #[error("authorization violation: {0}")]
    Authorization(String),

    /// The server sent `-ERR` outside of the handshake.
    #[error("server error: {0}")]
    ServerError(String),

    /// A subscription callback returned an error.
    #[error("subscription callback failed: {0}")]
    Callback(String),

    /// Dial, read or write failure on the underlying transport.
    #[error("I/O error: {0}")]
    Io(String),

    /// TLS upgrade or configuration failure.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        // Protocol failures travel through the I/O layer wrapped in an
        // `io::Error`; unwrap them back into their typed form.
        if let Some(inner) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<ClientError>())
        {
            return inner.clone();
        }
        match err.kind() {
            io::ErrorKind::TimedOut => ClientError::TimedOut,
            _ => ClientError::Io(err.to_string()),
        }
    }
}

impl From<ClientError> for io::Error {
    fn from(err: ClientError) -> Self {
        io::Error::new(io::ErrorKind::Other, err)
    }
}
