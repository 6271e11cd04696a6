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

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Error};
use crate::{connect_with_options, Client, ToServerAddrs};

pub(crate) type SignatureCallback =
    Arc<dyn Fn(&str) -> Result<Vec<u8>, Error> + Send + Sync + 'static>;
pub(crate) type UserJwtCallback = Arc<dyn Fn() -> Result<String, Error> + Send + Sync + 'static>;
pub(crate) type ErrorCallback = Arc<dyn Fn(ClientError) + Send + Sync + 'static>;
pub(crate) type EventCallback = Arc<dyn Fn() + Send + Sync + 'static>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RECONNECT_TIME_WAIT: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: i64 = 60;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
const DEFAULT_MAX_OUTSTANDING_PINGS: usize = 2;
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_PENDING_SIZE: usize = 1024 * 1024;
const DEFAULT_FLUSHER_QUEUE_SIZE: usize = 1024;
const DEFAULT_SUB_PENDING_MSGS_LIMIT: usize = 65536;
const DEFAULT_SUB_PENDING_BYTES_LIMIT: usize = 65536 * 1024;

/// Connect options. Used to connect with a server while setting up
/// authentication, timers, reconnection behavior and asynchronous callbacks.
///
/// # Examples
///
/// ```no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), async_gnat::Error> {
/// let client = async_gnat::ConnectOptions::new()
///     .ping_interval(std::time::Duration::from_secs(30))
///     .connect("demo.nats.io")
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) name: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) pedantic: bool,
    pub(crate) no_echo: bool,
    pub(crate) allow_reconnect: bool,
    pub(crate) dont_randomize: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) reconnect_time_wait: Duration,
    pub(crate) max_reconnect_attempts: i64,
    pub(crate) ping_interval: Duration,
    pub(crate) max_outstanding_pings: usize,
    pub(crate) drain_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) pending_size: usize,
    pub(crate) flusher_queue_size: usize,
    pub(crate) subscription_pending_msgs_limit: usize,
    pub(crate) subscription_pending_bytes_limit: usize,

    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) nkey: Option<String>,
    pub(crate) signature_callback: Option<SignatureCallback>,
    pub(crate) user_jwt_callback: Option<UserJwtCallback>,

    pub(crate) tls_required: bool,
    pub(crate) tls_hostname: Option<String>,
    pub(crate) certificates: Vec<PathBuf>,
    pub(crate) tls_client_config: Option<crate::rustls::ClientConfig>,

    pub(crate) error_callback: Option<ErrorCallback>,
    pub(crate) disconnect_callback: Option<EventCallback>,
    pub(crate) reconnect_callback: Option<EventCallback>,
    pub(crate) close_callback: Option<EventCallback>,
    pub(crate) discovered_server_callback: Option<EventCallback>,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            name: None,
            verbose: false,
            pedantic: false,
            no_echo: false,
            allow_reconnect: true,
            dont_randomize: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_time_wait: DEFAULT_RECONNECT_TIME_WAIT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_outstanding_pings: DEFAULT_MAX_OUTSTANDING_PINGS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pending_size: DEFAULT_PENDING_SIZE,
            flusher_queue_size: DEFAULT_FLUSHER_QUEUE_SIZE,
            subscription_pending_msgs_limit: DEFAULT_SUB_PENDING_MSGS_LIMIT,
            subscription_pending_bytes_limit: DEFAULT_SUB_PENDING_BYTES_LIMIT,
            user: None,
            password: None,
            token: None,
            nkey: None,
            signature_callback: None,
            user_jwt_callback: None,
            tls_required: false,
            tls_hostname: None,
            certificates: Vec::new(),
            tls_client_config: None,
            error_callback: None,
            disconnect_callback: None,
            reconnect_callback: None,
            close_callback: None,
            discovered_server_callback: None,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("name", &self.name)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("no_echo", &self.no_echo)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("dont_randomize", &self.dont_randomize)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_time_wait", &self.reconnect_time_wait)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("ping_interval", &self.ping_interval)
            .field("max_outstanding_pings", &self.max_outstanding_pings)
            .field("tls_required", &self.tls_required)
            .field("tls_hostname", &self.tls_hostname)
            .finish_non_exhaustive()
    }
}

impl ConnectOptions {
    pub fn new() -> ConnectOptions {
        ConnectOptions::default()
    }

    /// Connects with the options applied.
    pub async fn connect<A: ToServerAddrs>(self, addrs: A) -> Result<Client, Error> {
        connect_with_options(addrs, self).await
    }

    /// Sets the client name forwarded in `CONNECT`.
    pub fn name<S: ToString>(mut self, name: S) -> ConnectOptions {
        self.name = Some(name.to_string());
        self
    }

    /// Turns on `+OK` protocol acknowledgements.
    pub fn verbose(mut self, verbose: bool) -> ConnectOptions {
        self.verbose = verbose;
        self
    }

    /// Turns on additional strict format checking on the server side.
    pub fn pedantic(mut self, pedantic: bool) -> ConnectOptions {
        self.pedantic = pedantic;
        self
    }

    /// Requests that the server does not echo this client's own publishes
    /// back to its subscriptions.
    pub fn no_echo(mut self) -> ConnectOptions {
        self.no_echo = true;
        self
    }

    /// Enables or disables the reconnect loop. Enabled by default.
    pub fn allow_reconnect(mut self, allow: bool) -> ConnectOptions {
        self.allow_reconnect = allow;
        self
    }

    /// Keeps the server pool in the given order instead of shuffling it.
    pub fn dont_randomize(mut self) -> ConnectOptions {
        self.dont_randomize = true;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> ConnectOptions {
        self.connect_timeout = timeout;
        self
    }

    /// Time to wait before retrying an endpoint that failed recently.
    pub fn reconnect_time_wait(mut self, wait: Duration) -> ConnectOptions {
        self.reconnect_time_wait = wait;
        self
    }

    /// Attempts after which a pool entry is discarded. Negative values keep
    /// retrying forever.
    pub fn max_reconnect_attempts(mut self, attempts: i64) -> ConnectOptions {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> ConnectOptions {
        self.ping_interval = interval;
        self
    }

    /// Unanswered pings after which the connection is considered stale.
    pub fn max_outstanding_pings(mut self, max: usize) -> ConnectOptions {
        self.max_outstanding_pings = max;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> ConnectOptions {
        self.drain_timeout = timeout;
        self
    }

    /// Default timeout applied to [`Client::request`][crate::Client::request].
    pub fn request_timeout(mut self, timeout: Duration) -> ConnectOptions {
        self.request_timeout = timeout;
        self
    }

    /// Number of buffered outgoing bytes after which the flusher is forced.
    pub fn pending_size(mut self, size: usize) -> ConnectOptions {
        self.pending_size = size;
        self
    }

    /// Capacity of the internal command queue feeding the flusher.
    pub fn flusher_queue_size(mut self, size: usize) -> ConnectOptions {
        self.flusher_queue_size = size.max(1);
        self
    }

    /// Per-subscription pending message limit used by new subscriptions.
    pub fn subscription_pending_msgs_limit(mut self, limit: usize) -> ConnectOptions {
        self.subscription_pending_msgs_limit = limit.max(1);
        self
    }

    /// Per-subscription pending byte limit used by new subscriptions.
    pub fn subscription_pending_bytes_limit(mut self, limit: usize) -> ConnectOptions {
        self.subscription_pending_bytes_limit = limit;
        self
    }

    /// Authenticates with a username and password.
    pub fn user_and_password<S: ToString>(mut self, user: S, password: S) -> ConnectOptions {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Authenticates with a static token.
    pub fn token<S: ToString>(mut self, token: S) -> ConnectOptions {
        self.token = Some(token.to_string());
        self
    }

    /// Authenticates by signing the server nonce with the given nkey seed.
    pub fn nkey<S: ToString>(mut self, seed: S) -> ConnectOptions {
        self.nkey = Some(seed.to_string());
        self
    }

    /// Installs a callback that signs the server-provided nonce. Takes
    /// precedence over every other authentication variant.
    pub fn signature_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn(&str) -> Result<Vec<u8>, Error> + Send + Sync + 'static,
    {
        self.signature_callback = Some(Arc::new(callback));
        self
    }

    /// Installs a callback that provides the account-signed user JWT sent
    /// alongside the nonce signature.
    pub fn user_jwt_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn() -> Result<String, Error> + Send + Sync + 'static,
    {
        self.user_jwt_callback = Some(Arc::new(callback));
        self
    }

    /// Requires a TLS connection even when the server does not advertise it.
    pub fn require_tls(mut self, required: bool) -> ConnectOptions {
        self.tls_required = required;
        self
    }

    /// Overrides the hostname used for certificate verification.
    pub fn tls_hostname<S: ToString>(mut self, hostname: S) -> ConnectOptions {
        self.tls_hostname = Some(hostname.to_string());
        self
    }

    /// Adds a PEM file with additional root certificates.
    pub fn add_root_certificates(mut self, path: PathBuf) -> ConnectOptions {
        self.certificates.push(path);
        self
    }

    /// Uses the given rustls configuration instead of building one.
    pub fn tls_client_config(mut self, config: crate::rustls::ClientConfig) -> ConnectOptions {
        self.tls_client_config = Some(config);
        self
    }

    /// Called for asynchronous errors: read loop and flusher failures, slow
    /// consumers and server `-ERR` operations.
    pub fn error_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn(ClientError) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    /// Called when the connection to the current server is lost.
    pub fn disconnect_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.disconnect_callback = Some(Arc::new(callback));
        self
    }

    /// Called after the connection has been re-established.
    pub fn reconnect_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reconnect_callback = Some(Arc::new(callback));
        self
    }

    /// Called once the connection reaches its final closed state.
    pub fn close_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close_callback = Some(Arc::new(callback));
        self
    }

    /// Called when server gossip adds new endpoints to the pool after the
    /// initial connect.
    pub fn discovered_server_callback<F>(mut self, callback: F) -> ConnectOptions
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.discovered_server_callback = Some(Arc::new(callback));
        self
    }
}
