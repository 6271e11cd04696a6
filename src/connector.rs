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

use std::net::IpAddr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;

use crate::connection::{ClientOp, Connection, ServerOp};
use crate::error::ClientError;
use crate::options::ConnectOptions;
use crate::{tls, ConnectInfo, Protocol, ServerAddr, ServerInfo, LANG, VERSION};

/// Bookkeeping for one candidate endpoint in the server pool.
#[derive(Clone, Debug)]
pub(crate) struct Srv {
    pub(crate) addr: ServerAddr,
    pub(crate) attempts: usize,
    pub(crate) last_attempt: Option<Instant>,
    pub(crate) discovered: bool,
    /// Hostname to verify the TLS certificate against when the endpoint
    /// itself was advertised as a bare IP.
    pub(crate) tls_name: Option<String>,
}

impl Srv {
    fn new(addr: ServerAddr) -> Srv {
        Srv {
            addr,
            attempts: 0,
            last_attempt: None,
            discovered: false,
            tls_name: None,
        }
    }
}

/// Owns the candidate pool and establishes connections, including the TLS
/// upgrade and the `INFO`/`CONNECT`/`PING`/`PONG` handshake.
pub(crate) struct Connector {
    servers: Vec<Srv>,
    pub(crate) options: ConnectOptions,
    current: Option<Srv>,
}

impl Connector {
    pub(crate) fn new(addrs: Vec<ServerAddr>, options: ConnectOptions) -> Connector {
        let mut servers: Vec<Srv> = addrs.into_iter().map(Srv::new).collect();
        if !options.dont_randomize {
            servers.shuffle(&mut rand::thread_rng());
        }
        Connector {
            servers,
            options,
            current: None,
        }
    }

    /// Rotates through the pool until a handshake succeeds.
    ///
    /// Entries whose attempt count exceeds `max_reconnect_attempts` are
    /// discarded; an empty pool fails with [`ClientError::NoServers`]. With
    /// reconnecting disabled the first failure is returned directly.
    pub(crate) async fn connect(&mut self) -> Result<(Box<ServerInfo>, Connection), ClientError> {
        loop {
            if self.servers.is_empty() {
                return Err(ClientError::NoServers);
            }

            let mut srv = self.servers.remove(0);
            if self.options.max_reconnect_attempts >= 0
                && srv.attempts > self.options.max_reconnect_attempts as usize
            {
                tracing::debug!(server = %srv.addr, "discarding exhausted server");
                continue;
            }

            if let Some(last_attempt) = srv.last_attempt {
                let elapsed = last_attempt.elapsed();
                if elapsed < self.options.reconnect_time_wait {
                    sleep(self.options.reconnect_time_wait - elapsed).await;
                }
            }
            srv.last_attempt = Some(Instant::now());

            match self.try_connect(&srv).await {
                Ok((info, connection)) => {
                    srv.attempts = 0;
                    self.current = Some(srv.clone());
                    self.servers.push(srv);
                    self.merge_connect_urls(&info);
                    return Ok((info, connection));
                }
                Err(err) => {
                    tracing::debug!(server = %srv.addr, error = %err, "connect attempt failed");
                    srv.attempts += 1;
                    self.servers.push(srv);
                    if let Some(callback) = &self.options.error_callback {
                        callback(err.clone());
                    }
                    if !self.options.allow_reconnect {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn try_connect(
        &self,
        srv: &Srv,
    ) -> Result<(Box<ServerInfo>, Connection), ClientError> {
        let connect_timeout = self.options.connect_timeout;

        let tcp_stream = timeout(
            connect_timeout,
            TcpStream::connect((srv.addr.host(), srv.addr.port())),
        )
        .await
        .map_err(|_| ClientError::TimedOut)?
        .map_err(ClientError::from)?;
        tcp_stream.set_nodelay(true).map_err(ClientError::from)?;

        let mut connection = Connection::new(Box::new(tcp_stream));

        let op = timeout(connect_timeout, connection.read_op())
            .await
            .map_err(|_| ClientError::TimedOut)?
            .map_err(ClientError::from)?;
        let mut info = match op {
            Some(ServerOp::Info(info)) => info,
            Some(op) => {
                return Err(ClientError::Protocol(format!(
                    "expected INFO, got {:?}",
                    op
                )))
            }
            None => {
                return Err(ClientError::Protocol(
                    "expected INFO, got end of stream".into(),
                ))
            }
        };

        let tls_required =
            self.options.tls_required || info.tls_required || srv.addr.tls_required();
        if tls_required {
            let tls_config =
                Arc::new(tls::config_tls(&self.options).map_err(|err| ClientError::Tls(err.to_string()))?);
            let hostname = self
                .options
                .tls_hostname
                .as_deref()
                .or(srv.tls_name.as_deref())
                .unwrap_or_else(|| srv.addr.host());
            let domain = ServerName::try_from(hostname).map_err(|_| {
                ClientError::Tls("cannot determine hostname for TLS connection".into())
            })?;

            let Connection {
                stream,
                buffer,
                write_buffer,
            } = connection;
            let tls_stream = timeout(
                connect_timeout,
                TlsConnector::from(tls_config).connect(domain, stream),
            )
            .await
            .map_err(|_| ClientError::TimedOut)?
            .map_err(|err| ClientError::Tls(err.to_string()))?;

            connection = Connection {
                stream: Box::new(tls_stream),
                buffer,
                write_buffer,
            };
        }

        let connect_info = self.connect_info(srv, &info)?;
        connection
            .write_op(&ClientOp::Connect(connect_info))
            .map_err(ClientError::from)?;
        connection
            .write_op(&ClientOp::Ping)
            .map_err(ClientError::from)?;
        connection.flush().await.map_err(ClientError::from)?;

        // Expect PONG, tolerating `+OK` acknowledgements in verbose mode.
        // Any `-ERR` fails the handshake.
        loop {
            let op = timeout(connect_timeout, connection.read_op())
                .await
                .map_err(|_| ClientError::TimedOut)?
                .map_err(ClientError::from)?;
            match op {
                Some(ServerOp::Ok) => continue,
                Some(ServerOp::Pong) => break,
                Some(ServerOp::Info(new_info)) => {
                    info = new_info;
                    continue;
                }
                Some(ServerOp::Error(reason)) => {
                    return Err(classify_server_error(&reason));
                }
                Some(op) => {
                    return Err(ClientError::Protocol(format!(
                        "expected PONG, got {:?}",
                        op
                    )))
                }
                None => {
                    return Err(ClientError::Protocol(
                        "connection closed during handshake".into(),
                    ))
                }
            }
        }

        tracing::debug!(server = %srv.addr, "handshake complete");
        Ok((info, connection))
    }

    /// Assembles the `CONNECT` payload, picking the authentication variant
    /// in precedence order: nonce signing, explicit user and password,
    /// token, then credentials embedded in the candidate URL.
    fn connect_info(&self, srv: &Srv, server_info: &ServerInfo) -> Result<ConnectInfo, ClientError> {
        let mut connect_info = ConnectInfo {
            verbose: self.options.verbose,
            pedantic: self.options.pedantic,
            name: self.options.name.clone(),
            lang: LANG.to_string(),
            version: VERSION.to_string(),
            protocol: Protocol::Dynamic,
            tls_required: self.options.tls_required
                || server_info.tls_required
                || srv.addr.tls_required(),
            echo: !self.options.no_echo,
            headers: true,
            no_responders: true,
            user: None,
            pass: None,
            auth_token: None,
            user_jwt: None,
            nkey: None,
            signature: None,
        };

        if !server_info.auth_required {
            return Ok(connect_info);
        }

        if !server_info.nonce.is_empty()
            && (self.options.signature_callback.is_some() || self.options.nkey.is_some())
        {
            if let Some(callback) = &self.options.signature_callback {
                let signed = callback(&server_info.nonce)
                    .map_err(|err| ClientError::Authorization(err.to_string()))?;
                connect_info.signature = Some(base64_url::encode(&signed));
                if let Some(jwt_callback) = &self.options.user_jwt_callback {
                    let jwt = jwt_callback()
                        .map_err(|err| ClientError::Authorization(err.to_string()))?;
                    connect_info.user_jwt = Some(jwt);
                }
            } else if let Some(seed) = &self.options.nkey {
                let key_pair = nkeys::KeyPair::from_seed(seed)
                    .map_err(|err| ClientError::Authorization(err.to_string()))?;
                let signed = key_pair
                    .sign(server_info.nonce.as_bytes())
                    .map_err(|err| ClientError::Authorization(err.to_string()))?;
                connect_info.signature = Some(base64_url::encode(&signed));
                connect_info.nkey = Some(key_pair.public_key());
            }
        } else if self.options.user.is_some() && self.options.password.is_some() {
            connect_info.user = self.options.user.clone();
            connect_info.pass = self.options.password.clone();
        } else if self.options.token.is_some() {
            connect_info.auth_token = self.options.token.clone();
        } else if let Some(user) = srv.addr.username() {
            match srv.addr.password() {
                None => connect_info.auth_token = Some(user),
                Some(password) => {
                    connect_info.user = Some(user);
                    connect_info.pass = Some(password);
                }
            }
        }

        Ok(connect_info)
    }

    /// Appends endpoints gossiped through `INFO` to the pool, skipping
    /// duplicates by host and port. Returns how many entries were added.
    pub(crate) fn merge_connect_urls(&mut self, server_info: &ServerInfo) -> usize {
        if server_info.connect_urls.is_empty() {
            return 0;
        }

        let tls_scheme = self.options.tls_required
            || self
                .current
                .as_ref()
                .map_or(false, |srv| srv.addr.tls_required());
        let scheme = if tls_scheme { "tls" } else { "nats" };

        let mut added = Vec::new();
        for connect_url in &server_info.connect_urls {
            let addr: ServerAddr = match format!("{}://{}", scheme, connect_url).parse() {
                Ok(addr) => addr,
                Err(_) => continue,
            };

            let known = self
                .servers
                .iter()
                .map(|srv| &srv.addr)
                .chain(self.current.as_ref().map(|srv| &srv.addr))
                .chain(added.iter().map(|srv: &Srv| &srv.addr))
                .any(|existing| existing.host() == addr.host() && existing.port() == addr.port());
            if known {
                continue;
            }

            let mut srv = Srv::new(addr);
            srv.discovered = true;
            // Advertised bare IPs keep verifying certificates against the
            // hostname we originally dialed.
            if server_info.tls_required && srv.addr.host().parse::<IpAddr>().is_ok() {
                srv.tls_name = self
                    .current
                    .as_ref()
                    .map(|current| current.addr.host().to_string());
            }
            added.push(srv);
        }

        if !self.options.dont_randomize {
            added.shuffle(&mut rand::thread_rng());
        }
        let count = added.len();
        self.servers.extend(added);
        count
    }
}

fn classify_server_error(reason: &str) -> ClientError {
    let normalized = reason.to_lowercase();
    if normalized.contains("authorization violation") || normalized.contains("user authentication")
    {
        ClientError::Authorization(reason.to_owned())
    } else {
        ClientError::ServerError(reason.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(urls: &[&str]) -> Connector {
        let addrs = urls
            .iter()
            .map(|url| url.parse::<ServerAddr>().unwrap())
            .collect();
        Connector::new(addrs, ConnectOptions::new().dont_randomize())
    }

    #[test]
    fn pool_keeps_order_when_not_randomized() {
        let connector = connector(&["nats://a:4222", "nats://b:4222"]);
        let hosts: Vec<&str> = connector.servers.iter().map(|s| s.addr.host()).collect();
        assert_eq!(hosts, ["a", "b"]);
    }

    #[test]
    fn gossip_skips_duplicates_by_host_and_port() {
        let mut connector = connector(&["nats://a:4222"]);
        let info = ServerInfo {
            connect_urls: vec![
                "a:4222".to_string(),
                "b:4222".to_string(),
                "b:4222".to_string(),
                "b:5222".to_string(),
            ],
            ..Default::default()
        };

        assert_eq!(connector.merge_connect_urls(&info), 2);
        let hosts: Vec<(String, u16)> = connector
            .servers
            .iter()
            .map(|s| (s.addr.host().to_string(), s.addr.port()))
            .collect();
        assert_eq!(
            hosts,
            [
                ("a".to_string(), 4222),
                ("b".to_string(), 4222),
                ("b".to_string(), 5222)
            ]
        );
        assert!(connector.servers[1].discovered);

        // Merging the same INFO again adds nothing.
        assert_eq!(connector.merge_connect_urls(&info), 0);
    }

    #[test]
    fn gossiped_ip_inherits_tls_name() {
        let mut connector = connector(&["nats://demo.example.com:4222"]);
        connector.current = Some(Srv::new("nats://demo.example.com:4222".parse().unwrap()));
        let info = ServerInfo {
            tls_required: true,
            connect_urls: vec!["192.0.2.1:4222".to_string()],
            ..Default::default()
        };

        assert_eq!(connector.merge_connect_urls(&info), 1);
        let added = connector.servers.last().unwrap();
        assert_eq!(added.tls_name.as_deref(), Some("demo.example.com"));
    }

    #[test]
    fn auth_precedence_prefers_explicit_user_and_password() {
        let options = ConnectOptions::new()
            .user_and_password("alice", "s3cret")
            .token("tok");
        let connector = Connector::new(
            vec!["nats://bob:hunter2@a:4222".parse().unwrap()],
            options,
        );
        let info = ServerInfo {
            auth_required: true,
            ..Default::default()
        };

        let connect_info = connector
            .connect_info(&connector.servers[0], &info)
            .unwrap();
        assert_eq!(connect_info.user.as_deref(), Some("alice"));
        assert_eq!(connect_info.pass.as_deref(), Some("s3cret"));
        assert_eq!(connect_info.auth_token, None);
    }

    #[test]
    fn auth_falls_back_to_url_user_info() {
        let connector = Connector::new(
            vec!["nats://bob:hunter2@a:4222".parse().unwrap()],
            ConnectOptions::new(),
        );
        let info = ServerInfo {
            auth_required: true,
            ..Default::default()
        };

        let connect_info = connector
            .connect_info(&connector.servers[0], &info)
            .unwrap();
        assert_eq!(connect_info.user.as_deref(), Some("bob"));
        assert_eq!(connect_info.pass.as_deref(), Some("hunter2"));

        // A lone user-info segment is treated as a token.
        let connector = Connector::new(
            vec!["nats://tokenvalue@a:4222".parse().unwrap()],
            ConnectOptions::new(),
        );
        let connect_info = connector
            .connect_info(&connector.servers[0], &info)
            .unwrap();
        assert_eq!(connect_info.auth_token.as_deref(), Some("tokenvalue"));
    }

    #[test]
    fn no_auth_fields_without_auth_required() {
        let connector = Connector::new(
            vec!["nats://bob:hunter2@a:4222".parse().unwrap()],
            ConnectOptions::new(),
        );
        let connect_info = connector
            .connect_info(&connector.servers[0], &ServerInfo::default())
            .unwrap();
        assert_eq!(connect_info.user, None);
        assert_eq!(connect_info.pass, None);
        assert_eq!(connect_info.auth_token, None);
    }
}
