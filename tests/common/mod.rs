//! A minimal in-process broker speaking enough of the line protocol to
//! exercise the client end to end: it sends `INFO`, answers `PING`, tracks
//! subscriptions with wildcard matching and routes `PUB`/`HPUB` back as
//! `MSG`/`HMSG`, including the no-responders notification.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub struct MockOptions {
    pub max_payload: usize,
}

impl Default for MockOptions {
    fn default() -> MockOptions {
        MockOptions {
            max_payload: 1024 * 1024,
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    bounce: broadcast::Sender<()>,
}

impl MockServer {
    pub async fn start() -> MockServer {
        MockServer::with_options(MockOptions::default()).await
    }

    pub async fn with_options(options: MockOptions) -> MockServer {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (bounce, _) = broadcast::channel(1);

        let accept_bounce = bounce.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let shutdown = accept_bounce.subscribe();
                let options = options.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, options, shutdown).await;
                });
            }
        });

        MockServer { addr, bounce }
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.addr.port())
    }

    /// Forcibly closes every active connection; the listener keeps
    /// accepting, so clients can reconnect.
    pub fn bounce(&self) {
        let _ = self.bounce.send(());
    }
}

struct MockSubscription {
    pattern: String,
    delivered: u64,
    max: Option<u64>,
}

async fn serve_connection(
    stream: TcpStream,
    options: MockOptions,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let info = format!(
        "INFO {{\"server_id\":\"mock\",\"server_name\":\"mock\",\"version\":\"2.9.0\",\"proto\":1,\"host\":\"127.0.0.1\",\"port\":{},\"max_payload\":{},\"client_id\":7,\"headers\":true,\"auth_required\":false}}\r\n",
        0, options.max_payload,
    );
    write_half.write_all(info.as_bytes()).await?;

    let mut subscriptions: HashMap<u64, MockSubscription> = HashMap::new();
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.recv() => break,
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            break;
        }

        let trimmed = line.trim_end();
        let mut parts = trimmed.split_whitespace();
        match parts.next() {
            Some("CONNECT") => {
                if trimmed.contains("\"verbose\":true") {
                    write_half.write_all(b"+OK\r\n").await?;
                }
            }
            Some("PING") => {
                write_half.write_all(b"PONG\r\n").await?;
            }
            Some("PONG") => {}
            Some("SUB") => {
                // SUB <subject> [queue] <sid>
                let args: Vec<&str> = parts.collect();
                let (subject, sid) = match args[..] {
                    [subject, sid] => (subject, sid),
                    [subject, _queue, sid] => (subject, sid),
                    _ => continue,
                };
                subscriptions.insert(
                    sid.parse().unwrap(),
                    MockSubscription {
                        pattern: subject.to_string(),
                        delivered: 0,
                        max: None,
                    },
                );
            }
            Some("UNSUB") => {
                // UNSUB <sid> [max]
                let args: Vec<&str> = parts.collect();
                match args[..] {
                    [sid] => {
                        subscriptions.remove(&sid.parse().unwrap());
                    }
                    [sid, max] => {
                        let sid: u64 = sid.parse().unwrap();
                        let max: u64 = max.parse().unwrap();
                        let keep = subscriptions
                            .get(&sid)
                            .map_or(false, |subscription| subscription.delivered < max);
                        if keep {
                            subscriptions.get_mut(&sid).unwrap().max = Some(max);
                        } else {
                            subscriptions.remove(&sid);
                        }
                    }
                    _ => {}
                }
            }
            Some("PUB") => {
                // PUB <subject> [reply] <#bytes>
                let args: Vec<&str> = parts.collect();
                let (subject, reply, size) = match args[..] {
                    [subject, size] => (subject, None, size),
                    [subject, reply, size] => (subject, Some(reply), size),
                    _ => continue,
                };
                let size: usize = size.parse().unwrap();
                let mut payload = vec![0u8; size + 2];
                reader.read_exact(&mut payload).await?;
                payload.truncate(size);

                route(
                    &mut write_half,
                    &mut subscriptions,
                    subject.to_string(),
                    reply.map(String::from),
                    None,
                    payload,
                )
                .await?;
            }
            Some("HPUB") => {
                // HPUB <subject> [reply] <#header bytes> <#total bytes>
                let args: Vec<&str> = parts.collect();
                let (subject, reply, header_size, total_size) = match args[..] {
                    [subject, header_size, total_size] => {
                        (subject, None, header_size, total_size)
                    }
                    [subject, reply, header_size, total_size] => {
                        (subject, Some(reply), header_size, total_size)
                    }
                    _ => continue,
                };
                let header_size: usize = header_size.parse().unwrap();
                let total_size: usize = total_size.parse().unwrap();
                let mut block = vec![0u8; total_size + 2];
                reader.read_exact(&mut block).await?;
                block.truncate(total_size);
                let payload = block.split_off(header_size);

                route(
                    &mut write_half,
                    &mut subscriptions,
                    subject.to_string(),
                    reply.map(String::from),
                    Some(block),
                    payload,
                )
                .await?;
            }
            _ => break,
        }
    }

    Ok(())
}

async fn route(
    writer: &mut OwnedWriteHalf,
    subscriptions: &mut HashMap<u64, MockSubscription>,
    subject: String,
    reply: Option<String>,
    headers: Option<Vec<u8>>,
    payload: Vec<u8>,
) -> std::io::Result<()> {
    let matching: Vec<u64> = subscriptions
        .iter()
        .filter(|(_, subscription)| subject_matches(&subscription.pattern, &subject))
        .map(|(sid, _)| *sid)
        .collect();

    if matching.is_empty() {
        // Nobody is listening: notify the requester, when there is one.
        if let Some(reply) = reply {
            let status = b"NATS/1.0 503\r\n\r\n".to_vec();
            let targets: Vec<u64> = subscriptions
                .iter()
                .filter(|(_, subscription)| subject_matches(&subscription.pattern, &reply))
                .map(|(sid, _)| *sid)
                .collect();
            for sid in targets {
                deliver(
                    writer,
                    subscriptions,
                    sid,
                    &reply,
                    None,
                    Some(&status),
                    b"",
                )
                .await?;
            }
        }
        return Ok(());
    }

    for sid in matching {
        deliver(
            writer,
            subscriptions,
            sid,
            &subject,
            reply.as_deref(),
            headers.as_deref(),
            &payload,
        )
        .await?;
    }
    Ok(())
}

async fn deliver(
    writer: &mut OwnedWriteHalf,
    subscriptions: &mut HashMap<u64, MockSubscription>,
    sid: u64,
    subject: &str,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) -> std::io::Result<()> {
    let exhausted = {
        let Some(subscription) = subscriptions.get_mut(&sid) else {
            return Ok(());
        };
        subscription.delivered += 1;
        subscription
            .max
            .map_or(false, |max| subscription.delivered >= max)
    };
    if exhausted {
        subscriptions.remove(&sid);
    }

    let reply_part = reply.map(|r| format!(" {}", r)).unwrap_or_default();
    match headers {
        Some(headers) => {
            let frame = format!(
                "HMSG {} {}{} {} {}\r\n",
                subject,
                sid,
                reply_part,
                headers.len(),
                headers.len() + payload.len(),
            );
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(headers).await?;
            writer.write_all(payload).await?;
            writer.write_all(b"\r\n").await?;
        }
        None => {
            let frame = format!(
                "MSG {} {}{} {}\r\n",
                subject,
                sid,
                reply_part,
                payload.len()
            );
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(payload).await?;
            writer.write_all(b"\r\n").await?;
        }
    }
    Ok(())
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (None, None) => return true,
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            _ => return false,
        }
    }
}
