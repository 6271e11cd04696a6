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

use std::io::ErrorKind;
use std::str::{self, FromStr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use subslice::SubsliceExt;
use tokio::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ClientError;
use crate::header::{self, HeaderMap};
use crate::{ConnectInfo, ServerInfo};

/// Maximum accepted length of a control line.
pub(crate) const MAX_CONTROL_LINE_SIZE: usize = 1024;

/// Operations sent by the server.
#[derive(Clone, Debug)]
pub(crate) enum ServerOp {
    Ok,
    Info(Box<ServerInfo>),
    Ping,
    Pong,
    Error(String),
    Message {
        sid: u64,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    },
}

/// Operations written by the client.
#[derive(Clone, Debug)]
pub(crate) enum ClientOp {
    Connect(ConnectInfo),
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
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Supertrait enabling a trait object holding both TLS and non-TLS streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A framed connection.
///
/// Parsing is resumable: [`Connection::try_read_op`] consumes bytes from the
/// read buffer only once a complete operation is available, so arbitrary
/// input boundaries cannot corrupt its state. Writes accumulate in a pending
/// buffer until [`Connection::flush`] pushes them onto the socket.
pub(crate) struct Connection {
    pub(crate) stream: Box<dyn AsyncReadWrite>,
    pub(crate) buffer: BytesMut,
    pub(crate) write_buffer: BytesMut,
}

impl Connection {
    pub(crate) fn new(stream: Box<dyn AsyncReadWrite>) -> Connection {
        Connection {
            stream,
            buffer: BytesMut::new(),
            write_buffer: BytesMut::new(),
        }
    }

    /// Attempts to decode one operation from the read buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub(crate) fn try_read_op(&mut self) -> Result<Option<ServerOp>, io::Error> {
        // Every operation begins with a control line at the start of the
        // buffer; payload bytes are only consumed together with their
        // control line.
        match self.buffer.find(b"\r\n") {
            Some(len) if len > MAX_CONTROL_LINE_SIZE => {
                return Err(protocol_error(ClientError::ControlLineExceeded));
            }
            None if self.buffer.len() > MAX_CONTROL_LINE_SIZE => {
                return Err(protocol_error(ClientError::ControlLineExceeded));
            }
            _ => {}
        }

        if self.buffer.starts_with(b"+OK\r\n") {
            self.buffer.advance(5);
            return Ok(Some(ServerOp::Ok));
        }

        if self.buffer.starts_with(b"PING\r\n") {
            self.buffer.advance(6);
            return Ok(Some(ServerOp::Ping));
        }

        if self.buffer.starts_with(b"PONG\r\n") {
            self.buffer.advance(6);
            return Ok(Some(ServerOp::Pong));
        }

        if self.buffer.starts_with(b"-ERR ") {
            if let Some(len) = self.buffer.find(b"\r\n") {
                let reason = str::from_utf8(&self.buffer[5..len])
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?
                    .trim_matches('\'')
                    .to_owned();
                self.buffer.advance(len + 2);
                return Ok(Some(ServerOp::Error(reason)));
            }
            return Ok(None);
        }

        if self.buffer.starts_with(b"INFO ") {
            if let Some(len) = self.buffer.find(b"\r\n") {
                let line = str::from_utf8(&self.buffer[5..len])
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                let server_info = serde_json::from_str(line)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                self.buffer.advance(len + 2);
                return Ok(Some(ServerOp::Info(Box::new(server_info))));
            }
            return Ok(None);
        }

        if self.buffer.starts_with(b"MSG ") {
            if let Some(len) = self.buffer.find(b"\r\n") {
                // MSG <subject> <sid> [reply] <#bytes>
                let line = str::from_utf8(&self.buffer[4..len])
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                let args: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
                let (subject, sid, reply, payload_len) = match args[..] {
                    [subject, sid, payload_len] => (subject, sid, None, payload_len),
                    [subject, sid, reply, payload_len] => (subject, sid, Some(reply), payload_len),
                    _ => {
                        return Err(protocol_error(ClientError::Protocol(
                            "invalid number of arguments after MSG".into(),
                        )));
                    }
                };

                let sid = u64::from_str(sid)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                let payload_len = usize::from_str(payload_len)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;

                // Only advance when the whole operation is buffered.
                if len + payload_len + 4 <= self.buffer.remaining() {
                    let subject = subject.to_owned();
                    let reply = reply.map(String::from);

                    self.buffer.advance(len + 2);
                    let payload = self.buffer.split_to(payload_len).freeze();
                    self.buffer.advance(2);

                    return Ok(Some(ServerOp::Message {
                        sid,
                        subject,
                        reply,
                        headers: None,
                        payload,
                    }));
                }
            }
            return Ok(None);
        }

        if self.buffer.starts_with(b"HMSG ") {
            if let Some(len) = self.buffer.find(b"\r\n") {
                // HMSG <subject> <sid> [reply] <#header bytes> <#total bytes>
                let line = str::from_utf8(&self.buffer[5..len])
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                let args: Vec<&str> = line.split(' ').filter(|s| !s.is_empty()).collect();
                let (subject, sid, reply, header_len, total_len) = match args[..] {
                    [subject, sid, header_len, total_len] => {
                        (subject, sid, None, header_len, total_len)
                    }
                    [subject, sid, reply, header_len, total_len] => {
                        (subject, sid, Some(reply), header_len, total_len)
                    }
                    _ => {
                        return Err(protocol_error(ClientError::Protocol(
                            "invalid number of arguments after HMSG".into(),
                        )));
                    }
                };

                let sid = u64::from_str(sid)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                let header_len = usize::from_str(header_len)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                let total_len = usize::from_str(total_len)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
                if header_len > total_len {
                    return Err(protocol_error(ClientError::Protocol(
                        "HMSG header size exceeds total size".into(),
                    )));
                }

                if len + total_len + 4 <= self.buffer.remaining() {
                    let subject = subject.to_owned();
                    let reply = reply.map(String::from);

                    self.buffer.advance(len + 2);
                    let header_bytes = self.buffer.split_to(header_len);
                    let payload = self.buffer.split_to(total_len - header_len).freeze();
                    self.buffer.advance(2);

                    let headers = header::parse_headers(&header_bytes)
                        .map_err(protocol_error)?;

                    return Ok(Some(ServerOp::Message {
                        sid,
                        subject,
                        reply,
                        headers: Some(headers),
                        payload,
                    }));
                }
            }
            return Ok(None);
        }

        // A complete line that matched no known operation is a hard error.
        if let Some(len) = self.buffer.find(b"\r\n") {
            let line = String::from_utf8_lossy(&self.buffer[..len]).into_owned();
            return Err(protocol_error(ClientError::Protocol(format!(
                "unknown operation: {}",
                line
            ))));
        }

        Ok(None)
    }

    pub(crate) async fn read_op(&mut self) -> Result<Option<ServerOp>, io::Error> {
        loop {
            if let Some(op) = self.try_read_op()? {
                return Ok(Some(op));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection reset with bytes remaining in the parse buffer",
                ));
            }
        }
    }

    /// Serializes one operation into the pending write buffer.
    pub(crate) fn write_op(&mut self, item: &ClientOp) -> Result<(), io::Error> {
        let mut lengths = itoa::Buffer::new();
        match item {
            ClientOp::Connect(connect_info) => {
                let json = serde_json::to_string(connect_info)
                    .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
                self.write_buffer.put_slice(b"CONNECT ");
                self.write_buffer.put_slice(json.as_bytes());
                self.write_buffer.put_slice(b"\r\n");
            }
            ClientOp::Publish {
                subject,
                reply,
                headers,
                payload,
            } => {
                match headers {
                    Some(headers) => {
                        let header_len = header::serialized_len(headers);
                        self.write_buffer.put_slice(b"HPUB ");
                        self.write_buffer.put_slice(subject.as_bytes());
                        self.write_buffer.put_u8(b' ');
                        if let Some(reply) = reply {
                            self.write_buffer.put_slice(reply.as_bytes());
                            self.write_buffer.put_u8(b' ');
                        }
                        self.write_buffer
                            .put_slice(lengths.format(header_len).as_bytes());
                        self.write_buffer.put_u8(b' ');
                        self.write_buffer
                            .put_slice(lengths.format(header_len + payload.len()).as_bytes());
                        self.write_buffer.put_slice(b"\r\n");
                        header::serialize_headers(headers, &mut self.write_buffer);
                    }
                    None => {
                        self.write_buffer.put_slice(b"PUB ");
                        self.write_buffer.put_slice(subject.as_bytes());
                        self.write_buffer.put_u8(b' ');
                        if let Some(reply) = reply {
                            self.write_buffer.put_slice(reply.as_bytes());
                            self.write_buffer.put_u8(b' ');
                        }
                        self.write_buffer
                            .put_slice(lengths.format(payload.len()).as_bytes());
                        self.write_buffer.put_slice(b"\r\n");
                    }
                }
                self.write_buffer.put_slice(payload);
                self.write_buffer.put_slice(b"\r\n");
            }
            ClientOp::Subscribe {
                sid,
                subject,
                queue_group,
            } => {
                self.write_buffer.put_slice(b"SUB ");
                self.write_buffer.put_slice(subject.as_bytes());
                self.write_buffer.put_u8(b' ');
                if let Some(queue_group) = queue_group {
                    self.write_buffer.put_slice(queue_group.as_bytes());
                    self.write_buffer.put_u8(b' ');
                }
                self.write_buffer.put_slice(lengths.format(*sid).as_bytes());
                self.write_buffer.put_slice(b"\r\n");
            }
            ClientOp::Unsubscribe { sid, max } => {
                self.write_buffer.put_slice(b"UNSUB ");
                self.write_buffer.put_slice(lengths.format(*sid).as_bytes());
                if let Some(max) = max {
                    self.write_buffer.put_u8(b' ');
                    self.write_buffer.put_slice(lengths.format(*max).as_bytes());
                }
                self.write_buffer.put_slice(b"\r\n");
            }
            ClientOp::Ping => {
                self.write_buffer.put_slice(b"PING\r\n");
            }
            ClientOp::Pong => {
                self.write_buffer.put_slice(b"PONG\r\n");
            }
        }

        Ok(())
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Writes the pending buffer onto the socket and drains the transport.
    pub(crate) async fn flush(&mut self) -> Result<(), io::Error> {
        while !self.write_buffer.is_empty() {
            let written = self.stream.write(&self.write_buffer).await?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "failed to write pending buffer",
                ));
            }
            self.write_buffer.advance(written);
        }
        self.stream.flush().await
    }

    /// Takes bytes that were serialized but never written, for replay on a
    /// fresh connection.
    pub(crate) fn take_pending(&mut self) -> BytesMut {
        self.write_buffer.split()
    }
}

fn protocol_error(err: ClientError) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HeaderName, HeaderValue};

    fn connection() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(32768);
        (Connection::new(Box::new(client)), server)
    }

    #[tokio::test]
    async fn read_info() {
        let (mut connection, mut server) = connection();
        server
            .write_all(b"INFO {\"server_id\":\"test\",\"max_payload\":1024,\"headers\":true}\r\n")
            .await
            .unwrap();

        let op = connection.read_op().await.unwrap();
        match op {
            Some(ServerOp::Info(info)) => {
                assert_eq!(info.server_id, "test");
                assert_eq!(info.max_payload, 1024);
                assert!(info.headers);
            }
            other => panic!("expected INFO, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_control_ops() {
        let (mut connection, mut server) = connection();
        server
            .write_all(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Authorization Violation'\r\n")
            .await
            .unwrap();

        assert!(matches!(
            connection.read_op().await.unwrap(),
            Some(ServerOp::Ping)
        ));
        assert!(matches!(
            connection.read_op().await.unwrap(),
            Some(ServerOp::Pong)
        ));
        assert!(matches!(
            connection.read_op().await.unwrap(),
            Some(ServerOp::Ok)
        ));
        match connection.read_op().await.unwrap() {
            Some(ServerOp::Error(reason)) => assert_eq!(reason, "Authorization Violation"),
            other => panic!("expected -ERR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_message() {
        let (mut connection, mut server) = connection();
        server
            .write_all(b"MSG foo.bar 9 11\r\nHello World\r\n")
            .await
            .unwrap();

        match connection.read_op().await.unwrap() {
            Some(ServerOp::Message {
                sid,
                subject,
                reply,
                headers,
                payload,
            }) => {
                assert_eq!(sid, 9);
                assert_eq!(subject, "foo.bar");
                assert_eq!(reply, None);
                assert!(headers.is_none());
                assert_eq!(payload.as_ref(), b"Hello World");
            }
            other => panic!("expected MSG, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_message_with_reply() {
        let (mut connection, mut server) = connection();
        server
            .write_all(b"MSG foo.bar 9 INBOX.34 11\r\nHello World\r\n")
            .await
            .unwrap();

        match connection.read_op().await.unwrap() {
            Some(ServerOp::Message { sid, reply, .. }) => {
                assert_eq!(sid, 9);
                assert_eq!(reply.as_deref(), Some("INBOX.34"));
            }
            other => panic!("expected MSG, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_message_with_headers() {
        let (mut connection, mut server) = connection();
        let headers = b"NATS/1.0\r\nfoo: bar\r\n\r\n";
        let frame = format!(
            "HMSG test.one 5 reply.to {} {}\r\n",
            headers.len(),
            headers.len() + 5
        );
        server.write_all(frame.as_bytes()).await.unwrap();
        server.write_all(headers).await.unwrap();
        server.write_all(b"hello\r\n").await.unwrap();

        match connection.read_op().await.unwrap() {
            Some(ServerOp::Message {
                subject,
                reply,
                headers,
                payload,
                ..
            }) => {
                assert_eq!(subject, "test.one");
                assert_eq!(reply.as_deref(), Some("reply.to"));
                assert_eq!(headers.unwrap().get("foo").unwrap(), "bar");
                assert_eq!(payload.as_ref(), b"hello");
            }
            other => panic!("expected HMSG, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_inline_status() {
        let (mut connection, mut server) = connection();
        let headers = b"NATS/1.0 503\r\n\r\n";
        let frame = format!("HMSG _INBOX.x.y 3 {} {}\r\n", headers.len(), headers.len());
        server.write_all(frame.as_bytes()).await.unwrap();
        server.write_all(headers).await.unwrap();
        server.write_all(b"\r\n").await.unwrap();

        match connection.read_op().await.unwrap() {
            Some(ServerOp::Message {
                headers, payload, ..
            }) => {
                assert_eq!(headers.unwrap().get(crate::header::STATUS).unwrap(), "503");
                assert!(payload.is_empty());
            }
            other => panic!("expected HMSG, got {:?}", other),
        }
    }

    #[test]
    fn resumes_across_arbitrary_boundaries() {
        let (mut connection, _server) = connection();
        let frame = b"MSG foo.bar 9 11\r\nHello World\r\n";

        for split in 1..frame.len() - 1 {
            connection.buffer.clear();
            connection.buffer.extend_from_slice(&frame[..split]);
            assert!(connection.try_read_op().unwrap().is_none());

            connection.buffer.extend_from_slice(&frame[split..]);
            match connection.try_read_op().unwrap() {
                Some(ServerOp::Message { payload, .. }) => {
                    assert_eq!(payload.as_ref(), b"Hello World");
                }
                other => panic!("expected MSG after resume, got {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_oversized_control_line() {
        let (mut connection, _server) = connection();
        let subject = "x".repeat(MAX_CONTROL_LINE_SIZE + 1);
        connection
            .buffer
            .extend_from_slice(format!("MSG {} 1 0\r\n\r\n", subject).as_bytes());
        assert!(connection.try_read_op().is_err());
    }

    #[test]
    fn rejects_unknown_operation() {
        let (mut connection, _server) = connection();
        connection.buffer.extend_from_slice(b"WAT is this\r\n");
        assert!(connection.try_read_op().is_err());
    }

    #[test]
    fn serialize_publish() {
        let (mut connection, _server) = connection();
        connection
            .write_op(&ClientOp::Publish {
                subject: "test.one".into(),
                reply: None,
                headers: None,
                payload: Bytes::from_static(b"hello"),
            })
            .unwrap();
        assert_eq!(&connection.write_buffer[..], b"PUB test.one 5\r\nhello\r\n");
    }

    #[test]
    fn serialize_publish_with_reply_and_headers() {
        let (mut connection, _server) = connection();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("foo"),
            HeaderValue::from_static("bar"),
        );
        connection
            .write_op(&ClientOp::Publish {
                subject: "test.one".into(),
                reply: Some("_INBOX.x".into()),
                headers: Some(headers),
                payload: Bytes::from_static(b"hi"),
            })
            .unwrap();
        let expected = b"HPUB test.one _INBOX.x 22 24\r\nNATS/1.0\r\nfoo: bar\r\n\r\nhi\r\n";
        assert_eq!(&connection.write_buffer[..], &expected[..]);
    }

    #[test]
    fn serialize_subscribe_and_unsubscribe() {
        let (mut connection, _server) = connection();
        connection
            .write_op(&ClientOp::Subscribe {
                sid: 11,
                subject: "test.>".into(),
                queue_group: Some("workers".into()),
            })
            .unwrap();
        connection
            .write_op(&ClientOp::Unsubscribe {
                sid: 11,
                max: Some(2),
            })
            .unwrap();
        connection
            .write_op(&ClientOp::Unsubscribe { sid: 12, max: None })
            .unwrap();
        assert_eq!(
            &connection.write_buffer[..],
            b"SUB test.> workers 11\r\nUNSUB 11 2\r\nUNSUB 12\r\n" as &[u8]
        );
    }

    #[tokio::test]
    async fn flush_writes_pending_bytes() {
        let (mut connection, mut server) = connection();
        connection.write_op(&ClientOp::Ping).unwrap();
        connection.write_op(&ClientOp::Pong).unwrap();
        assert_eq!(connection.pending_len(), 12);
        connection.flush().await.unwrap();
        assert_eq!(connection.pending_len(), 0);

        let mut read = [0u8; 12];
        server.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"PING\r\nPONG\r\n");
    }
}
