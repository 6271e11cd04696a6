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

//! Message headers.
//!
//! Headers travel on the wire as a text block with a fixed leading version
//! line, colon separated fields and a terminating blank line:
//!
//! ```text
//! NATS/1.0\r\n
//! Key: Value\r\n
//! \r\n
//! ```
//!
//! Servers also use an inline status form without any fields, for example
//! `NATS/1.0 404 No Messages`. Such lines are surfaced as the [`STATUS`]
//! and [`DESCRIPTION`] entries of the header map.

use bytes::{BufMut, BytesMut};
pub use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::ClientError;

/// Name under which an inline status code is stored.
pub const STATUS: &str = "Status";
/// Name under which an inline status description is stored.
pub const DESCRIPTION: &str = "Description";

/// Status used by the server when a request has no responders.
pub const NO_RESPONDERS: u16 = 503;
/// Status used by pull consumers when no message is available.
pub const NOT_FOUND: u16 = 404;
/// Status used when a pull request expires before a message arrives.
pub const REQUEST_TIMEOUT: u16 = 408;

pub(crate) const HEADER_LINE: &[u8] = b"NATS/1.0";

/// Parses a complete header block, including the version line and the
/// terminating blank line.
pub(crate) fn parse_headers(buf: &[u8]) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    let mut lines = buf
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let version_line = lines
        .next()
        .filter(|line| line.starts_with(HEADER_LINE))
        .ok_or_else(|| ClientError::Protocol("missing header version line".into()))?;

    // `NATS/1.0 404 No Messages` style inline status.
    let status_part = trim(&version_line[HEADER_LINE.len()..]);
    if !status_part.is_empty() {
        let mut split = status_part.splitn(2, |b| *b == b' ');
        let code = split.next().unwrap_or_default();
        if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
            return Err(ClientError::Protocol("malformed status line".into()));
        }
        headers.insert(
            HeaderName::from_static("status"),
            HeaderValue::from_bytes(code)
                .map_err(|err| ClientError::Protocol(err.to_string()))?,
        );
        if let Some(description) = split.next() {
            let description = trim(description);
            if !description.is_empty() {
                headers.insert(
                    HeaderName::from_static("description"),
                    HeaderValue::from_bytes(description)
                        .map_err(|err| ClientError::Protocol(err.to_string()))?,
                );
            }
        }
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| ClientError::Protocol("malformed header field".into()))?;
        let name = HeaderName::from_bytes(&line[..colon])
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        let value = HeaderValue::from_bytes(trim(&line[colon + 1..]))
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        headers.append(name, value);
    }

    Ok(headers)
}

/// Serializes a header map into its wire form.
pub(crate) fn serialize_headers(headers: &HeaderMap, buf: &mut BytesMut) {
    buf.put_slice(HEADER_LINE);
    buf.put_slice(b"\r\n");
    for (name, value) in headers.iter() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

pub(crate) fn serialized_len(headers: &HeaderMap) -> usize {
    let mut len = HEADER_LINE.len() + 4;
    for (name, value) in headers.iter() {
        len += name.as_str().len() + 2 + value.as_bytes().len() + 2;
    }
    len
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_block() {
        let headers = parse_headers(b"NATS/1.0\r\nfoo: bar\r\nNats-Msg-Id: one\r\n\r\n").unwrap();
        assert_eq!(headers.get("foo").unwrap(), "bar");
        assert_eq!(headers.get("nats-msg-id").unwrap(), "one");
        assert_eq!(headers.get("NATS-MSG-ID").unwrap(), "one");
    }

    #[test]
    fn parse_multi_value() {
        let headers = parse_headers(b"NATS/1.0\r\nfoo: bar\r\nfoo: baz\r\n\r\n").unwrap();
        let values: Vec<_> = headers.get_all("foo").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn parse_inline_status() {
        let headers = parse_headers(b"NATS/1.0 404 No Messages\r\n\r\n").unwrap();
        assert_eq!(headers.get(STATUS).unwrap(), "404");
        assert_eq!(headers.get(DESCRIPTION).unwrap(), "No Messages");
    }

    #[test]
    fn parse_inline_status_without_description() {
        let headers = parse_headers(b"NATS/1.0 503\r\n\r\n").unwrap();
        assert_eq!(headers.get(STATUS).unwrap(), "503");
        assert!(headers.get(DESCRIPTION).is_none());
    }

    #[test]
    fn reject_malformed_status() {
        assert!(parse_headers(b"NATS/1.0 40x oops\r\n\r\n").is_err());
        assert!(parse_headers(b"HTTP/1.0 200 OK\r\n\r\n").is_err());
    }

    #[test]
    fn round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("foo"),
            HeaderValue::from_static("bar"),
        );
        headers.append(
            HeaderName::from_static("foo"),
            HeaderValue::from_static("baz"),
        );

        let mut buf = BytesMut::new();
        serialize_headers(&headers, &mut buf);
        assert_eq!(buf.len(), serialized_len(&headers));

        let parsed = parse_headers(&buf).unwrap();
        assert_eq!(parsed, headers);
    }
}
