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
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::header::{self, HeaderMap};
use crate::jetstream::consumer::{self, Consumer};
use crate::jetstream::context::Context;
use crate::Error;

static VALID_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^.*>\s]+$").unwrap());

/// Validates a stream, consumer or template name: non-empty, without
/// whitespace, dots or wildcard characters.
pub(crate) fn validate_name(name: &str) -> Result<(), Error> {
    if VALID_NAME.is_match(name) {
        Ok(())
    } else {
        Err(Box::new(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid stream or consumer name {:?}", name),
        )))
    }
}

/// A handle to a stream known to exist on the server, obtained through
/// [`Context::create_stream`][crate::jetstream::Context::create_stream] or
/// [`Context::get_stream`][crate::jetstream::Context::get_stream].
#[derive(Clone, Debug)]
pub struct Stream {
    context: Context,
    info: StreamInfo,
}

impl Stream {
    pub(crate) fn new(context: Context, info: StreamInfo) -> Stream {
        Stream { context, info }
    }

    /// The info record fetched when this handle was created.
    pub fn cached_info(&self) -> &StreamInfo {
        &self.info
    }

    /// Fetches a fresh info record from the server.
    pub async fn info(&mut self) -> Result<&StreamInfo, Error> {
        self.info = self
            .context
            .stream_info(&self.info.config.name, false)
            .await?;
        Ok(&self.info)
    }

    /// Creates a consumer on this stream.
    pub async fn create_consumer(&self, config: consumer::Config) -> Result<Consumer, Error> {
        self.context
            .create_consumer(&self.info.config.name, config)
            .await
    }

    /// Looks up a consumer on this stream by name.
    pub async fn get_consumer(&self, name: &str) -> Result<Consumer, Error> {
        self.context
            .get_consumer(self.info.config.name.as_str(), name)
            .await
    }

    /// Deletes a consumer from this stream.
    pub async fn delete_consumer(&self, name: &str) -> Result<DeleteStatus, Error> {
        self.context
            .delete_consumer(&self.info.config.name, name)
            .await
    }

    /// Fetches a message by its stream sequence.
    pub async fn get_message(&self, sequence: u64) -> Result<StreamMessage, Error> {
        self.context
            .get_message(&self.info.config.name, sequence)
            .await
    }

    /// Fetches the last message stored for a subject.
    pub async fn get_last_message(&self, subject: &str) -> Result<StreamMessage, Error> {
        self.context
            .get_last_message(&self.info.config.name, subject)
            .await
    }

    /// Deletes a message by sequence.
    pub async fn delete_message(&self, sequence: u64, no_erase: bool) -> Result<DeleteStatus, Error> {
        self.context
            .delete_message(&self.info.config.name, sequence, no_erase)
            .await
    }

    /// Purges messages from this stream.
    pub async fn purge(&self, request: PurgeRequest) -> Result<PurgeResponse, Error> {
        self.context
            .purge_stream(&self.info.config.name, request)
            .await
    }
}

/// How messages are retained in a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Messages are kept until a limit is exceeded.
    #[default]
    Limits,
    /// Messages are kept while any consumer shows interest.
    Interest,
    /// Messages are removed once consumed.
    WorkQueue,
}

/// What happens to new messages when a stream reaches its limits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Old messages are removed to make room.
    #[default]
    Old,
    /// New messages are refused.
    New,
}

/// The storage backend of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Messages are stored on disk.
    #[default]
    File,
    /// Messages are kept in memory.
    Memory,
}

/// Configuration of a stream. Numeric bounds use `-1` for unbounded and `0`
/// for the server default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// A unique name for the stream; must not contain whitespace, dots or
    /// wildcards.
    #[serde(default)]
    pub name: String,
    /// Subjects the stream consumes, wildcards supported. Must be empty
    /// when a mirror is configured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// How many consumers can be defined for the stream, `-1` for
    /// unlimited.
    #[serde(default = "unbounded")]
    pub max_consumers: i64,
    /// How many messages the stream may hold.
    #[serde(default = "unbounded", rename = "max_msgs")]
    pub max_messages: i64,
    /// How many messages the stream may hold per subject.
    #[serde(default = "unbounded", rename = "max_msgs_per_subject")]
    pub max_messages_per_subject: i64,
    /// Combined size limit of all stored messages.
    #[serde(default = "unbounded")]
    pub max_bytes: i64,
    /// Maximum age of any message in the stream, `0` for unlimited.
    #[serde(default, with = "serde_nanos")]
    pub max_age: Duration,
    /// The largest message the stream accepts.
    #[serde(default = "unbounded", rename = "max_msg_size")]
    pub max_message_size: i64,
    #[serde(default)]
    pub storage: StorageType,
    /// How many replicas to keep for each message, 1 through 5.
    #[serde(default = "default_replicas")]
    pub num_replicas: usize,
    /// Disables acknowledging messages that are received by the stream.
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub discard: DiscardPolicy,
    /// The window over which duplicate message ids are tracked, `0` for the
    /// server default.
    #[serde(default, with = "serde_nanos")]
    pub duplicate_window: Duration,
    /// Set when the stream is managed by a stream template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_owner: Option<String>,
    /// Placement directives for the stream's replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    /// Maintains a 1:1 mirror of another stream. When set, `subjects` must
    /// be empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<Source>,
    /// Streams replicated into this stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: String::new(),
            subjects: Vec::new(),
            retention: RetentionPolicy::default(),
            max_consumers: -1,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            max_message_size: -1,
            storage: StorageType::default(),
            num_replicas: 1,
            no_ack: false,
            discard: DiscardPolicy::default(),
            duplicate_window: Duration::ZERO,
            template_owner: None,
            placement: None,
            mirror: None,
            sources: None,
        }
    }
}

impl From<&str> for Config {
    fn from(name: &str) -> Config {
        Config {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

fn unbounded() -> i64 {
    -1
}

fn default_replicas() -> usize {
    1
}

/// Caller-supplied fields for a stream update; unset fields keep their
/// current value.
#[derive(Clone, Debug, Default)]
pub struct UpdateConfig {
    pub subjects: Option<Vec<String>>,
    pub retention: Option<RetentionPolicy>,
    pub discard: Option<DiscardPolicy>,
    pub max_consumers: Option<i64>,
    pub max_messages: Option<i64>,
    pub max_messages_per_subject: Option<i64>,
    pub max_bytes: Option<i64>,
    pub max_age: Option<Duration>,
    pub max_message_size: Option<i64>,
    pub storage: Option<StorageType>,
    pub num_replicas: Option<usize>,
    pub duplicate_window: Option<Duration>,
}

impl UpdateConfig {
    pub(crate) fn apply(self, mut config: Config) -> Config {
        if let Some(subjects) = self.subjects {
            config.subjects = subjects;
        }
        if let Some(retention) = self.retention {
            config.retention = retention;
        }
        if let Some(discard) = self.discard {
            config.discard = discard;
        }
        if let Some(max_consumers) = self.max_consumers {
            config.max_consumers = max_consumers;
        }
        if let Some(max_messages) = self.max_messages {
            config.max_messages = max_messages;
        }
        if let Some(max_messages_per_subject) = self.max_messages_per_subject {
            config.max_messages_per_subject = max_messages_per_subject;
        }
        if let Some(max_bytes) = self.max_bytes {
            config.max_bytes = max_bytes;
        }
        if let Some(max_age) = self.max_age {
            config.max_age = max_age;
        }
        if let Some(max_message_size) = self.max_message_size {
            config.max_message_size = max_message_size;
        }
        if let Some(storage) = self.storage {
            config.storage = storage;
        }
        if let Some(num_replicas) = self.num_replicas {
            config.num_replicas = num_replicas;
        }
        if let Some(duplicate_window) = self.duplicate_window {
            config.duplicate_window = duplicate_window;
        }
        config
    }
}

/// Placement directives to consider when placing replicas of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// The desired cluster name.
    pub cluster: String,
    /// Tags required on servers hosting the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// A mirror or source reference to another stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Name of the referenced stream.
    pub name: String,
    /// Sequence to start replicating from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    /// Timestamp to start replicating from.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub opt_start_time: Option<OffsetDateTime>,
    /// Replicate only messages matching this subject filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    /// Reference to a stream in another account or JetStream domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
}

/// A stream source in another account or JetStream domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct External {
    /// The API prefix importing the other account or domain.
    #[serde(rename = "api")]
    pub api_prefix: String,
    /// The delivery subject used for push consumers.
    #[serde(default, rename = "deliver", skip_serializing_if = "Option::is_none")]
    pub delivery_prefix: Option<String>,
}

/// Current state of a stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct State {
    /// Number of messages stored in the stream.
    pub messages: u64,
    /// Combined size of all stored messages.
    pub bytes: u64,
    /// Sequence of the first stored message.
    #[serde(rename = "first_seq")]
    pub first_sequence: u64,
    /// Timestamp of the first stored message.
    #[serde(default, rename = "first_ts", with = "time::serde::rfc3339::option")]
    pub first_timestamp: Option<OffsetDateTime>,
    /// Sequence of the last stored message.
    #[serde(rename = "last_seq")]
    pub last_sequence: u64,
    /// Timestamp of the last stored message.
    #[serde(default, rename = "last_ts", with = "time::serde::rfc3339::option")]
    pub last_timestamp: Option<OffsetDateTime>,
    /// Number of consumers attached to the stream.
    #[serde(default)]
    pub consumer_count: u64,
}

/// Configuration and state of a stream as reported by the server.
#[derive(Clone, Debug, Deserialize)]
pub struct StreamInfo {
    /// The active configuration.
    pub config: Config,
    /// When the stream was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    /// Detail about the current state.
    pub state: State,
}

/// Reply to a delete style operation.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct DeleteStatus {
    pub success: bool,
}

/// Bounds for a purge operation. `sequence` and `keep` are mutually
/// exclusive; either may be combined with the subject filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PurgeRequest {
    /// Restrict purging to messages matching this subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Purge all messages up to but not including this sequence.
    #[serde(rename = "seq", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Ensure this many messages remain after the purge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep: Option<u64>,
}

/// Reply to a purge operation.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct PurgeResponse {
    pub success: bool,
    /// Number of messages removed.
    pub purged: u64,
}

/// A page of streams returned by the list operation.
#[derive(Clone, Debug, Deserialize)]
pub struct StreamsPage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(default, deserialize_with = "crate::jetstream::response::null_default")]
    pub streams: Vec<StreamInfo>,
}

/// A page of stream names returned by the names operation.
#[derive(Clone, Debug, Deserialize)]
pub struct StreamNamesPage {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(default, deserialize_with = "crate::jetstream::response::null_default")]
    pub streams: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InfoRequest {
    pub(crate) deleted_details: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListRequest {
    pub(crate) offset: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct MsgGetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_by_subj: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MsgDeleteRequest {
    pub(crate) seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) no_erase: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MsgGetResponse {
    pub(crate) message: RawMessage,
}

/// A stored message as returned by the message-get API, with payload and
/// headers still in their base64 wire form.
#[derive(Clone, Debug, Deserialize)]
pub struct RawMessage {
    /// The subject the message was originally received on.
    pub subject: String,
    /// The sequence the message holds in the stream.
    #[serde(rename = "seq")]
    pub sequence: u64,
    /// The base64 encoded payload.
    #[serde(default)]
    pub data: String,
    /// When the server received the message.
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    /// The base64 encoded header block, when present.
    #[serde(default)]
    pub hdrs: Option<String>,
}

/// A message obtained from a stream, with the payload decoded.
#[derive(Clone, Debug)]
pub struct StreamMessage {
    /// The subject the message was originally received on.
    pub subject: String,
    /// The sequence the message holds in the stream.
    pub sequence: u64,
    /// The decoded payload.
    pub payload: Bytes,
    /// When the server received the message.
    pub time: OffsetDateTime,
    /// Headers carried by the message.
    pub headers: Option<HeaderMap>,
}

impl TryFrom<RawMessage> for StreamMessage {
    type Error = Error;

    fn try_from(raw: RawMessage) -> Result<StreamMessage, Error> {
        let payload = base64::decode(&raw.data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let headers = match &raw.hdrs {
            None => None,
            Some(headers) => {
                let block = base64::decode(headers)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                Some(header::parse_headers(&block)?)
            }
        };

        Ok(StreamMessage {
            subject: raw.subject,
            sequence: raw.sequence,
            payload: payload.into(),
            time: raw.time,
            headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("ORDERS").is_ok());
        assert!(validate_name("orders-2022").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad.name").is_err());
        assert!(validate_name("wild*card").is_err());
        assert!(validate_name("tail>").is_err());
        assert!(validate_name("with space").is_err());
    }

    #[test]
    fn config_round_trips_with_wire_names() {
        let config = Config {
            name: "events".to_string(),
            subjects: vec!["events.>".to_string()],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(60),
            discard: DiscardPolicy::New,
            storage: StorageType::Memory,
            ..Default::default()
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["retention"], "workqueue");
        assert_eq!(json["discard"], "new");
        assert_eq!(json["storage"], "memory");
        assert_eq!(json["max_age"], 60_000_000_000u64);
        assert_eq!(json["max_msgs"], -1);
        assert_eq!(json["max_msgs_per_subject"], -1);
        assert_eq!(json["max_msg_size"], -1);
        assert_eq!(json["num_replicas"], 1);

        let parsed: Config = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn config_defaults_tolerate_sparse_replies() {
        let parsed: Config =
            serde_json::from_str(r#"{"name":"S1","retention":"limits","storage":"file"}"#).unwrap();
        assert_eq!(parsed.max_consumers, -1);
        assert_eq!(parsed.max_messages, -1);
        assert_eq!(parsed.max_age, Duration::ZERO);
        assert_eq!(parsed.num_replicas, 1);
        assert!(parsed.subjects.is_empty());
    }

    #[test]
    fn update_overlays_only_set_fields() {
        let current = Config {
            name: "S1".to_string(),
            subjects: vec!["s1.>".to_string()],
            max_messages: 100,
            ..Default::default()
        };
        let update = UpdateConfig {
            max_bytes: Some(1024),
            max_age: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let merged = update.apply(current.clone());
        assert_eq!(merged.name, "S1");
        assert_eq!(merged.subjects, current.subjects);
        assert_eq!(merged.max_messages, 100);
        assert_eq!(merged.max_bytes, 1024);
        assert_eq!(merged.max_age, Duration::from_secs(30));
    }

    #[test]
    fn raw_message_decodes_payload_and_headers() {
        let raw = RawMessage {
            subject: "S1.x".to_string(),
            sequence: 1,
            data: base64::encode(b"test"),
            time: OffsetDateTime::UNIX_EPOCH,
            hdrs: Some(base64::encode(b"NATS/1.0\r\nfoo: bar\r\n\r\n")),
        };

        let message = StreamMessage::try_from(raw).unwrap();
        assert_eq!(message.payload.as_ref(), b"test");
        assert_eq!(message.headers.unwrap().get("foo").unwrap(), "bar");
    }

    #[test]
    fn raw_message_rejects_bad_base64() {
        let raw = RawMessage {
            subject: "S1.x".to_string(),
            sequence: 1,
            data: "%%%".to_string(),
            time: OffsetDateTime::UNIX_EPOCH,
            hdrs: None,
        };
        assert!(StreamMessage::try_from(raw).is_err());
    }

    #[test]
    fn stream_info_parses_server_reply() {
        let info: StreamInfo = serde_json::from_str(
            r#"{
                "type": "io.nats.jetstream.api.v1.stream_create_response",
                "config": {
                    "name": "S1",
                    "subjects": ["S1.>"],
                    "retention": "limits",
                    "max_consumers": -1,
                    "max_msgs": -1,
                    "max_bytes": -1,
                    "max_age": 0,
                    "max_msg_size": -1,
                    "storage": "file",
                    "num_replicas": 1,
                    "discard": "old",
                    "duplicate_window": 120000000000
                },
                "created": "2022-03-21T10:15:00Z",
                "state": {
                    "messages": 3,
                    "bytes": 120,
                    "first_seq": 1,
                    "first_ts": "2022-03-21T10:15:01Z",
                    "last_seq": 3,
                    "last_ts": "2022-03-21T10:15:02Z",
                    "consumer_count": 1
                }
            }"#,
        )
        .unwrap();

        assert_eq!(info.config.name, "S1");
        assert_eq!(info.config.duplicate_window, Duration::from_secs(120));
        assert_eq!(info.state.messages, 3);
        assert_eq!(info.state.first_sequence, 1);
        assert_eq!(info.state.last_sequence, 3);
    }
}
