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

//! A key-value store built on top of streams: a bucket keeps the last value
//! per key, with an optional bounded history.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::jetstream::consumer::{self, AckPolicy, DeliverPolicy, ReplayPolicy};
use crate::jetstream::context::Context;
use crate::jetstream::publish::PublishAck;
use crate::jetstream::stream::{self, DeleteStatus, RetentionPolicy, StorageType, StreamMessage};
use crate::jetstream::Message;
use crate::Error;

static VALID_BUCKET_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());
static VALID_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[-/_=\.a-zA-Z0-9]+$").unwrap());

/// Streams backing a bucket are named `KV_<bucket>`.
const STREAM_PREFIX: &str = "KV_";
/// Values are published under `$KV.<bucket>.<key>`.
const SUBJECT_PREFIX: &str = "$KV.";

/// Most historic values a bucket can keep per key.
const MAX_HISTORY: i64 = 64;
/// Buckets expiring faster than this track duplicates over the full TTL.
const DUPLICATE_WINDOW_CEILING: Duration = Duration::from_secs(2 * 60);

/// Configuration of a key-value bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Name of the bucket.
    pub bucket: String,
    /// How many historic values to keep per key, at least 1.
    pub history: i64,
    /// How long values are retained; zero keeps them forever.
    pub max_age: Duration,
    /// Maximum size of a single value, `-1` for unlimited.
    pub max_value_size: i64,
    /// Maximum size of the whole bucket, `-1` for unlimited.
    pub max_bytes: i64,
    /// How many replicas to keep of the data.
    pub num_replicas: usize,
    /// The storage backend for the backing stream.
    pub storage: StorageType,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bucket: String::new(),
            history: 1,
            max_age: Duration::ZERO,
            max_value_size: -1,
            max_bytes: -1,
            num_replicas: 1,
            storage: StorageType::File,
        }
    }
}

/// Derives the backing stream configuration for a bucket.
pub(crate) fn stream_config(config: &Config) -> Result<stream::Config, Error> {
    if !VALID_BUCKET_NAME.is_match(&config.bucket) {
        return Err(Box::new(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid bucket name {:?}", config.bucket),
        )));
    }
    if config.history < 1 || config.history > MAX_HISTORY {
        return Err(Box::new(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("history must be between 1 and {}", MAX_HISTORY),
        )));
    }

    // Short lived buckets deduplicate over their whole lifetime; otherwise
    // the server default window applies.
    let duplicate_window =
        if config.max_age > Duration::ZERO && config.max_age < DUPLICATE_WINDOW_CEILING {
            config.max_age
        } else {
            Duration::ZERO
        };

    Ok(stream::Config {
        name: format!("{}{}", STREAM_PREFIX, config.bucket),
        subjects: vec![format!("{}{}.>", SUBJECT_PREFIX, config.bucket)],
        retention: RetentionPolicy::Limits,
        storage: config.storage,
        num_replicas: config.num_replicas,
        max_messages_per_subject: config.history,
        max_age: config.max_age,
        max_message_size: config.max_value_size,
        max_bytes: config.max_bytes,
        duplicate_window,
        no_ack: false,
        ..Default::default()
    })
}

impl Context {
    /// Creates a new bucket backed by a stream named `KV_<bucket>`.
    pub async fn create_key_value(&self, config: Config) -> Result<Store, Error> {
        let stream_config = stream_config(&config)?;
        self.create_stream(stream_config).await?;
        Ok(Store::new(self.clone(), config.bucket))
    }

    /// Binds to an existing bucket.
    pub async fn key_value<T: AsRef<str>>(&self, bucket: T) -> Result<Store, Error> {
        let bucket = bucket.as_ref();
        if !VALID_BUCKET_NAME.is_match(bucket) {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid bucket name {:?}", bucket),
            )));
        }
        self.get_stream(format!("{}{}", STREAM_PREFIX, bucket))
            .await?;
        Ok(Store::new(self.clone(), bucket.to_string()))
    }

    /// Permanently deletes a bucket and every value it holds.
    pub async fn delete_key_value<T: AsRef<str>>(&self, bucket: T) -> Result<DeleteStatus, Error> {
        self.delete_stream(format!("{}{}", STREAM_PREFIX, bucket.as_ref()))
            .await
    }
}

/// A handle to a key-value bucket.
#[derive(Clone, Debug)]
pub struct Store {
    context: Context,
    bucket: String,
    stream_name: String,
    subject_prefix: String,
}

impl Store {
    fn new(context: Context, bucket: String) -> Store {
        Store {
            stream_name: format!("{}{}", STREAM_PREFIX, bucket),
            subject_prefix: format!("{}{}.", SUBJECT_PREFIX, bucket),
            context,
            bucket,
        }
    }

    /// Name of the bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Stores a value under the key, inserting or updating it, and returns
    /// the stream acknowledgement.
    pub async fn put<T: AsRef<str>>(&self, key: T, value: Bytes) -> Result<PublishAck, Error> {
        let key = self.validate_key(key.as_ref())?;
        self.context
            .publish(format!("{}{}", self.subject_prefix, key), value)
            .await
    }

    /// Fetches the current value for a key.
    pub async fn get<T: AsRef<str>>(&self, key: T) -> Result<StreamMessage, Error> {
        let key = self.validate_key(key.as_ref())?;
        self.context
            .get_last_message(
                &self.stream_name,
                &format!("{}{}", self.subject_prefix, key),
            )
            .await
    }

    /// Returns the retained values for a key, oldest first.
    ///
    /// A throwaway durable consumer filtered on the key drains exactly the
    /// pending message count and is deleted afterwards.
    pub async fn history<T: AsRef<str>>(&self, key: T) -> Result<Vec<Message>, Error> {
        let key = self.validate_key(key.as_ref())?;

        let consumer = self
            .context
            .create_consumer(
                self.stream_name.as_str(),
                consumer::Config {
                    durable_name: Some(format!("history_{}", nuid::next())),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    replay_policy: ReplayPolicy::Instant,
                    filter_subject: Some(format!("{}{}", self.subject_prefix, key)),
                    ..Default::default()
                },
            )
            .await?;
        let consumer_name = consumer.cached_info().name.clone();
        let pending = consumer.cached_info().num_pending as usize;

        let mut entries = Vec::with_capacity(pending);
        let mut failure = None;
        if pending > 0 {
            match consumer.fetch(pending).await {
                Ok(messages) => {
                    futures::pin_mut!(messages);
                    while let Some(message) = messages.next().await {
                        match message {
                            Ok(message) => entries.push(message),
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        }
                    }
                }
                Err(err) => failure = Some(err),
            }
        }

        let _ = self
            .context
            .delete_consumer(&self.stream_name, &consumer_name)
            .await;

        match failure {
            Some(err) => Err(err),
            None => Ok(entries),
        }
    }

    fn validate_key<'a>(&self, key: &'a str) -> Result<&'a str, Error> {
        if VALID_KEY.is_match(key) && !key.starts_with('.') && !key.ends_with('.') {
            Ok(key)
        } else {
            Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid key {:?}", key),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_maps_onto_stream_config() {
        let config = stream_config(&Config {
            bucket: "CONFIG".to_string(),
            history: 3,
            max_age: Duration::from_secs(30),
            max_value_size: 1024,
            max_bytes: 1024 * 1024,
            num_replicas: 3,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.name, "KV_CONFIG");
        assert_eq!(config.subjects, vec!["$KV.CONFIG.>".to_string()]);
        assert_eq!(config.retention, RetentionPolicy::Limits);
        assert_eq!(config.storage, StorageType::File);
        assert_eq!(config.max_messages_per_subject, 3);
        assert_eq!(config.max_age, Duration::from_secs(30));
        assert_eq!(config.max_message_size, 1024);
        assert_eq!(config.max_bytes, 1024 * 1024);
        assert_eq!(config.num_replicas, 3);
        assert!(!config.no_ack);
    }

    #[test]
    fn short_ttl_sets_duplicate_window_to_ttl() {
        let short = stream_config(&Config {
            bucket: "B".to_string(),
            max_age: Duration::from_secs(30),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(short.duplicate_window, Duration::from_secs(30));

        let long = stream_config(&Config {
            bucket: "B".to_string(),
            max_age: Duration::from_secs(10 * 60),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(long.duplicate_window, Duration::ZERO);

        let forever = stream_config(&Config {
            bucket: "B".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(forever.duplicate_window, Duration::ZERO);
    }

    #[test]
    fn rejects_invalid_buckets_and_history() {
        assert!(stream_config(&Config {
            bucket: "bad.bucket".to_string(),
            ..Default::default()
        })
        .is_err());
        assert!(stream_config(&Config {
            bucket: "B".to_string(),
            history: 0,
            ..Default::default()
        })
        .is_err());
        assert!(stream_config(&Config {
            bucket: "B".to_string(),
            history: MAX_HISTORY + 1,
            ..Default::default()
        })
        .is_err());
    }
}
