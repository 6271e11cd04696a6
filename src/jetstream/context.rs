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
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ClientError;
use crate::header::HeaderMap;
use crate::jetstream::consumer::{self, Consumer, ConsumerInfo, ConsumerNamesPage, ConsumersPage};
use crate::jetstream::publish::PublishAck;
use crate::jetstream::response::{ApiError, Response};
use crate::jetstream::stream::{
    self, DeleteStatus, PurgeRequest, PurgeResponse, Stream, StreamInfo, StreamMessage,
    StreamNamesPage, StreamsPage,
};
use crate::{Client, Error};

const DEFAULT_API_PREFIX: &str = "$JS.API";
const DEFAULT_API_TIMEOUT: Duration = Duration::from_millis(500);

/// A context which can perform JetStream-scoped requests.
#[derive(Clone, Debug)]
pub struct Context {
    client: Client,
    prefix: String,
    timeout: Duration,
}

impl Context {
    pub(crate) fn new(client: Client) -> Context {
        Context::with_prefix(client, DEFAULT_API_PREFIX)
    }

    pub(crate) fn with_domain<T: AsRef<str>>(client: Client, domain: T) -> Context {
        Context::with_prefix(client, &format!("$JS.{}.API", domain.as_ref()))
    }

    pub(crate) fn with_prefix(client: Client, prefix: &str) -> Context {
        Context {
            client,
            prefix: prefix.to_string(),
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    /// The underlying core client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Overrides the timeout applied to every API request.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Publishes a message to a stream and waits for the acknowledgement.
    ///
    /// The reply travels over a single-use inbox; the body must be a JSON
    /// publish acknowledgement.
    pub async fn publish(&self, subject: String, payload: Bytes) -> Result<PublishAck, Error> {
        self.publish_inner(subject, None, payload).await
    }

    /// Publishes a message with headers to a stream and waits for the
    /// acknowledgement.
    pub async fn publish_with_headers(
        &self,
        subject: String,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<PublishAck, Error> {
        self.publish_inner(subject, Some(headers), payload).await
    }

    async fn publish_inner(
        &self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<PublishAck, Error> {
        let client = self.client();
        let inbox = client.new_inbox();
        let mut subscriber = client.subscribe(inbox.clone()).await?;
        subscriber.unsubscribe_after(1).await?;

        match headers {
            Some(headers) => {
                client
                    .publish_with_reply_and_headers(subject, inbox, headers, payload)
                    .await?
            }
            None => client.publish_with_reply(subject, inbox, payload).await?,
        }

        let message = match tokio::time::timeout(self.timeout, subscriber.next()).await {
            Ok(Some(message)) => message,
            Ok(None) => return Err(Box::new(ClientError::ConnectionClosed)),
            Err(_) => {
                let _ = subscriber.unsubscribe().await;
                return Err(Box::new(ClientError::TimedOut));
            }
        };
        if message.is_no_responders() {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::Other,
                "no stream is listening on the published subject",
            )));
        }

        let ack = serde_json::from_slice::<PublishAck>(&message.payload)?;
        Ok(ack)
    }

    /// Sends a request to the API namespace and parses the reply envelope.
    ///
    /// This is the raw escape hatch: the returned [`Response`] exposes the
    /// success/error discrimination directly and never raises. The typed
    /// operations below surface the error branch as [`ApiError`].
    pub async fn request<T, V>(&self, subject: &str, payload: &T) -> Result<Response<V>, Error>
    where
        T: ?Sized + Serialize,
        V: DeserializeOwned,
    {
        let request = serde_json::to_vec(payload)?;
        let message = self
            .client
            .request_timeout(
                format!("{}.{}", self.prefix, subject),
                request.into(),
                self.timeout,
            )
            .await?;
        if message.is_no_responders() {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::Other,
                "JetStream is not enabled or not reachable",
            )));
        }

        let response = serde_json::from_slice(&message.payload)?;
        Ok(response)
    }

    async fn request_ok<T, V>(&self, subject: &str, payload: &T) -> Result<V, Error>
    where
        T: ?Sized + Serialize,
        V: DeserializeOwned,
    {
        let response: Response<V> = self.request(subject, payload).await?;
        Ok(response.into_result()?)
    }

    /// Returns statistics and limits of the current account.
    pub async fn account_info(&self) -> Result<AccountInfo, Error> {
        self.request_ok("INFO", &json!({})).await
    }

    /// Creates a stream with the given configuration on the server.
    pub async fn create_stream<C: Into<stream::Config>>(&self, config: C) -> Result<Stream, Error> {
        let config = config.into();
        stream::validate_name(&config.name)?;
        let info: StreamInfo = self
            .request_ok(&format!("STREAM.CREATE.{}", config.name), &config)
            .await?;
        Ok(Stream::new(self.clone(), info))
    }

    /// Looks up a stream by name.
    pub async fn get_stream<T: AsRef<str>>(&self, name: T) -> Result<Stream, Error> {
        let info = self.stream_info(name.as_ref(), false).await?;
        Ok(Stream::new(self.clone(), info))
    }

    /// Looks up a stream by name, creating it from the given configuration
    /// when it does not exist yet.
    pub async fn get_or_create_stream<C: Into<stream::Config>>(
        &self,
        config: C,
    ) -> Result<Stream, Error> {
        let config = config.into();
        stream::validate_name(&config.name)?;
        match self.stream_info(&config.name, false).await {
            Ok(info) => Ok(Stream::new(self.clone(), info)),
            Err(err) => match err.downcast_ref::<ApiError>() {
                Some(api_error) if api_error.code == 404 => self.create_stream(config).await,
                _ => Err(err),
            },
        }
    }

    pub(crate) async fn stream_info(
        &self,
        name: &str,
        deleted_details: bool,
    ) -> Result<StreamInfo, Error> {
        stream::validate_name(name)?;
        self.request_ok(
            &format!("STREAM.INFO.{}", name),
            &stream::InfoRequest { deleted_details },
        )
        .await
    }

    /// Updates an existing stream: the current configuration is fetched,
    /// caller-supplied fields are overlaid and the merged object is sent.
    pub async fn update_stream(
        &self,
        name: &str,
        update: stream::UpdateConfig,
    ) -> Result<StreamInfo, Error> {
        let current = self.stream_info(name, false).await?.config;
        let merged = update.apply(current);
        self.request_ok(&format!("STREAM.UPDATE.{}", name), &merged)
            .await
    }

    /// Deletes a stream and all data it retains.
    pub async fn delete_stream<T: AsRef<str>>(&self, name: T) -> Result<DeleteStatus, Error> {
        stream::validate_name(name.as_ref())?;
        self.request_ok(&format!("STREAM.DELETE.{}", name.as_ref()), &json!({}))
            .await
    }

    /// Lists streams with their configuration and state, starting at the
    /// given offset.
    pub async fn list_streams(&self, offset: usize) -> Result<StreamsPage, Error> {
        self.request_ok("STREAM.LIST", &stream::ListRequest { offset })
            .await
    }

    /// Lists stream names, starting at the given offset.
    pub async fn stream_names(&self, offset: usize) -> Result<StreamNamesPage, Error> {
        self.request_ok("STREAM.NAMES", &stream::ListRequest { offset })
            .await
    }

    /// Purges messages from a stream, optionally bounded by a subject
    /// filter, an upper sequence or a number of messages to keep.
    pub async fn purge_stream<T: AsRef<str>>(
        &self,
        name: T,
        request: PurgeRequest,
    ) -> Result<PurgeResponse, Error> {
        stream::validate_name(name.as_ref())?;
        if request.sequence.is_some() && request.keep.is_some() {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                "purge cannot combine sequence with keep",
            )));
        }
        self.request_ok(&format!("STREAM.PURGE.{}", name.as_ref()), &request)
            .await
    }

    /// Fetches a message from a stream by its sequence.
    pub async fn get_message<T: AsRef<str>>(
        &self,
        stream: T,
        sequence: u64,
    ) -> Result<StreamMessage, Error> {
        self.message_get(
            stream.as_ref(),
            &stream::MsgGetRequest {
                seq: Some(sequence),
                last_by_subj: None,
            },
        )
        .await
    }

    /// Fetches the last message a stream holds for a subject.
    pub async fn get_last_message<T: AsRef<str>>(
        &self,
        stream: T,
        subject: &str,
    ) -> Result<StreamMessage, Error> {
        self.message_get(
            stream.as_ref(),
            &stream::MsgGetRequest {
                seq: None,
                last_by_subj: Some(subject.to_string()),
            },
        )
        .await
    }

    async fn message_get(
        &self,
        stream: &str,
        request: &stream::MsgGetRequest,
    ) -> Result<StreamMessage, Error> {
        stream::validate_name(stream)?;
        let response: stream::MsgGetResponse = self
            .request_ok(&format!("STREAM.MSG.GET.{}", stream), request)
            .await?;
        StreamMessage::try_from(response.message)
    }

    /// Deletes a message from a stream by sequence. With `no_erase` the
    /// message is only removed instead of being securely overwritten.
    pub async fn delete_message<T: AsRef<str>>(
        &self,
        stream: T,
        sequence: u64,
        no_erase: bool,
    ) -> Result<DeleteStatus, Error> {
        stream::validate_name(stream.as_ref())?;
        self.request_ok(
            &format!("STREAM.MSG.DELETE.{}", stream.as_ref()),
            &stream::MsgDeleteRequest {
                seq: sequence,
                no_erase: no_erase.then(|| true),
            },
        )
        .await
    }

    /// Creates a consumer on a stream. A configured durable name routes the
    /// request through the durable-create subject.
    pub async fn create_consumer<T: AsRef<str>>(
        &self,
        stream: T,
        config: consumer::Config,
    ) -> Result<Consumer, Error> {
        let stream = stream.as_ref();
        stream::validate_name(stream)?;
        let subject = match &config.durable_name {
            Some(durable) => {
                stream::validate_name(durable)?;
                format!("CONSUMER.DURABLE.CREATE.{}.{}", stream, durable)
            }
            None => format!("CONSUMER.CREATE.{}", stream),
        };
        let info: ConsumerInfo = self
            .request_ok(
                &subject,
                &consumer::CreateConsumerRequest {
                    stream_name: stream.to_string(),
                    config,
                },
            )
            .await?;
        Ok(Consumer::new(self.clone(), info))
    }

    /// Looks up a consumer by stream and name.
    pub async fn get_consumer<T: AsRef<str>>(
        &self,
        stream: T,
        name: T,
    ) -> Result<Consumer, Error> {
        let info = self.consumer_info(stream.as_ref(), name.as_ref()).await?;
        Ok(Consumer::new(self.clone(), info))
    }

    /// Returns current state and configuration of a consumer.
    pub async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerInfo, Error> {
        stream::validate_name(stream)?;
        stream::validate_name(name)?;
        self.request_ok(&format!("CONSUMER.INFO.{}.{}", stream, name), &json!({}))
            .await
    }

    /// Deletes a consumer from a stream.
    pub async fn delete_consumer(&self, stream: &str, name: &str) -> Result<DeleteStatus, Error> {
        stream::validate_name(stream)?;
        stream::validate_name(name)?;
        self.request_ok(&format!("CONSUMER.DELETE.{}.{}", stream, name), &json!({}))
            .await
    }

    /// Lists consumers of a stream with their configuration.
    pub async fn list_consumers<T: AsRef<str>>(
        &self,
        stream: T,
        offset: usize,
    ) -> Result<ConsumersPage, Error> {
        stream::validate_name(stream.as_ref())?;
        self.request_ok(
            &format!("CONSUMER.LIST.{}", stream.as_ref()),
            &stream::ListRequest { offset },
        )
        .await
    }

    /// Lists consumer names of a stream, optionally restricted to consumers
    /// filtering on a subject.
    pub async fn consumer_names<T: AsRef<str>>(
        &self,
        stream: T,
        offset: usize,
        subject: Option<String>,
    ) -> Result<ConsumerNamesPage, Error> {
        stream::validate_name(stream.as_ref())?;
        self.request_ok(
            &format!("CONSUMER.NAMES.{}", stream.as_ref()),
            &consumer::NamesRequest { offset, subject },
        )
        .await
    }
}

/// Account statistics and limits.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AccountInfo {
    /// Memory storage in use for stream messages, in bytes.
    pub memory: u64,
    /// File storage in use for stream messages, in bytes.
    pub storage: u64,
    /// Number of active streams.
    pub streams: u64,
    /// Number of active consumers.
    pub consumers: u64,
    pub limits: AccountLimits,
    pub api: ApiStats,
}

/// Resource limits of an account.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AccountLimits {
    pub max_memory: i64,
    pub max_storage: i64,
    pub max_streams: i64,
    pub max_consumers: i64,
}

/// API request counters of an account.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ApiStats {
    /// Total number of API requests received for this account.
    pub total: u64,
    /// API requests that resulted in an error response.
    pub errors: u64,
}
