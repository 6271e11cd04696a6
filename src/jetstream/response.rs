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

use serde::{Deserialize, Deserializer};

/// A JetStream API reply: either the operation-specific success body or an
/// error envelope. The two are mutually exclusive, which the untagged
/// representation guarantees by trying the error branch first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Response<T> {
    Err {
        #[serde(rename = "type", default)]
        kind: String,
        error: ErrorInfo,
    },
    Ok(T),
}

impl<T> Response<T> {
    /// Converts the envelope into a `Result`, surfacing the error branch as
    /// a typed [`ApiError`].
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Err { kind, error } => Err(ApiError {
                kind,
                code: error.code,
                description: error.description.unwrap_or_default(),
            }),
        }
    }
}

/// The `error` object of an error envelope.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    /// HTTP-like error code in the 300 to 699 range.
    #[serde(default = "default_error_code")]
    pub code: u64,
    /// A human friendly description of the error.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_error_code() -> u64 {
    500
}

/// Paged replies encode empty collections as `null`.
pub(crate) fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A typed JetStream API failure, raised by the high level operations when
/// the server replies with an error envelope.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("jetstream api error: code {code}, description: {description:?}, type: {kind}")]
pub struct ApiError {
    /// The response type discriminator the error arrived under.
    pub kind: String,
    /// HTTP-like error code in the 300 to 699 range.
    pub code: u64,
    /// A human friendly description of the error.
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct DeleteStatus {
        success: bool,
    }

    #[test]
    fn discriminates_success() {
        let response: Response<DeleteStatus> = serde_json::from_str(
            r#"{"type":"io.nats.jetstream.api.v1.stream_delete_response","success":true}"#,
        )
        .unwrap();
        match response {
            Response::Ok(status) => assert!(status.success),
            Response::Err { .. } => panic!("expected success branch"),
        }
    }

    #[test]
    fn discriminates_error() {
        let response: Response<DeleteStatus> = serde_json::from_str(
            r#"{"type":"io.nats.jetstream.api.v1.stream_delete_response","error":{"code":404,"description":"stream not found"}}"#,
        )
        .unwrap();
        match response {
            Response::Err { kind, error } => {
                assert_eq!(kind, "io.nats.jetstream.api.v1.stream_delete_response");
                assert_eq!(error.code, 404);
                assert_eq!(error.description.as_deref(), Some("stream not found"));
            }
            Response::Ok(_) => panic!("expected error branch"),
        }
    }

    #[test]
    fn error_code_defaults_to_500() {
        let response: Response<DeleteStatus> =
            serde_json::from_str(r#"{"type":"t","error":{}}"#).unwrap();
        match response.into_result() {
            Err(err) => {
                assert_eq!(err.code, 500);
                assert_eq!(err.description, "");
            }
            Ok(_) => panic!("expected error branch"),
        }
    }
}
