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

use serde::Deserialize;

/// Acknowledgement returned by the server for a publish that reached a
/// stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PublishAck {
    /// Name of the stream that stored the message.
    pub stream: String,
    /// Sequence the message was assigned in the stream.
    #[serde(rename = "seq", default)]
    pub sequence: u64,
    /// JetStream domain the ack arrived from, when configured.
    #[serde(default)]
    pub domain: Option<String>,
    /// Whether the message was detected as a duplicate within the stream's
    /// duplicate window.
    #[serde(default)]
    pub duplicate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_ack() {
        let ack: PublishAck = serde_json::from_str(r#"{"stream":"S1","seq":7}"#).unwrap();
        assert_eq!(ack.stream, "S1");
        assert_eq!(ack.sequence, 7);
        assert!(!ack.duplicate);
        assert_eq!(ack.domain, None);
    }

    #[test]
    fn parses_duplicate_ack() {
        let ack: PublishAck =
            serde_json::from_str(r#"{"stream":"S1","seq":7,"domain":"hub","duplicate":true}"#)
                .unwrap();
        assert!(ack.duplicate);
        assert_eq!(ack.domain.as_deref(), Some("hub"));
    }
}
