//! Bus envelope handling and outbound republish (§6 "Raw-utterance bus",
//! "Redacted bus", "Lifecycle bus").
//!
//! The bus itself is an external collaborator (§1): "assumed: at-least-once
//! delivery with base64-encoded payloads in an envelope". No client library
//! is modeled — producers push to this pipeline's HTTP endpoints, and this
//! pipeline republishes by posting to the next hop's HTTP endpoint, exactly
//! the way `subscriber_service/main.py`'s push-subscription deployment
//! actually worked.

use async_trait::async_trait;
use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use pii_core::error::{PiiError, Result};

/// The `{"message":{"data":"<base64 JSON>", ...}}` push envelope shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusEnvelope {
    pub message: BusMessage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusMessage {
    pub data: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl BusEnvelope {
    /// Base64-decode and JSON-parse the envelope payload into `T`.
    ///
    /// Decode/parse failures are shape errors (§7.1) — never retried, and
    /// logged at warn- rather than error-severity.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(self.message.data.as_bytes())
            .map_err(|e| PiiError::Shape(format!("invalid base64 payload: {e}")))?;
        serde_json::from_slice(&decoded)
            .map_err(|e| PiiError::Shape(format!("invalid JSON payload: {e}")))
    }

    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let json = serde_json::to_vec(value)?;
        let data = base64::engine::general_purpose::STANDARD.encode(json);
        Ok(Self {
            message: BusMessage {
                data,
                message_id: None,
            },
        })
    }
}

/// Publishes a message onto a downstream bus topic. Modeled as a plain HTTP
/// POST to the consuming service's push endpoint — the same shape this
/// pipeline itself receives on, so dispatcher → redacted-bus → aggregator
/// is just one hop of the same protocol repeated.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic_url: &str, payload: &[u8], bearer_token: &str) -> Result<()>;
}

pub struct HttpBusPublisher {
    client: reqwest::Client,
}

impl HttpBusPublisher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BusPublisher for HttpBusPublisher {
    async fn publish(&self, topic_url: &str, payload: &[u8], bearer_token: &str) -> Result<()> {
        let response = self
            .client
            .post(topic_url)
            .bearer_auth(bearer_token)
            .header("content-type", "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| PiiError::Transient(format!("publish request failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else if response.status().is_server_error() {
            Err(PiiError::Transient(format!(
                "publish target returned {}",
                response.status()
            )))
        } else {
            Err(PiiError::Internal(format!(
                "publish target returned {}",
                response.status()
            )))
        }
    }
}

/// In-process fake used by the binaries' own test suites — records every
/// publish call instead of making a network request.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct Published {
        pub topic_url: String,
        pub payload: Vec<u8>,
        pub bearer_token: String,
    }

    #[derive(Default)]
    pub struct FakeBusPublisher {
        pub published: Mutex<Vec<Published>>,
    }

    impl FakeBusPublisher {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl BusPublisher for FakeBusPublisher {
        async fn publish(&self, topic_url: &str, payload: &[u8], bearer_token: &str) -> Result<()> {
            self.published.lock().unwrap().push(Published {
                topic_url: topic_url.to_string(),
                payload: payload.to_vec(),
                bearer_token: bearer_token.to_string(),
            });
            Ok(())
        }
    }
}
