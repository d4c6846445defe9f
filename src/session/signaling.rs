//! SDP offer/answer exchange over HTTP.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;

/// Exchanges a local SDP offer for the remote answer.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn exchange(&self, offer_sdp: String) -> Result<String>;
}

/// POSTs the offer as `application/sdp` with the model as a query parameter.
///
/// Talks either to a local relay (no key) or directly to the upstream
/// realtime endpoint, in which case a bearer key and the realtime beta
/// header are attached.
pub struct HttpSignaling {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpSignaling {
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.signaling_url.clone(),
            config.model.clone(),
            config.resolved_api_key(),
        )
    }

    /// Map a non-success response to an error, preferring the upstream
    /// `error.message` when the body carries one.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> SessionError {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| body.trim().to_string());
        SessionError::Signaling(format!("relay HTTP {}: {message}", status.as_u16()))
    }
}

#[async_trait]
impl SignalingClient for HttpSignaling {
    async fn exchange(&self, offer_sdp: String) -> Result<String> {
        let mut request = self
            .client
            .post(&self.url)
            .query(&[("model", self.model.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer_sdp);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key).header("OpenAI-Beta", "realtime=v1");
        }

        tracing::debug!(url = %self.url, model = %self.model, "posting SDP offer");
        let response = request
            .send()
            .await
            .map_err(|e| SessionError::Signaling(format!("offer request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SessionError::Signaling(format!("failed to read answer: {e}")))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &body));
        }
        if body.trim().is_empty() {
            return Err(SessionError::Signaling("empty SDP answer".into()));
        }
        Ok(body)
    }
}
