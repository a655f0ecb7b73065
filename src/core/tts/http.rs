//! Generic HTTP synthesis provider.
//!
//! Posts the utterance and voice parameters as JSON to a configured endpoint
//! and expects raw audio bytes back. Status codes map onto the typed failure
//! taxonomy so the adapter's retry/fallback logic stays provider-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use super::base::{SynthesisError, SynthesisProvider, SynthesisResult, VoiceParams};
use crate::utils::pool::{PoolError, ProviderPool};

/// Endpoint settings for one HTTP synthesis provider.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Identifier used in logs and breaker state.
    pub name: String,
    /// Synthesis endpoint URL.
    pub url: String,
    /// Bearer token, if the endpoint requires one.
    pub api_key: Option<String>,
}

#[derive(Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    voice_id: &'a str,
    model: &'a str,
    speaking_rate: f32,
    stability: f32,
    similarity: f32,
    audio_format: &'a str,
    sample_rate: u32,
}

pub struct HttpSynthesisProvider {
    config: HttpProviderConfig,
    pool: Arc<ProviderPool>,
}

impl HttpSynthesisProvider {
    pub fn new(config: HttpProviderConfig, pool: Arc<ProviderPool>) -> Self {
        Self { config, pool }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> SynthesisError {
        let message = Self::error_message(&body);
        if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            SynthesisError::InvalidInput(format!("{status}: {message}"))
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            SynthesisError::Transient(format!("{status}: {message}"))
        } else {
            SynthesisError::Fatal(format!("{status}: {message}"))
        }
    }

    /// Pulls the message out of a JSON error body when there is one.
    fn error_message(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
            && let Some(message) = value
                .get("error")
                .and_then(|e| e.as_str())
                .or_else(|| value.get("message").and_then(|m| m.as_str()))
        {
            return message.to_string();
        }
        body.to_string()
    }
}

#[async_trait]
impl SynthesisProvider for HttpSynthesisProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn synthesize(&self, text: &str, params: &VoiceParams) -> SynthesisResult<Bytes> {
        let guard = self.pool.acquire().await.map_err(|e| match e {
            PoolError::Exhausted(t) => {
                SynthesisError::Transient(format!("connection pool exhausted after {t:?}"))
            }
            PoolError::Build(msg) => SynthesisError::Fatal(msg),
        })?;

        let body = SynthesisBody {
            text,
            voice_id: &params.voice_id,
            model: &params.model,
            speaking_rate: params.speaking_rate,
            stability: params.stability,
            similarity: params.similarity,
            audio_format: &params.audio_format,
            sample_rate: params.sample_rate,
        };

        let mut request = guard.client().post(&self.config.url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        debug!(provider = %self.config.name, chars = text.len(), "sending synthesis request");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                SynthesisError::Transient(e.to_string())
            } else {
                SynthesisError::Fatal(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!(provider = %self.config.name, %status, "synthesis request failed");
            return Err(Self::classify_status(status, body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Transient(format!("failed to read audio body: {e}")))?;

        if audio.is_empty() {
            return Err(SynthesisError::InvalidInput(
                "provider returned empty audio".to_string(),
            ));
        }

        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let invalid =
            HttpSynthesisProvider::classify_status(reqwest::StatusCode::BAD_REQUEST, String::new());
        assert!(matches!(invalid, SynthesisError::InvalidInput(_)));

        let transient = HttpSynthesisProvider::classify_status(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            String::new(),
        );
        assert!(matches!(transient, SynthesisError::Transient(_)));

        let rate_limited = HttpSynthesisProvider::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            String::new(),
        );
        assert!(matches!(rate_limited, SynthesisError::Transient(_)));

        let fatal =
            HttpSynthesisProvider::classify_status(reqwest::StatusCode::UNAUTHORIZED, String::new());
        assert!(matches!(fatal, SynthesisError::Fatal(_)));
    }

    #[test]
    fn json_error_bodies_are_unwrapped() {
        assert_eq!(
            HttpSynthesisProvider::error_message(r#"{"error": "voice not found"}"#),
            "voice not found"
        );
        assert_eq!(
            HttpSynthesisProvider::error_message(r#"{"message": "rate limited"}"#),
            "rate limited"
        );
        assert_eq!(HttpSynthesisProvider::error_message("plain text"), "plain text");
    }
}
