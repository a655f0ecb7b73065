//! Synthesis provider boundary.
//!
//! A provider turns one sanitized text chunk into audio bytes. Failures are
//! typed so the adapter can choose between retrying with simplified text
//! (invalid input), retrying/falling back (transient), or skipping the
//! provider outright (fatal).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Synthesis failure classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SynthesisError {
    /// The provider rejected the text itself (markup, length, charset).
    /// Worth one retry with a simplified rendering of the same utterance.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Timeouts, rate limits, 5xx, pool exhaustion. Worth retrying and
    /// counts against the provider's circuit breaker.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Auth/config-level failure. Skip straight to the next provider.
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl SynthesisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SynthesisError::Transient(_))
    }
}

/// Result type for synthesis operations.
pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Every synthesis parameter that affects the rendered audio.
///
/// Enumerated explicitly so the cache key, the provider request body, and the
/// configuration surface all agree on exactly which knobs exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceParams {
    /// Voice ID or name to use for synthesis.
    pub voice_id: String,
    /// Synthesis model.
    pub model: String,
    /// Speaking rate (0.25 to 4.0, 1.0 is normal).
    pub speaking_rate: f32,
    /// Voice stability (0.0 to 1.0).
    pub stability: f32,
    /// Similarity boost (0.0 to 1.0).
    pub similarity: f32,
    /// Audio container/encoding, e.g. "linear16".
    pub audio_format: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice_id: "river-en".to_string(),
            model: "standard-v2".to_string(),
            speaking_rate: 1.0,
            stability: 0.5,
            similarity: 0.75,
            audio_format: "linear16".to_string(),
            sample_rate: 24_000,
        }
    }
}

impl VoiceParams {
    /// Canonical string of every audio-affecting field, used for
    /// content-addressed cache keying.
    pub fn cache_fields(&self) -> String {
        format!(
            "{}|{}|{:.3}|{:.3}|{:.3}|{}|{}",
            self.voice_id,
            self.model,
            self.speaking_rate,
            self.stability,
            self.similarity,
            self.audio_format,
            self.sample_rate
        )
    }
}

/// Boundary trait for speech synthesis providers.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    /// Provider identifier used in logs and circuit-breaker state.
    fn name(&self) -> &str;

    /// Synthesizes one text chunk. The text is already sanitized.
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> SynthesisResult<Bytes>;
}
