//! Pipeline configuration.
//!
//! Every tunable threshold in the pipeline lives here as an explicit struct
//! field with a documented default: speculation length, correction
//! similarity, pivot budget, backchannel timing bands, cache TTL, breaker
//! threshold, pool sizing. Loaded from the environment via
//! [`PipelineConfig::from_env`].

mod env;

use std::time::Duration;

use crate::core::backchannel::BackchannelConfig;
use crate::core::cache::CacheSettings;
use crate::core::chunker::ChunkerConfig;
use crate::core::speculation::{CorrectionConfig, SpeculationConfig};
use crate::core::tts::{HttpProviderConfig, SynthesisSettings, VoiceParams};
use crate::utils::pool::PoolConfig;

/// Configuration load/validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Top-level configuration for the conversation pipeline.
#[derive(Clone)]
pub struct PipelineConfig {
    pub speculation: SpeculationConfig,
    pub correction: CorrectionConfig,
    pub chunker: ChunkerConfig,
    pub backchannel: BackchannelConfig,
    pub synthesis: SynthesisSettings,
    /// Voice used for all synthesized audio on a call.
    pub voice: VoiceParams,
    pub cache: CacheSettings,
    pub pool: PoolConfig,
    /// HTTP synthesis endpoints, primary first. Empty means the caller
    /// supplies providers directly (tests, local simulation).
    pub synthesis_endpoints: Vec<HttpProviderConfig>,
    /// Completed cycles retained per call for summary statistics.
    pub metrics_history: usize,
    /// Fixed utterance when generation fails twice for a turn.
    pub apology_text: String,
    /// Fixed utterance when a final transcript carries no usable text.
    pub reprompt_text: String,
    /// Marker the response model emits when the call should end after this
    /// turn. Stripped from the spoken audio by sanitation.
    pub hangup_marker: String,
    /// How long a turn waits for its audio to finish delivering before the
    /// cycle is closed out.
    pub turn_drain_timeout: Duration,
    /// Grace period for a session to wind down on call end.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            speculation: SpeculationConfig::default(),
            correction: CorrectionConfig::default(),
            chunker: ChunkerConfig::default(),
            backchannel: BackchannelConfig::default(),
            synthesis: SynthesisSettings::default(),
            voice: VoiceParams::default(),
            cache: CacheSettings::default(),
            pool: PoolConfig::default(),
            synthesis_endpoints: Vec::new(),
            metrics_history: 32,
            apology_text: "I'm sorry, I'm having trouble answering right now. \
                           Could you say that again?"
                .to_string(),
            reprompt_text: "Sorry, I didn't catch that. Could you repeat it?".to_string(),
            hangup_marker: "[END_CALL]".to_string(),
            turn_drain_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Sanity checks on threshold relationships.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.correction.correction_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                key: "correction_threshold".to_string(),
                message: format!("must be within 0.0..=1.0, got {threshold}"),
            });
        }
        if self.speculation.min_speculation_length == 0 {
            return Err(ConfigError::Invalid {
                key: "min_speculation_length".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.backchannel.ack_band > self.backchannel.processing_band
            || self.backchannel.processing_band > self.backchannel.emergency_after
        {
            return Err(ConfigError::Invalid {
                key: "backchannel bands".to_string(),
                message: "bands must be ordered ack <= processing <= emergency".to_string(),
            });
        }
        if self.chunker.first_chunk_min_chars > self.chunker.max_buffer_chars {
            return Err(ConfigError::Invalid {
                key: "chunker thresholds".to_string(),
                message: "first chunk threshold exceeds the buffer cap".to_string(),
            });
        }
        Ok(())
    }
}
