//! Environment-variable configuration loading.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::{ConfigError, PipelineConfig};
use crate::core::tts::HttpProviderConfig;

/// Parses an optional env var, falling back to `default` when unset.
fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse_var(
        key,
        default.as_millis() as u64,
    )?))
}

fn parse_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl PipelineConfig {
    /// Loads configuration from environment variables, with the struct
    /// defaults for anything unset. Also loads a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut config = PipelineConfig::default();

        // Speculation / correction
        config.speculation.min_speculation_length = parse_var(
            "PARLEY_MIN_SPECULATION_LENGTH",
            config.speculation.min_speculation_length,
        )?;
        config.speculation.pivot_budget =
            parse_millis("PARLEY_PIVOT_BUDGET_MS", config.speculation.pivot_budget)?;
        config.correction.correction_threshold = parse_var(
            "PARLEY_CORRECTION_THRESHOLD",
            config.correction.correction_threshold,
        )?;

        // Backchannel timing bands
        config.backchannel.enabled =
            parse_bool("PARLEY_BACKCHANNEL_ENABLED", config.backchannel.enabled);
        config.backchannel.delay =
            parse_millis("PARLEY_BACKCHANNEL_DELAY_MS", config.backchannel.delay)?;
        config.backchannel.ack_band =
            parse_millis("PARLEY_BACKCHANNEL_ACK_BAND_MS", config.backchannel.ack_band)?;
        config.backchannel.processing_band = parse_millis(
            "PARLEY_BACKCHANNEL_PROCESSING_BAND_MS",
            config.backchannel.processing_band,
        )?;
        config.backchannel.emergency_after = parse_millis(
            "PARLEY_BACKCHANNEL_EMERGENCY_MS",
            config.backchannel.emergency_after,
        )?;

        // Chunker
        config.chunker.first_chunk_min_chars = parse_var(
            "PARLEY_CHUNK_FIRST_MIN_CHARS",
            config.chunker.first_chunk_min_chars,
        )?;
        config.chunker.min_chunk_chars =
            parse_var("PARLEY_CHUNK_MIN_CHARS", config.chunker.min_chunk_chars)?;
        config.chunker.max_buffer_chars =
            parse_var("PARLEY_CHUNK_MAX_BUFFER_CHARS", config.chunker.max_buffer_chars)?;

        // Synthesis chain
        config.synthesis.max_attempts_per_provider = parse_var(
            "PARLEY_SYNTH_MAX_ATTEMPTS",
            config.synthesis.max_attempts_per_provider,
        )?;
        config.synthesis.breaker.failure_threshold = parse_var(
            "PARLEY_BREAKER_FAILURE_THRESHOLD",
            config.synthesis.breaker.failure_threshold,
        )?;
        config.synthesis.breaker.cooldown =
            parse_millis("PARLEY_BREAKER_COOLDOWN_MS", config.synthesis.breaker.cooldown)?;

        // Voice
        if let Ok(voice_id) = env::var("PARLEY_VOICE_ID") {
            config.voice.voice_id = voice_id;
        }
        if let Ok(model) = env::var("PARLEY_TTS_MODEL") {
            config.voice.model = model;
        }
        config.voice.sample_rate = parse_var("PARLEY_SAMPLE_RATE", config.voice.sample_rate)?;
        config.voice.speaking_rate =
            parse_var("PARLEY_SPEAKING_RATE", config.voice.speaking_rate)?;

        // Cache
        config.cache.max_entries = parse_var("PARLEY_CACHE_MAX_ENTRIES", config.cache.max_entries)?;
        let ttl_seconds = parse_var(
            "PARLEY_CACHE_TTL_SECONDS",
            config.cache.ttl.map(|d| d.as_secs()).unwrap_or(0),
        )?;
        config.cache.ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));

        // Provider pool
        config.pool.max_concurrent =
            parse_var("PARLEY_POOL_MAX_CONCURRENT", config.pool.max_concurrent)?;
        config.pool.acquire_timeout =
            parse_millis("PARLEY_POOL_ACQUIRE_TIMEOUT_MS", config.pool.acquire_timeout)?;

        // Synthesis endpoints: primary, then optional fallback
        let mut endpoints = Vec::new();
        if let Ok(url) = env::var("PARLEY_TTS_PRIMARY_URL") {
            endpoints.push(HttpProviderConfig {
                name: "primary".to_string(),
                url,
                api_key: env::var("PARLEY_TTS_PRIMARY_API_KEY").ok(),
            });
        }
        if let Ok(url) = env::var("PARLEY_TTS_FALLBACK_URL") {
            endpoints.push(HttpProviderConfig {
                name: "fallback".to_string(),
                url,
                api_key: env::var("PARLEY_TTS_FALLBACK_API_KEY").ok(),
            });
        }
        config.synthesis_endpoints = endpoints;

        config.metrics_history = parse_var("PARLEY_METRICS_HISTORY", config.metrics_history)?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("PARLEY_MIN_SPECULATION_LENGTH");
            env::remove_var("PARLEY_CORRECTION_THRESHOLD");
            env::remove_var("PARLEY_BACKCHANNEL_ENABLED");
            env::remove_var("PARLEY_CACHE_TTL_SECONDS");
            env::remove_var("PARLEY_TTS_PRIMARY_URL");
            env::remove_var("PARLEY_TTS_PRIMARY_API_KEY");
            env::remove_var("PARLEY_TTS_FALLBACK_URL");
        }
    }

    #[test]
    #[serial]
    fn defaults_load_without_env() {
        cleanup_env_vars();
        let config = PipelineConfig::from_env().expect("should load config");
        assert_eq!(config.speculation.min_speculation_length, 12);
        assert!((config.correction.correction_threshold - 0.75).abs() < f32::EPSILON);
        assert!(config.synthesis_endpoints.is_empty());
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PARLEY_MIN_SPECULATION_LENGTH", "20");
            env::set_var("PARLEY_CORRECTION_THRESHOLD", "0.6");
            env::set_var("PARLEY_BACKCHANNEL_ENABLED", "false");
            env::set_var("PARLEY_CACHE_TTL_SECONDS", "60");
        }
        let config = PipelineConfig::from_env().expect("should load config");
        assert_eq!(config.speculation.min_speculation_length, 20);
        assert!((config.correction.correction_threshold - 0.6).abs() < f32::EPSILON);
        assert!(!config.backchannel.enabled);
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(60)));
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn provider_endpoints_build_the_chain() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PARLEY_TTS_PRIMARY_URL", "https://tts.example.com/v1/speak");
            env::set_var("PARLEY_TTS_PRIMARY_API_KEY", "key-123");
            env::set_var("PARLEY_TTS_FALLBACK_URL", "https://backup.example.com/speak");
        }
        let config = PipelineConfig::from_env().expect("should load config");
        assert_eq!(config.synthesis_endpoints.len(), 2);
        assert_eq!(config.synthesis_endpoints[0].name, "primary");
        assert_eq!(
            config.synthesis_endpoints[0].api_key.as_deref(),
            Some("key-123")
        );
        assert_eq!(config.synthesis_endpoints[1].name, "fallback");
        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn invalid_numeric_is_an_error() {
        cleanup_env_vars();
        unsafe {
            env::set_var("PARLEY_MIN_SPECULATION_LENGTH", "not-a-number");
        }
        assert!(PipelineConfig::from_env().is_err());
        cleanup_env_vars();
    }
}
