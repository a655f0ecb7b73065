//! Speech synthesis adapter.
//!
//! Front door for turning a text chunk into deliverable audio. Consults the
//! content-addressed cache first, then walks the provider fallback chain:
//! each provider gets a bounded number of attempts, an invalid-input
//! rejection earns one retry with a simplified rendering, and a per-provider
//! circuit breaker skips providers that keep failing. When the whole chain
//! is exhausted the adapter degrades to the telephony vendor's built-in
//! voice instead of failing the call.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::base::{SynthesisError, SynthesisProvider, VoiceParams};
use super::breaker::{BreakerConfig, CircuitBreaker};
use super::sanitize::{PronunciationMap, sanitize, simplify};
use crate::core::cache::{AudioCache, CacheKey};

/// Deliverable audio, tagged by provenance so the delivery stage dispatches
/// on an explicit variant rather than parsing markers out of strings.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioRef {
    /// Freshly synthesized audio bytes.
    Synthesized(Bytes),
    /// Audio served from the shared cache.
    Cached { key: String, audio: Bytes },
    /// No custom audio available; the delivery channel should speak this
    /// text with the vendor's built-in voice.
    BasicVoice(String),
}

impl AudioRef {
    /// Audio bytes when custom audio exists.
    pub fn audio(&self) -> Option<&Bytes> {
        match self {
            AudioRef::Synthesized(audio) => Some(audio),
            AudioRef::Cached { audio, .. } => Some(audio),
            AudioRef::BasicVoice(_) => None,
        }
    }
}

/// Adapter-level settings.
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    /// Attempts per provider for transient failures.
    pub max_attempts_per_provider: u32,
    /// Circuit breaker applied to each provider in the chain.
    pub breaker: BreakerConfig,
    /// Word -> spoken-form replacements applied before keying and synthesis.
    pub pronunciations: Vec<(String, String)>,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            max_attempts_per_provider: 2,
            breaker: BreakerConfig::default(),
            pronunciations: Vec::new(),
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn SynthesisProvider>,
    breaker: CircuitBreaker,
}

/// Provider-fallback synthesis front end. Shared across sessions.
pub struct SpeechSynthesizer {
    slots: Vec<ProviderSlot>,
    cache: Arc<AudioCache>,
    pronunciations: PronunciationMap,
    max_attempts: u32,
}

impl SpeechSynthesizer {
    pub fn new(
        providers: Vec<Arc<dyn SynthesisProvider>>,
        cache: Arc<AudioCache>,
        settings: SynthesisSettings,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| {
                let breaker = CircuitBreaker::new(provider.name().to_string(), settings.breaker);
                ProviderSlot { provider, breaker }
            })
            .collect();
        Self {
            slots,
            cache,
            pronunciations: PronunciationMap::new(&settings.pronunciations),
            max_attempts: settings.max_attempts_per_provider.max(1),
        }
    }

    /// Synthesizes one utterance. Infallible by design: provider-level
    /// failures are absorbed here and the worst case is the basic-voice
    /// fallback.
    pub async fn synthesize(&self, text: &str, params: &VoiceParams) -> AudioRef {
        let spoken = self.pronunciations.apply(&sanitize(text));
        if spoken.is_empty() {
            return AudioRef::BasicVoice(text.to_string());
        }

        let exact = CacheKey::for_utterance(&spoken, params);
        let phonetic = CacheKey::phonetic(&spoken, params);

        if let Some(audio) = self.cache.get(&exact).await {
            return AudioRef::Cached {
                key: exact.as_str().to_string(),
                audio,
            };
        }
        if let Some(audio) = self.cache.get_near(&phonetic).await {
            return AudioRef::Cached {
                key: exact.as_str().to_string(),
                audio,
            };
        }

        for slot in &self.slots {
            if !slot.breaker.allow() {
                debug!(provider = slot.provider.name(), "skipping provider with open breaker");
                continue;
            }
            match self.try_provider(slot, &spoken, params).await {
                Ok(audio) => {
                    slot.breaker.record_success();
                    self.cache.put(&exact, &phonetic, audio.clone()).await;
                    return AudioRef::Synthesized(audio);
                }
                Err(e) => {
                    slot.breaker.record_failure();
                    warn!(
                        provider = slot.provider.name(),
                        error = %e,
                        "provider failed, falling back"
                    );
                }
            }
        }

        warn!("all synthesis providers exhausted, using basic voice");
        AudioRef::BasicVoice(spoken)
    }

    /// Bounded attempts against one provider, with a single simplified-text
    /// retry on an invalid-input rejection.
    async fn try_provider(
        &self,
        slot: &ProviderSlot,
        spoken: &str,
        params: &VoiceParams,
    ) -> Result<Bytes, SynthesisError> {
        let mut last_err = None;
        let mut simplified_tried = false;
        let mut text = spoken.to_string();

        for attempt in 0..self.max_attempts {
            match slot.provider.synthesize(&text, params).await {
                Ok(audio) => return Ok(audio),
                Err(SynthesisError::InvalidInput(msg)) if !simplified_tried => {
                    debug!(
                        provider = slot.provider.name(),
                        "invalid input, retrying with simplified text: {msg}"
                    );
                    text = simplify(spoken);
                    simplified_tried = true;
                    last_err = Some(SynthesisError::InvalidInput(msg));
                }
                Err(e @ SynthesisError::Transient(_)) => {
                    debug!(
                        provider = slot.provider.name(),
                        attempt,
                        "transient failure: {e}"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| SynthesisError::Transient("attempts exhausted".to_string())))
    }

    /// Number of providers currently short-circuited.
    pub fn open_breakers(&self) -> usize {
        self.slots.iter().filter(|s| s.breaker.is_open()).count()
    }
}
