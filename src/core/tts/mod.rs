//! Speech synthesis: provider boundary, sanitation, fallback chain.

pub mod base;
pub mod breaker;
pub mod http;
pub mod sanitize;
pub mod synthesizer;

pub use base::{SynthesisError, SynthesisProvider, SynthesisResult, VoiceParams};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use http::{HttpProviderConfig, HttpSynthesisProvider};
pub use sanitize::{PronunciationMap, sanitize, simplify};
pub use synthesizer::{AudioRef, SpeechSynthesizer, SynthesisSettings};
