//! Transcript ingest boundary types.
//!
//! The speech recognizer (external) pushes ordered [`TranscriptEvent`]s per
//! call: zero or more partial events followed by exactly one final event per
//! utterance.

use std::fmt;
use std::sync::Arc;

/// Identifier for one active call.
///
/// Cheap to clone; used as the key in the session registry and stamped on
/// every audio segment and metrics cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(Arc<str>);

impl CallId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One speech-recognition event for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    /// Ordering sequence assigned by the recognizer.
    pub sequence: u64,
    /// The transcribed text so far (partial) or the authoritative text (final).
    pub text: String,
    /// Whether this is the terminal result for the current utterance.
    pub is_final: bool,
    /// Recognizer confidence (0.0 to 1.0).
    pub confidence: f32,
}

impl TranscriptEvent {
    /// Creates a new event, clamping confidence into the valid range.
    pub fn new(sequence: u64, text: impl Into<String>, is_final: bool, confidence: f32) -> Self {
        Self {
            sequence,
            text: text.into(),
            is_final,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn partial(sequence: u64, text: impl Into<String>, confidence: f32) -> Self {
        Self::new(sequence, text, false, confidence)
    }

    pub fn final_result(sequence: u64, text: impl Into<String>, confidence: f32) -> Self {
        Self::new(sequence, text, true, confidence)
    }

    /// True when the recognizer produced no usable text for this utterance.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}
