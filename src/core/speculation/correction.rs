//! Correction/pivot decision.
//!
//! Evaluated exactly once per final transcript: compare the final text
//! against what the speculative attempt was started from, and decide whether
//! the in-flight generation survives. This is the single point that controls
//! whether already-queued primary audio gets superseded by a correction
//! batch.

use tracing::debug;

use super::engine::{AttemptId, AttemptStatus, SpeculationEngine};

/// Threshold for confirming a speculative attempt.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionConfig {
    /// Minimum similarity between the speculative source and the final
    /// transcript for the attempt to be confirmed. Empirically tuned;
    /// treat as a knob to validate, not a constant to trust.
    pub correction_threshold: f32,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            correction_threshold: 0.75,
        }
    }
}

/// Outcome of reconciling a final transcript with the pending attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileDecision {
    /// The speculation holds: let the in-flight generation become the
    /// turn's response.
    Confirm(AttemptId),
    /// The speculation diverged: abort it and regenerate from the final
    /// transcript, superseding any queued primary audio.
    Restart(AttemptId),
    /// No usable attempt in flight; ordinary synchronous generation.
    Synchronous,
}

/// Token-overlap similarity: the fraction of the speculative source's tokens
/// that also appear in the final transcript. Monotone as partials grow into
/// the final utterance, 1.0 when the final extends the source verbatim.
pub fn similarity(source_text: &str, final_text: &str) -> f32 {
    let source: Vec<String> = normalized_tokens(source_text);
    if source.is_empty() {
        return 0.0;
    }
    let final_tokens: std::collections::HashSet<String> =
        normalized_tokens(final_text).into_iter().collect();
    let matched = source
        .iter()
        .filter(|token| final_tokens.contains(*token))
        .count();
    matched as f32 / source.len() as f32
}

fn normalized_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// Decides the turn's generation path for a final transcript.
pub fn reconcile(
    engine: &SpeculationEngine,
    final_text: &str,
    config: &CorrectionConfig,
) -> ReconcileDecision {
    let Some(pending) = engine.pending() else {
        return ReconcileDecision::Synchronous;
    };

    if pending.failed {
        // Generation already errored; fall back to the synchronous path
        engine.abort(pending.id, AttemptStatus::Aborted);
        return ReconcileDecision::Synchronous;
    }

    let score = similarity(&pending.source_text, final_text);
    debug!(
        attempt = %pending.id,
        score,
        threshold = config.correction_threshold,
        "reconciling final transcript against speculation"
    );

    if score >= config.correction_threshold {
        ReconcileDecision::Confirm(pending.id)
    } else {
        ReconcileDecision::Restart(pending.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{
        GENERATION_CHANNEL_CAPACITY, GenerationError, GenerationEvent, GenerationRequest,
        GenerationStream, ResponseGenerator,
    };
    use crate::core::speculation::engine::SpeculationConfig;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct SilentGenerator;

    #[async_trait]
    impl ResponseGenerator for SilentGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationStream, GenerationError> {
            let (tx, rx) = mpsc::channel(GENERATION_CHANNEL_CAPACITY);
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                let _ = tx.send(Ok(GenerationEvent::Done)).await;
            });
            Ok(GenerationStream::new(rx, cancel))
        }
    }

    fn engine() -> SpeculationEngine {
        SpeculationEngine::new(Arc::new(SilentGenerator), SpeculationConfig::default())
    }

    #[test]
    fn similarity_full_prefix_overlap() {
        let score = similarity(
            "Can you help me with",
            "Can you help me with scheduling a meeting",
        );
        assert!((score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn similarity_low_overlap() {
        let score = similarity("Can you schedule", "Can you delete my calendar");
        assert!(score < 0.75, "score was {score}");
    }

    #[test]
    fn similarity_ignores_case_and_punctuation() {
        let score = similarity("I need to RESCHEDULE.", "i need to reschedule my call");
        assert!((score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn similarity_of_empty_source_is_zero() {
        assert_eq!(similarity("", "anything"), 0.0);
    }

    #[tokio::test]
    async fn high_overlap_confirms() {
        let engine = engine();
        let id = engine
            .start_speculation(&[], "Can you help me with", 0.8)
            .unwrap();

        let decision = reconcile(
            &engine,
            "Can you help me with scheduling a meeting",
            &CorrectionConfig::default(),
        );
        assert_eq!(decision, ReconcileDecision::Confirm(id));
    }

    #[tokio::test]
    async fn low_overlap_restarts() {
        let engine = engine();
        let id = engine
            .start_speculation(&[], "Can you schedule one", 0.8)
            .unwrap();

        let decision = reconcile(
            &engine,
            "Can you delete my calendar",
            &CorrectionConfig::default(),
        );
        assert_eq!(decision, ReconcileDecision::Restart(id));
    }

    #[tokio::test]
    async fn no_attempt_means_synchronous() {
        let engine = engine();
        let decision = reconcile(
            &engine,
            "short final arrived before speculation",
            &CorrectionConfig::default(),
        );
        assert_eq!(decision, ReconcileDecision::Synchronous);
    }
}
