//! Speculative execution engine.
//!
//! Starts response generation from a partial transcript before the final
//! transcript is known, so the model is already streaming by the time the
//! caller stops talking. Tokens are buffered on an unbounded channel, which
//! lets the turn pipeline attach late (at confirmation) and still replay the
//! stream from the beginning in order.
//!
//! Single-flight invariant: at most one pending attempt per call. Starting a
//! new attempt first aborts the old one and requests upstream cancellation;
//! that pivot is expected to complete well inside the configured budget.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::conversation::ConversationTurn;
use crate::core::llm::{GenerationError, GenerationEvent, GenerationRequest, ResponseGenerator};

/// Speculation thresholds.
#[derive(Debug, Clone, Copy)]
pub struct SpeculationConfig {
    /// Minimum partial-transcript length (chars) before speculation fires.
    pub min_speculation_length: usize,
    /// Budget for an abort-and-restart transition.
    pub pivot_budget: Duration,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            min_speculation_length: 12,
            pivot_budget: Duration::from_millis(100),
        }
    }
}

/// Identifier for one speculative attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

impl AttemptId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Confirmed,
    Aborted,
    Corrected,
}

/// Where the attempt's generation stream currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Streaming,
    Finished,
    Failed,
    Cancelled,
}

/// Buffered token stream of one attempt: replays every token from the start
/// of generation, so a consumer can attach after tokens have already landed.
pub type TokenReceiver = mpsc::UnboundedReceiver<Result<GenerationEvent, GenerationError>>;
type TokenSender = mpsc::UnboundedSender<Result<GenerationEvent, GenerationError>>;

struct ActiveAttempt {
    id: AttemptId,
    source_text: String,
    confidence: f32,
    started_at: Instant,
    status: AttemptStatus,
    generated: Arc<Mutex<String>>,
    cancel: CancellationToken,
    phase_rx: watch::Receiver<StreamPhase>,
    token_rx: Option<TokenReceiver>,
    task: JoinHandle<()>,
}

/// Snapshot of the pending attempt used by the reconcile decision.
#[derive(Debug, Clone)]
pub struct PendingAttempt {
    pub id: AttemptId,
    pub source_text: String,
    pub confidence: f32,
    pub started_at: Instant,
    /// True when the generation stream already errored out; the reconcile
    /// path falls back to synchronous generation in that case.
    pub failed: bool,
}

/// Result of waiting on an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeculationOutcome {
    /// The attempt ran to completion; here is the full generated text.
    Completed(String),
    /// The attempt was aborted, corrected, or failed; discard it.
    Discarded,
}

/// Per-call speculation state. One instance per session.
pub struct SpeculationEngine {
    generator: Arc<dyn ResponseGenerator>,
    config: SpeculationConfig,
    active: Mutex<Option<ActiveAttempt>>,
}

impl SpeculationEngine {
    pub fn new(generator: Arc<dyn ResponseGenerator>, config: SpeculationConfig) -> Self {
        Self {
            generator,
            config,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SpeculationConfig {
        &self.config
    }

    /// Starts speculative generation from a partial transcript. Returns
    /// `None` (noop) when the text is below the length threshold or a
    /// higher-confidence pending attempt already covers a superset of it.
    pub fn start_speculation(
        &self,
        history: &[ConversationTurn],
        partial_text: &str,
        confidence: f32,
    ) -> Option<AttemptId> {
        let trimmed = partial_text.trim();
        if trimmed.len() < self.config.min_speculation_length {
            return None;
        }

        let pivot_started = Instant::now();
        let mut slot = self.active.lock();

        let supersedes_pending = match slot.as_ref() {
            Some(active) if active.status == AttemptStatus::Pending => {
                if active.confidence >= confidence && active.source_text.contains(trimmed) {
                    debug!(
                        attempt = %active.id,
                        "existing attempt covers this partial, skipping"
                    );
                    return None;
                }
                true
            }
            _ => false,
        };
        if supersedes_pending {
            Self::abort_in_place(slot.as_mut().expect("pending attempt"), AttemptStatus::Aborted);
        }

        let id = AttemptId::new();
        let request = GenerationRequest::new(history.to_vec(), trimmed);
        let generated = Arc::new(Mutex::new(String::new()));
        let cancel = CancellationToken::new();
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(StreamPhase::Streaming);

        let task = tokio::spawn(Self::run_generation(
            self.generator.clone(),
            request,
            generated.clone(),
            cancel.clone(),
            token_tx,
            phase_tx,
        ));

        debug!(attempt = %id, chars = trimmed.len(), confidence, "speculation started");

        *slot = Some(ActiveAttempt {
            id,
            source_text: trimmed.to_string(),
            confidence,
            started_at: Instant::now(),
            status: AttemptStatus::Pending,
            generated,
            cancel,
            phase_rx,
            token_rx: Some(token_rx),
            task,
        });

        let pivot = pivot_started.elapsed();
        if pivot > self.config.pivot_budget {
            warn!(
                pivot_ms = pivot.as_millis() as u64,
                budget_ms = self.config.pivot_budget.as_millis() as u64,
                "speculation pivot exceeded budget"
            );
        }

        Some(id)
    }

    /// Consumes the generation stream, mirroring tokens into the buffered
    /// channel and the accumulated text. Reacts to cancellation by tearing
    /// down the upstream request.
    async fn run_generation(
        generator: Arc<dyn ResponseGenerator>,
        request: GenerationRequest,
        generated: Arc<Mutex<String>>,
        cancel: CancellationToken,
        token_tx: TokenSender,
        phase_tx: watch::Sender<StreamPhase>,
    ) {
        let mut stream = match generator.generate(request).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = token_tx.send(Err(e));
                let _ = phase_tx.send(StreamPhase::Failed);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.cancel();
                    let _ = phase_tx.send(StreamPhase::Cancelled);
                    return;
                }
                event = stream.next_event() => match event {
                    Some(Ok(GenerationEvent::Token(token))) => {
                        generated.lock().push_str(&token);
                        let _ = token_tx.send(Ok(GenerationEvent::Token(token)));
                    }
                    Some(Ok(GenerationEvent::Done)) => {
                        let _ = token_tx.send(Ok(GenerationEvent::Done));
                        let _ = phase_tx.send(StreamPhase::Finished);
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = token_tx.send(Err(e));
                        let _ = phase_tx.send(StreamPhase::Failed);
                        return;
                    }
                    None => {
                        let _ = token_tx.send(Err(GenerationError::Upstream(
                            "stream ended without completion signal".to_string(),
                        )));
                        let _ = phase_tx.send(StreamPhase::Failed);
                        return;
                    }
                }
            }
        }
    }

    /// Snapshot of the pending attempt, if one exists.
    pub fn pending(&self) -> Option<PendingAttempt> {
        let slot = self.active.lock();
        let active = slot.as_ref()?;
        if active.status != AttemptStatus::Pending {
            return None;
        }
        Some(PendingAttempt {
            id: active.id,
            source_text: active.source_text.clone(),
            confidence: active.confidence,
            started_at: active.started_at,
            failed: matches!(*active.phase_rx.borrow(), StreamPhase::Failed),
        })
    }

    /// Takes the attempt's buffered token stream so a turn pipeline can
    /// start consuming it before the reconcile decision. Can be taken once.
    pub fn attach_tokens(&self, id: AttemptId) -> Option<TokenReceiver> {
        let mut slot = self.active.lock();
        let active = slot.as_mut()?;
        if active.id != id || active.status != AttemptStatus::Pending {
            return None;
        }
        active.token_rx.take()
    }

    /// Confirms the attempt: the in-flight generation becomes the turn's
    /// response. Returns false if the attempt is no longer pending.
    pub fn confirm(&self, id: AttemptId) -> bool {
        let mut slot = self.active.lock();
        let Some(active) = slot.as_mut() else {
            return false;
        };
        if active.id != id || active.status != AttemptStatus::Pending {
            return false;
        }
        active.status = AttemptStatus::Confirmed;
        debug!(attempt = %id, "speculation confirmed");
        true
    }

    /// Aborts the attempt and requests upstream cancellation. Output after
    /// abort is discarded, never delivered.
    pub fn abort(&self, id: AttemptId, status: AttemptStatus) {
        let mut slot = self.active.lock();
        if let Some(active) = slot.as_mut()
            && active.id == id
            && active.status == AttemptStatus::Pending
        {
            Self::abort_in_place(active, status);
        }
    }

    /// Aborts whatever attempt is pending. Used at session teardown.
    pub fn abort_pending(&self) {
        let mut slot = self.active.lock();
        if let Some(active) = slot.as_mut()
            && active.status == AttemptStatus::Pending
        {
            Self::abort_in_place(active, AttemptStatus::Aborted);
        }
    }

    fn abort_in_place(active: &mut ActiveAttempt, status: AttemptStatus) {
        debug_assert!(matches!(
            status,
            AttemptStatus::Aborted | AttemptStatus::Corrected
        ));
        active.status = status;
        active.cancel.cancel();
        active.token_rx = None;
        debug!(attempt = %active.id, ?status, "speculation aborted");
    }

    /// Waits cooperatively until the attempt is complete or abandoned.
    pub async fn get_result(&self, id: AttemptId) -> SpeculationOutcome {
        let (mut phase_rx, generated) = {
            let slot = self.active.lock();
            let Some(active) = slot.as_ref().filter(|a| a.id == id) else {
                return SpeculationOutcome::Discarded;
            };
            if matches!(
                active.status,
                AttemptStatus::Aborted | AttemptStatus::Corrected
            ) {
                return SpeculationOutcome::Discarded;
            }
            (active.phase_rx.clone(), active.generated.clone())
        };

        loop {
            let phase = *phase_rx.borrow();
            match phase {
                StreamPhase::Finished => {
                    return SpeculationOutcome::Completed(generated.lock().clone());
                }
                StreamPhase::Failed | StreamPhase::Cancelled => {
                    return SpeculationOutcome::Discarded;
                }
                StreamPhase::Streaming => {
                    if phase_rx.changed().await.is_err() {
                        return SpeculationOutcome::Discarded;
                    }
                }
            }
        }
    }

    /// True when an attempt with status Pending exists right now.
    pub fn has_pending(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| a.status == AttemptStatus::Pending)
    }

    /// Drops the attempt slot entirely, aborting first if needed.
    pub fn clear(&self) {
        let mut slot = self.active.lock();
        if let Some(active) = slot.as_mut() {
            if active.status == AttemptStatus::Pending {
                Self::abort_in_place(active, AttemptStatus::Aborted);
            }
            active.task.abort();
        }
        *slot = None;
    }
}

impl Drop for SpeculationEngine {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::core::llm::{GENERATION_CHANNEL_CAPACITY, GenerationStream};

    /// Generator that echoes words of the prompt with a per-token delay.
    struct EchoGenerator {
        token_delay: Duration,
    }

    #[async_trait]
    impl ResponseGenerator for EchoGenerator {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationStream, GenerationError> {
            let (tx, rx) = mpsc::channel(GENERATION_CHANNEL_CAPACITY);
            let cancel = CancellationToken::new();
            let token = cancel.clone();
            let delay = self.token_delay;
            tokio::spawn(async move {
                for word in request.user_text.split_whitespace() {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if token.is_cancelled() {
                        return;
                    }
                    if tx
                        .send(Ok(GenerationEvent::Token(format!("{word} "))))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = tx.send(Ok(GenerationEvent::Done)).await;
            });
            Ok(GenerationStream::new(rx, cancel))
        }
    }

    fn engine(delay_ms: u64) -> SpeculationEngine {
        SpeculationEngine::new(
            Arc::new(EchoGenerator {
                token_delay: Duration::from_millis(delay_ms),
            }),
            SpeculationConfig::default(),
        )
    }

    #[tokio::test]
    async fn short_partials_do_not_speculate() {
        let engine = engine(0);
        assert!(engine.start_speculation(&[], "hi there", 0.9).is_none());
        assert!(!engine.has_pending());
    }

    #[tokio::test]
    async fn qualifying_partial_starts_an_attempt() {
        let engine = engine(0);
        let id = engine
            .start_speculation(&[], "I need to reschedule", 0.8)
            .expect("should speculate");
        assert!(engine.has_pending());

        let outcome = engine.get_result(id).await;
        assert_eq!(
            outcome,
            SpeculationOutcome::Completed("I need to reschedule ".to_string())
        );
    }

    #[tokio::test]
    async fn single_flight_newer_attempt_aborts_older() {
        let engine = engine(50);
        let first = engine
            .start_speculation(&[], "I want to cancel my", 0.6)
            .unwrap();
        let second = engine
            .start_speculation(&[], "I want to cancel my subscription today", 0.8)
            .unwrap();
        assert_ne!(first, second);

        // Only the new attempt is pending
        let pending = engine.pending().unwrap();
        assert_eq!(pending.id, second);
        assert_eq!(engine.get_result(first).await, SpeculationOutcome::Discarded);
    }

    #[tokio::test]
    async fn covered_partial_is_a_noop() {
        let engine = engine(50);
        let first = engine
            .start_speculation(&[], "I need to reschedule my call", 0.9)
            .unwrap();
        // Lower-confidence subset of the running attempt's source
        assert!(
            engine
                .start_speculation(&[], "I need to reschedule", 0.5)
                .is_none()
        );
        assert_eq!(engine.pending().unwrap().id, first);
    }

    #[tokio::test]
    async fn abort_discards_generation_output() {
        let engine = engine(20);
        let id = engine
            .start_speculation(&[], "tell me about the weather", 0.8)
            .unwrap();
        engine.abort(id, AttemptStatus::Aborted);
        assert!(!engine.has_pending());
        assert_eq!(engine.get_result(id).await, SpeculationOutcome::Discarded);
    }

    #[tokio::test]
    async fn attached_stream_replays_buffered_tokens_in_order() {
        let engine = engine(0);
        let id = engine
            .start_speculation(&[], "please read back my order", 0.9)
            .unwrap();

        // Let the whole stream land in the buffer before attaching
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut tokens = engine.attach_tokens(id).expect("attach");
        assert!(engine.confirm(id));
        let mut text = String::new();
        while let Some(event) = tokens.recv().await {
            match event {
                Ok(GenerationEvent::Token(t)) => text.push_str(&t),
                Ok(GenerationEvent::Done) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(text.trim(), "please read back my order");
    }

    #[tokio::test]
    async fn confirm_fails_for_aborted_attempt() {
        let engine = engine(20);
        let id = engine
            .start_speculation(&[], "something long enough", 0.9)
            .unwrap();
        engine.abort(id, AttemptStatus::Corrected);
        assert!(!engine.confirm(id));
        assert!(engine.attach_tokens(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pivot_completes_within_budget() {
        let engine = engine(1_000);
        let first = engine
            .start_speculation(&[], "first speculative attempt text", 0.5)
            .unwrap();

        let pivot_start = Instant::now();
        engine.abort(first, AttemptStatus::Aborted);
        let second = engine
            .start_speculation(&[], "completely different final text", 0.9)
            .unwrap();
        let pivot = pivot_start.elapsed();

        assert!(engine.pending().unwrap().id == second);
        assert!(
            pivot <= engine.config().pivot_budget,
            "pivot took {pivot:?}, budget {:?}",
            engine.config().pivot_budget
        );
    }

    #[tokio::test]
    async fn generation_failure_marks_attempt_failed() {
        struct FailingGenerator;

        #[async_trait]
        impl ResponseGenerator for FailingGenerator {
            async fn generate(
                &self,
                _request: GenerationRequest,
            ) -> Result<GenerationStream, GenerationError> {
                Err(GenerationError::Upstream("model offline".to_string()))
            }
        }

        let engine =
            SpeculationEngine::new(Arc::new(FailingGenerator), SpeculationConfig::default());
        let id = engine
            .start_speculation(&[], "this attempt is doomed", 0.9)
            .unwrap();

        assert_eq!(engine.get_result(id).await, SpeculationOutcome::Discarded);
        // Reconcile sees the failure and falls back to the synchronous path
        let pending = engine.pending().unwrap();
        assert!(pending.failed);
    }
}
