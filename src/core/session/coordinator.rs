//! Per-call session coordinator.
//!
//! One session owns all mutable state for one call: the conversation
//! history, the speculative attempt and its eager synthesis pipeline, the
//! delivery queue, the filler scheduler, and the cycle tracker. Events are
//! processed from a single channel, so within a call everything is
//! cooperative and ordering questions reduce to sequence numbers on the
//! delivery queue.
//!
//! Data flow per turn: transcript events feed the speculation engine;
//! the reconcile decision on the final transcript either keeps the in-flight
//! generation (confirm), supersedes its queued audio and regenerates
//! (restart), or runs the plain synchronous path. Either way tokens stream
//! through the sentence chunker into the synthesis adapter and land on the
//! delivery queue, which a dedicated task drains into the external sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::core::backchannel::{BackchannelContext, BackchannelGuard, BackchannelScheduler};
use crate::core::chunker::SentenceChunker;
use crate::core::conversation::{ConversationTurn, Role};
use crate::core::delivery::{AudioSegment, AudioSink, DeliveryQueue, SegmentKind};
use crate::core::llm::{
    GenerationError, GenerationEvent, GenerationRequest, GenerationStream, ResponseGenerator,
};
use crate::core::metrics::CycleTracker;
use crate::core::speculation::{
    AttemptId, AttemptStatus, ReconcileDecision, SpeculationEngine, TokenReceiver, reconcile,
    similarity,
};
use crate::core::transcript::{CallId, TranscriptEvent};
use crate::core::tts::SpeechSynthesizer;

/// Below this similarity to the previous user turn, the new utterance is
/// treated as a topic shift for filler selection.
const TOPIC_SHIFT_SIMILARITY: f32 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
}

/// Shared services a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub generator: Arc<dyn ResponseGenerator>,
    pub synthesizer: Arc<SpeechSynthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub config: Arc<PipelineConfig>,
}

pub(crate) enum SessionEvent {
    Transcript(TranscriptEvent),
    EndCall,
}

/// External handle over a running session.
pub struct SessionHandle {
    call_id: CallId,
    events: mpsc::Sender<SessionEvent>,
    task: JoinHandle<()>,
    tracker: Arc<CycleTracker>,
    queue: Arc<DeliveryQueue>,
}

impl SessionHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Feeds one transcript event into the session.
    pub async fn transcript(&self, event: TranscriptEvent) -> Result<(), SessionError> {
        self.events
            .send(SessionEvent::Transcript(event))
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn tracker(&self) -> Arc<CycleTracker> {
        self.tracker.clone()
    }

    /// Event sender for routing outside the registry lock.
    pub(crate) fn sender(&self) -> mpsc::Sender<SessionEvent> {
        self.events.clone()
    }

    /// True once the session task has exited (hangup or fatal failure).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the session to wind down, aborting it past the grace period.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        let _ = self.events.try_send(SessionEvent::EndCall);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!(call = %self.call_id, "session did not stop within grace period, aborting");
            self.task.abort();
        }
        self.queue.close();
    }
}

/// Latch fired when a turn's first response audio is enqueued. The
/// backchannel guard registers its cancellation token here, which closes
/// the race between "filler timer fires" and "response audio ready".
struct FirstAudioSignal {
    fired: AtomicBool,
    guard_token: Mutex<Option<CancellationToken>>,
}

impl FirstAudioSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            guard_token: Mutex::new(None),
        })
    }

    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel)
            && let Some(token) = self.guard_token.lock().take()
        {
            token.cancel();
        }
    }

    fn register(&self, token: CancellationToken) {
        if self.fired.load(Ordering::Acquire) {
            token.cancel();
            return;
        }
        *self.guard_token.lock() = Some(token);
        // Re-check: fire() may have raced past before the token landed
        if self.fired.load(Ordering::Acquire)
            && let Some(token) = self.guard_token.lock().take()
        {
            token.cancel();
        }
    }
}

/// Token feed for one response: either the buffered stream of a speculative
/// attempt or a live generation stream.
enum TokenSource {
    Buffered(TokenReceiver),
    Live(GenerationStream),
}

impl TokenSource {
    async fn next(&mut self) -> Option<Result<GenerationEvent, GenerationError>> {
        match self {
            TokenSource::Buffered(rx) => rx.recv().await,
            TokenSource::Live(stream) => stream.next_event().await,
        }
    }
}

/// Everything a synthesis pipeline run needs, cheap to clone into a task.
#[derive(Clone)]
struct PipelineCtx {
    call_id: CallId,
    synthesizer: Arc<SpeechSynthesizer>,
    queue: Arc<DeliveryQueue>,
    sequence: Arc<AtomicU64>,
    tracker: Arc<CycleTracker>,
    config: Arc<PipelineConfig>,
    signal: Arc<FirstAudioSignal>,
    cancel: CancellationToken,
    /// Lowest sequence number this run enqueued; `u64::MAX` until the first
    /// chunk lands. Shared so a cancelled run can still be superseded.
    first_sequence: Arc<AtomicU64>,
}

struct PipelineOutput {
    text: String,
    chunks: usize,
}

/// The eager synthesis pipeline attached to a pending speculative attempt.
struct ActivePipeline {
    attempt_id: AttemptId,
    cancel: CancellationToken,
    signal: Arc<FirstAudioSignal>,
    first_sequence: Arc<AtomicU64>,
    task: JoinHandle<Result<PipelineOutput, GenerationError>>,
}

/// Consumes a token stream through the chunker and synthesizer, enqueueing
/// one audio segment per chunk. Returns the full response text.
async fn synthesize_stream(
    mut source: TokenSource,
    kind: SegmentKind,
    ctx: PipelineCtx,
) -> Result<PipelineOutput, GenerationError> {
    let mut chunker = SentenceChunker::new(ctx.config.chunker);
    let mut text = String::new();
    let mut chunks = 0usize;
    let mut first_token = true;

    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(GenerationError::Cancelled),
            event = source.next() => event,
        };
        match event {
            Some(Ok(GenerationEvent::Token(token))) => {
                if first_token {
                    ctx.tracker.mark_llm_first_token();
                    first_token = false;
                }
                text.push_str(&token);
                for chunk in chunker.push(&token) {
                    emit_chunk(&chunk, kind, &ctx, &mut chunks).await?;
                }
            }
            Some(Ok(GenerationEvent::Done)) => {
                ctx.tracker.mark_llm_complete();
                if let Some(chunk) = chunker.finish() {
                    emit_chunk(&chunk, kind, &ctx, &mut chunks).await?;
                }
                return Ok(PipelineOutput { text, chunks });
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(GenerationError::Upstream(
                    "generation stream ended unexpectedly".to_string(),
                ));
            }
        }
    }
}

async fn emit_chunk(
    chunk: &str,
    kind: SegmentKind,
    ctx: &PipelineCtx,
    chunks: &mut usize,
) -> Result<(), GenerationError> {
    if ctx.cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    // Chunks that are pure markup (control markers, stage directions) have
    // nothing speakable in them
    if crate::core::tts::sanitize(chunk).is_empty() {
        return Ok(());
    }
    let audio = ctx.synthesizer.synthesize(chunk, &ctx.config.voice).await;
    // Abort may have landed while synthesis was in flight; discard, never
    // deliver output produced after the abort
    if ctx.cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }
    ctx.tracker.mark_tts_first_audio();

    let sequence = ctx.sequence.fetch_add(1, Ordering::SeqCst);
    ctx.first_sequence.fetch_min(sequence, Ordering::SeqCst);
    let segment = AudioSegment::new(ctx.call_id.clone(), sequence, kind, chunk, audio);
    if !ctx.queue.enqueue(segment) {
        return Err(GenerationError::Cancelled);
    }
    *chunks += 1;
    ctx.signal.fire();
    Ok(())
}

struct Session {
    call_id: CallId,
    deps: SessionDeps,
    history: Vec<ConversationTurn>,
    engine: SpeculationEngine,
    backchannel: BackchannelScheduler,
    queue: Arc<DeliveryQueue>,
    sequence: Arc<AtomicU64>,
    tracker: Arc<CycleTracker>,
    fatal: CancellationToken,
    delivery_task: JoinHandle<()>,
    active_pipeline: Option<ActivePipeline>,
}

impl Session {
    /// Spawns the session task and its delivery task.
    pub(crate) fn spawn(call_id: CallId, deps: SessionDeps) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::channel(64);
        let queue = Arc::new(DeliveryQueue::new(call_id.clone()));
        let tracker = Arc::new(CycleTracker::new(call_id.clone(), deps.config.metrics_history));
        let fatal = CancellationToken::new();

        let delivery_task = spawn_delivery(
            call_id.clone(),
            queue.clone(),
            deps.sink.clone(),
            tracker.clone(),
            fatal.clone(),
        );

        let session = Session {
            call_id: call_id.clone(),
            engine: SpeculationEngine::new(deps.generator.clone(), deps.config.speculation),
            backchannel: BackchannelScheduler::new(
                deps.config.backchannel,
                deps.synthesizer.clone(),
                deps.config.voice.clone(),
            ),
            history: Vec::new(),
            queue: queue.clone(),
            sequence: Arc::new(AtomicU64::new(0)),
            tracker: tracker.clone(),
            fatal,
            delivery_task,
            active_pipeline: None,
            deps,
        };

        let task = tokio::spawn(session.run(events_rx));

        SessionHandle {
            call_id,
            events: events_tx,
            task,
            tracker,
            queue,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        info!(call = %self.call_id, "session started");
        loop {
            let event = tokio::select! {
                _ = self.fatal.cancelled() => {
                    error!(call = %self.call_id, "delivery channel failed, terminating session");
                    break;
                }
                event = events.recv() => event,
            };
            match event {
                Some(SessionEvent::Transcript(event)) if !event.is_final => {
                    self.handle_partial(event);
                }
                Some(SessionEvent::Transcript(event)) => {
                    let hangup = self.handle_final(event).await;
                    if self.fatal.is_cancelled() {
                        error!(call = %self.call_id, "delivery channel failed, terminating session");
                        break;
                    }
                    if hangup {
                        info!(call = %self.call_id, "assistant requested hangup, ending call");
                        break;
                    }
                }
                Some(SessionEvent::EndCall) | None => break,
            }
        }
        self.teardown().await;
    }

    /// Partial transcript: maybe start (or replace) a speculative attempt
    /// and its eager synthesis pipeline.
    fn handle_partial(&mut self, event: TranscriptEvent) {
        if event.is_empty() {
            return;
        }
        let Some(id) =
            self.engine
                .start_speculation(&self.history, &event.text, event.confidence)
        else {
            return;
        };

        // The engine aborted any previous pending attempt; its pipeline and
        // queued audio go with it
        self.retire_active_pipeline();

        if let Some(tokens) = self.engine.attach_tokens(id) {
            self.active_pipeline = Some(self.spawn_pipeline(id, tokens));
        }
    }

    fn spawn_pipeline(&self, attempt_id: AttemptId, tokens: TokenReceiver) -> ActivePipeline {
        let signal = FirstAudioSignal::new();
        let cancel = CancellationToken::new();
        let first_sequence = Arc::new(AtomicU64::new(u64::MAX));
        let ctx = PipelineCtx {
            call_id: self.call_id.clone(),
            synthesizer: self.deps.synthesizer.clone(),
            queue: self.queue.clone(),
            sequence: self.sequence.clone(),
            tracker: self.tracker.clone(),
            config: self.deps.config.clone(),
            signal: signal.clone(),
            cancel: cancel.clone(),
            first_sequence: first_sequence.clone(),
        };
        let task = tokio::spawn(synthesize_stream(
            TokenSource::Buffered(tokens),
            SegmentKind::Primary,
            ctx,
        ));
        ActivePipeline {
            attempt_id,
            cancel,
            signal,
            first_sequence,
            task,
        }
    }

    /// Cancels the speculative pipeline and invalidates whatever audio it
    /// already queued.
    fn retire_active_pipeline(&mut self) {
        if let Some(pipeline) = self.active_pipeline.take() {
            pipeline.cancel.cancel();
            pipeline.task.abort();
            let first = pipeline.first_sequence.load(Ordering::SeqCst);
            if first != u64::MAX {
                let count = self.queue.supersede(first);
                debug!(
                    call = %self.call_id,
                    attempt = %pipeline.attempt_id,
                    superseded = count,
                    "retired speculative pipeline"
                );
            }
        }
    }

    /// Final transcript: one reconcile decision, then the turn runs to
    /// completion. Returns whether the assistant asked to end the call.
    async fn handle_final(&mut self, event: TranscriptEvent) -> bool {
        self.tracker.start_cycle();
        self.tracker.mark_user_speech_end();
        self.tracker.mark_stt_complete();

        let final_text = event.text.trim().to_string();
        if final_text.is_empty() {
            // No usable transcript; prompt the caller to repeat and move on
            warn!(call = %self.call_id, "transcription unavailable, reprompting caller");
            self.engine.abort_pending();
            self.retire_active_pipeline();
            let reprompt = self.deps.config.reprompt_text.clone();
            self.speak_fixed(&reprompt).await;
            self.finish_cycle().await;
            return false;
        }

        let guard = self.arm_backchannel(&final_text);
        let decision = reconcile(&self.engine, &final_text, &self.deps.config.correction);

        let response = match decision {
            ReconcileDecision::Confirm(id) => self.run_confirmed(id, &guard, &final_text).await,
            ReconcileDecision::Restart(id) => {
                debug!(call = %self.call_id, attempt = %id, "speculation diverged, restarting");
                self.engine.abort(id, AttemptStatus::Corrected);
                self.retire_active_pipeline();
                self.run_synchronous(&guard, &final_text, SegmentKind::Correction)
                    .await
            }
            ReconcileDecision::Synchronous => {
                self.retire_active_pipeline();
                self.run_synchronous(&guard, &final_text, SegmentKind::Primary)
                    .await
            }
        };

        let hangup = match response {
            Some(text) => {
                let hangup = text.contains(&self.deps.config.hangup_marker);
                let recorded = text
                    .replace(&self.deps.config.hangup_marker, "")
                    .trim()
                    .to_string();
                self.history.push(ConversationTurn::user(final_text));
                self.history.push(ConversationTurn::assistant(recorded));
                hangup
            }
            // Apology path already spoke; the turn failed but the call goes on
            None => false,
        };

        drop(guard);
        self.finish_cycle().await;
        hangup
    }

    fn arm_backchannel(&self, final_text: &str) -> BackchannelGuard {
        let topic_shift = self
            .history
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| similarity(&turn.content, final_text) < TOPIC_SHIFT_SIMILARITY)
            .unwrap_or(false);
        let ctx = BackchannelContext {
            user_text: final_text.to_string(),
            topic_shift,
        };
        self.backchannel.on_user_speech_end(
            self.call_id.clone(),
            ctx,
            self.queue.clone(),
            self.sequence.clone(),
        )
    }

    /// Confirm path: the speculative pipeline keeps running and its output
    /// becomes the turn's response. Zero regeneration.
    async fn run_confirmed(
        &mut self,
        id: AttemptId,
        guard: &BackchannelGuard,
        final_text: &str,
    ) -> Option<String> {
        self.engine.confirm(id);
        self.tracker.mark_speculative();

        let Some(pipeline) = self
            .active_pipeline
            .take()
            .filter(|p| p.attempt_id == id)
        else {
            // Attempt exists but its pipeline is gone; regenerate plainly
            warn!(call = %self.call_id, "confirmed attempt has no pipeline, running synchronously");
            return self
                .run_synchronous(guard, final_text, SegmentKind::Primary)
                .await;
        };

        pipeline.signal.register(guard.cancel_token());
        let first_sequence = pipeline.first_sequence.clone();

        match pipeline.task.await {
            Ok(Ok(output)) => {
                debug!(
                    call = %self.call_id,
                    chunks = output.chunks,
                    "confirmed speculation completed"
                );
                Some(output.text)
            }
            Ok(Err(GenerationError::Cancelled)) => None,
            Ok(Err(e)) => {
                warn!(call = %self.call_id, error = %e, "confirmed speculation failed mid-stream");
                let first = first_sequence.load(Ordering::SeqCst);
                if first != u64::MAX {
                    self.queue.supersede(first);
                }
                self.run_synchronous(guard, final_text, SegmentKind::Correction)
                    .await
            }
            Err(join_error) => {
                error!(call = %self.call_id, error = %join_error, "speculative pipeline panicked");
                self.run_synchronous(guard, final_text, SegmentKind::Correction)
                    .await
            }
        }
    }

    /// Synchronous generation from the final transcript, with one retry.
    /// On a second failure the fixed apology is spoken and the turn ends.
    async fn run_synchronous(
        &mut self,
        guard: &BackchannelGuard,
        final_text: &str,
        kind: SegmentKind,
    ) -> Option<String> {
        match self.run_generation_once(guard, final_text, kind).await {
            Ok(output) => Some(output.text),
            Err(GenerationError::Cancelled) => None,
            Err(first_error) => {
                warn!(
                    call = %self.call_id,
                    error = %first_error,
                    "generation failed, retrying once"
                );
                match self.run_generation_once(guard, final_text, kind).await {
                    Ok(output) => Some(output.text),
                    Err(second_error) => {
                        error!(
                            call = %self.call_id,
                            error = %second_error,
                            "generation failed twice, apologizing"
                        );
                        let apology = self.deps.config.apology_text.clone();
                        self.speak_fixed(&apology).await;
                        None
                    }
                }
            }
        }
    }

    async fn run_generation_once(
        &mut self,
        guard: &BackchannelGuard,
        final_text: &str,
        kind: SegmentKind,
    ) -> Result<PipelineOutput, GenerationError> {
        let request = GenerationRequest::new(self.history.clone(), final_text);
        let stream = self.deps.generator.generate(request).await?;

        let signal = FirstAudioSignal::new();
        signal.register(guard.cancel_token());
        let ctx = PipelineCtx {
            call_id: self.call_id.clone(),
            synthesizer: self.deps.synthesizer.clone(),
            queue: self.queue.clone(),
            sequence: self.sequence.clone(),
            tracker: self.tracker.clone(),
            config: self.deps.config.clone(),
            signal,
            cancel: CancellationToken::new(),
            first_sequence: Arc::new(AtomicU64::new(u64::MAX)),
        };
        synthesize_stream(TokenSource::Live(stream), kind, ctx).await
    }

    /// Synthesizes and enqueues one fixed utterance (reprompt, apology).
    async fn speak_fixed(&self, text: &str) {
        let audio = self
            .deps
            .synthesizer
            .synthesize(text, &self.deps.config.voice)
            .await;
        self.tracker.mark_tts_first_audio();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let segment = AudioSegment::new(
            self.call_id.clone(),
            sequence,
            SegmentKind::Primary,
            text,
            audio,
        );
        self.queue.enqueue(segment);
    }

    /// Waits for the turn's audio to drain, then closes out the cycle.
    async fn finish_cycle(&self) {
        self.queue
            .wait_until_empty(self.deps.config.turn_drain_timeout)
            .await;
        self.tracker.complete_cycle();
    }

    /// Releases all per-call state: pending speculation aborted, queue
    /// dropped, metrics flushed.
    async fn teardown(mut self) {
        self.engine.abort_pending();
        self.engine.clear();
        self.retire_active_pipeline();
        self.queue.close();

        let grace = self.deps.config.shutdown_grace;
        if tokio::time::timeout(grace, &mut self.delivery_task)
            .await
            .is_err()
        {
            self.delivery_task.abort();
        }

        self.tracker.complete_cycle();
        let summary = self.tracker.summary();
        info!(
            call = %self.call_id,
            cycles = summary.cycles,
            speculative = summary.speculative_cycles,
            "session ended, state released"
        );
    }
}

/// Drains the delivery queue into the external sink, in order. A sink
/// failure is fatal to the call: the queue closes and the session is told
/// to terminate.
fn spawn_delivery(
    call_id: CallId,
    queue: Arc<DeliveryQueue>,
    sink: Arc<dyn AudioSink>,
    tracker: Arc<CycleTracker>,
    fatal: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while queue.wait_for_audio().await {
            for segment in queue.drain() {
                // Stamp at hand-off; filler audio doesn't count toward the
                // latency KPI
                if segment.kind != SegmentKind::Backchannel {
                    tracker.mark_first_audio_sent();
                }
                match sink.deliver(&segment).await {
                    Ok(()) => {
                        debug!(
                            call = %call_id,
                            sequence = segment.sequence,
                            kind = ?segment.kind,
                            "segment delivered"
                        );
                    }
                    Err(e) => {
                        error!(call = %call_id, error = %e, "delivery channel failure");
                        queue.close();
                        fatal.cancel();
                        return;
                    }
                }
            }
        }
        debug!(call = %call_id, "delivery task finished");
    })
}

/// Public constructor used by the registry.
pub(crate) fn spawn_session(call_id: CallId, deps: SessionDeps) -> SessionHandle {
    Session::spawn(call_id, deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::{AudioCache, CacheSettings};
    use crate::core::sim::{SimGenerator, SimSink, SimSynthesisProvider};
    use std::time::Duration;

    fn deps_with(
        generator: Arc<SimGenerator>,
        sink: Arc<SimSink>,
        mut config: PipelineConfig,
    ) -> SessionDeps {
        config.turn_drain_timeout = Duration::from_secs(2);
        let cache = Arc::new(AudioCache::new(CacheSettings {
            max_entries: 128,
            max_size_bytes: None,
            ttl: None,
        }));
        let synthesizer = Arc::new(SpeechSynthesizer::new(
            vec![Arc::new(SimSynthesisProvider::new("sim", Duration::ZERO))],
            cache,
            config.synthesis.clone(),
        ));
        SessionDeps {
            generator,
            synthesizer,
            sink,
            config: Arc::new(config),
        }
    }

    #[test]
    fn first_audio_signal_latches_in_either_order() {
        // Register then fire
        let signal = FirstAudioSignal::new();
        let token = CancellationToken::new();
        signal.register(token.clone());
        assert!(!token.is_cancelled());
        signal.fire();
        assert!(token.is_cancelled());

        // Fire then register
        let signal = FirstAudioSignal::new();
        signal.fire();
        let token = CancellationToken::new();
        signal.register(token.clone());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn simple_turn_delivers_primary_audio() {
        let generator = Arc::new(SimGenerator::new(Duration::ZERO, Duration::ZERO));
        let sink = SimSink::new();
        let handle = spawn_session(
            CallId::from("call-1"),
            deps_with(generator, sink.clone(), PipelineConfig::default()),
        );

        handle
            .transcript(TranscriptEvent::final_result(1, "book a table for two", 0.9))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let kinds = sink.delivered_kinds();
        assert!(kinds.contains(&SegmentKind::Primary));
        let sequences = sink.delivered_sequences();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted, "audio delivered out of order");
    }

    #[tokio::test]
    async fn empty_final_transcript_reprompts_caller() {
        let generator = Arc::new(SimGenerator::new(Duration::ZERO, Duration::ZERO));
        let sink = SimSink::new();
        let config = PipelineConfig::default();
        let reprompt = config.reprompt_text.clone();
        let handle = spawn_session(
            CallId::from("call-1"),
            deps_with(generator.clone(), sink.clone(), config),
        );

        handle
            .transcript(TranscriptEvent::final_result(1, "   ", 0.1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].source_text, reprompt);
        // No generation was attempted for an empty utterance
        assert_eq!(generator.generations_started(), 0);
    }

    #[tokio::test]
    async fn delivery_failure_terminates_session() {
        let generator = Arc::new(SimGenerator::new(Duration::ZERO, Duration::ZERO));
        let sink = SimSink::new();
        sink.break_channel();
        let handle = spawn_session(
            CallId::from("call-1"),
            deps_with(generator, sink, PipelineConfig::default()),
        );

        handle
            .transcript(TranscriptEvent::final_result(1, "anything at all here", 0.9))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn hangup_marker_ends_the_call_after_the_turn() {
        let generator = Arc::new(
            SimGenerator::new(Duration::ZERO, Duration::ZERO)
                .with_script(|_| "Goodbye, have a great day. [END_CALL]".to_string()),
        );
        let sink = SimSink::new();
        let handle = spawn_session(
            CallId::from("call-1"),
            deps_with(generator, sink.clone(), PipelineConfig::default()),
        );

        handle
            .transcript(TranscriptEvent::final_result(1, "that's all, thank you", 0.9))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.is_finished());
        // The marker itself is never spoken
        for segment in sink.delivered() {
            assert!(!segment.source_text.contains("[END_CALL]"));
        }
    }

    #[tokio::test]
    async fn generation_failure_twice_speaks_apology() {
        struct AlwaysFailing;

        #[async_trait::async_trait]
        impl ResponseGenerator for AlwaysFailing {
            async fn generate(
                &self,
                _request: GenerationRequest,
            ) -> Result<GenerationStream, GenerationError> {
                Err(GenerationError::Upstream("model offline".to_string()))
            }
        }

        let sink = SimSink::new();
        let config = PipelineConfig::default();
        let apology = config.apology_text.clone();
        let cache = Arc::new(AudioCache::new(CacheSettings {
            max_entries: 128,
            max_size_bytes: None,
            ttl: None,
        }));
        let synthesizer = Arc::new(SpeechSynthesizer::new(
            vec![Arc::new(SimSynthesisProvider::new("sim", Duration::ZERO))],
            cache,
            config.synthesis.clone(),
        ));
        let handle = spawn_session(
            CallId::from("call-1"),
            SessionDeps {
                generator: Arc::new(AlwaysFailing),
                synthesizer,
                sink: sink.clone(),
                config: Arc::new(config),
            },
        );

        handle
            .transcript(TranscriptEvent::final_result(1, "tell me a story please", 0.9))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].source_text, apology);
        // The turn failed but the session lives on
        assert!(!handle.is_finished());
    }
}
