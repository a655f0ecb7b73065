//! Backchannel (filler audio) scheduling.
//!
//! While the pipeline is still producing the real response, a short filler
//! utterance ("mm-hmm", "one moment") masks the processing latency. A timer
//! armed at user speech end fires once per turn unless the first response
//! audio becomes ready first; the phrase category escalates with how long
//! the caller has already waited, with a terse emergency filler past the
//! hard dead-air bound.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::delivery::{AudioSegment, DeliveryQueue, SegmentKind};
use super::transcript::CallId;
use super::tts::{SpeechSynthesizer, VoiceParams};

/// Filler phrase categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCategory {
    Acknowledgment,
    Processing,
    Thinking,
    Empathy,
}

/// Timing bands and the timer delay.
#[derive(Debug, Clone, Copy)]
pub struct BackchannelConfig {
    pub enabled: bool,
    /// When the filler timer fires after user speech end.
    pub delay: Duration,
    /// Waits shorter than this get a short acknowledgment.
    pub ack_band: Duration,
    /// Waits shorter than this get a processing indication.
    pub processing_band: Duration,
    /// Past this bound, emit the emergency filler to avoid dead air.
    pub emergency_after: Duration,
}

impl Default for BackchannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_millis(350),
            ack_band: Duration::from_millis(500),
            processing_band: Duration::from_millis(1_000),
            emergency_after: Duration::from_millis(1_400),
        }
    }
}

/// Lightweight context signals for phrase selection.
#[derive(Debug, Clone, Default)]
pub struct BackchannelContext {
    /// The utterance being responded to; also seeds phrase selection.
    pub user_text: String,
    /// Whether the caller appears to have changed topic this turn.
    pub topic_shift: bool,
}

#[derive(Debug, Clone)]
struct WeightedPhrase {
    text: &'static str,
    weight: u64,
}

/// Categorized filler phrases with selection weights.
pub struct PhraseCatalog {
    acknowledgment: Vec<WeightedPhrase>,
    processing: Vec<WeightedPhrase>,
    thinking: Vec<WeightedPhrase>,
    empathy: Vec<WeightedPhrase>,
    emergency: Vec<WeightedPhrase>,
}

impl Default for PhraseCatalog {
    fn default() -> Self {
        Self {
            acknowledgment: vec![
                WeightedPhrase { text: "Mm-hmm.", weight: 3 },
                WeightedPhrase { text: "Okay.", weight: 3 },
                WeightedPhrase { text: "Right.", weight: 2 },
                WeightedPhrase { text: "Got it.", weight: 2 },
            ],
            processing: vec![
                WeightedPhrase { text: "One moment.", weight: 3 },
                WeightedPhrase { text: "Let me check that.", weight: 2 },
                WeightedPhrase { text: "Just a second.", weight: 2 },
            ],
            thinking: vec![
                WeightedPhrase { text: "Let me look into that for you.", weight: 2 },
                WeightedPhrase { text: "I'm checking on that now.", weight: 2 },
                WeightedPhrase { text: "Bear with me for a moment.", weight: 1 },
            ],
            empathy: vec![
                WeightedPhrase { text: "I understand.", weight: 2 },
                WeightedPhrase { text: "That makes sense.", weight: 2 },
                WeightedPhrase { text: "I hear you.", weight: 1 },
            ],
            emergency: vec![WeightedPhrase { text: "Just a moment.", weight: 1 }],
        }
    }
}

impl PhraseCatalog {
    fn phrases(&self, category: PhraseCategory) -> &[WeightedPhrase] {
        match category {
            PhraseCategory::Acknowledgment => &self.acknowledgment,
            PhraseCategory::Processing => &self.processing,
            PhraseCategory::Thinking => &self.thinking,
            PhraseCategory::Empathy => &self.empathy,
        }
    }

    /// Weighted pick, seeded by the utterance text so the same context
    /// yields the same phrase without an RNG dependency.
    fn pick(&self, category: PhraseCategory, seed_text: &str) -> &'static str {
        Self::pick_from(self.phrases(category), seed_text)
    }

    fn pick_emergency(&self, seed_text: &str) -> &'static str {
        Self::pick_from(&self.emergency, seed_text)
    }

    fn pick_from(phrases: &[WeightedPhrase], seed_text: &str) -> &'static str {
        let total: u64 = phrases.iter().map(|p| p.weight).sum();
        if total == 0 {
            return "One moment.";
        }
        let mut roll = xxh3_64(seed_text.as_bytes()) % total;
        for phrase in phrases {
            if roll < phrase.weight {
                return phrase.text;
            }
            roll -= phrase.weight;
        }
        phrases[phrases.len() - 1].text
    }
}

/// Per-turn handle over the armed filler timer.
pub struct BackchannelGuard {
    cancel: CancellationToken,
    emitted: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl BackchannelGuard {
    /// Disarms the timer: the first response audio is ready, so no filler
    /// is needed. A filler already being synthesized is dropped before
    /// enqueue.
    pub fn on_first_audio_ready(&self) {
        self.cancel.cancel();
    }

    /// Whether a backchannel segment was enqueued this turn.
    pub fn emitted(&self) -> bool {
        self.emitted.load(Ordering::Acquire)
    }

    /// Token that disarms this guard when cancelled; lets the turn pipeline
    /// suppress the filler the moment its first audio is ready.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Inert guard for turns where the scheduler is disabled.
    fn inert() -> Self {
        Self {
            cancel: CancellationToken::new(),
            emitted: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

impl Drop for BackchannelGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Decides whether and what filler to speak while the caller waits.
pub struct BackchannelScheduler {
    config: BackchannelConfig,
    catalog: PhraseCatalog,
    synthesizer: Arc<SpeechSynthesizer>,
    voice: VoiceParams,
}

impl BackchannelScheduler {
    pub fn new(
        config: BackchannelConfig,
        synthesizer: Arc<SpeechSynthesizer>,
        voice: VoiceParams,
    ) -> Self {
        Self {
            config,
            catalog: PhraseCatalog::default(),
            synthesizer,
            voice,
        }
    }

    /// Category for a wait of `elapsed`, adjusted by context signals.
    fn categorize(&self, elapsed: Duration, ctx: &BackchannelContext) -> PhraseCategory {
        if elapsed < self.config.ack_band {
            if ctx.topic_shift {
                PhraseCategory::Empathy
            } else if ctx.user_text.len() > 120 {
                // A long request deserves a processing cue over a bare nod
                PhraseCategory::Processing
            } else {
                PhraseCategory::Acknowledgment
            }
        } else if elapsed < self.config.processing_band {
            PhraseCategory::Processing
        } else {
            PhraseCategory::Thinking
        }
    }

    /// Arms the filler timer for one turn. The returned guard must be kept
    /// alive for the turn; dropping it disarms the timer.
    pub fn on_user_speech_end(
        &self,
        call_id: CallId,
        ctx: BackchannelContext,
        queue: Arc<DeliveryQueue>,
        sequence: Arc<AtomicU64>,
    ) -> BackchannelGuard {
        if !self.config.enabled {
            return BackchannelGuard::inert();
        }

        let cancel = CancellationToken::new();
        let emitted = Arc::new(AtomicBool::new(false));
        let config = self.config;
        let category = self.categorize(config.delay, &ctx);
        let phrase = self.catalog.pick(category, &ctx.user_text).to_string();
        let emergency = self.catalog.pick_emergency(&ctx.user_text).to_string();
        let synthesizer = self.synthesizer.clone();
        let voice = self.voice.clone();
        let token = cancel.clone();
        let emitted_flag = emitted.clone();

        let task = tokio::spawn(async move {
            let armed_at = Instant::now();
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(call = %call_id, "backchannel suppressed, response audio ready");
                    return;
                }
                _ = tokio::time::sleep(config.delay) => {}
            }

            // Past the hard bound the wording no longer matters, only speed
            let text = if armed_at.elapsed() >= config.emergency_after {
                emergency
            } else {
                phrase
            };

            debug!(call = %call_id, ?category, %text, "emitting backchannel filler");
            let audio = synthesizer.synthesize(&text, &voice).await;

            if token.is_cancelled() {
                debug!(call = %call_id, "backchannel dropped after synthesis, response audio ready");
                return;
            }

            let seq = sequence.fetch_add(1, Ordering::SeqCst);
            let segment =
                AudioSegment::new(call_id.clone(), seq, SegmentKind::Backchannel, text, audio);
            if queue.enqueue(segment) {
                emitted_flag.store(true, Ordering::Release);
            } else {
                warn!(call = %call_id, "backchannel dropped, delivery queue closed");
            }
        });

        BackchannelGuard {
            cancel,
            emitted,
            task: Some(task),
        }
    }
}
