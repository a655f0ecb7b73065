//! Per-turn latency metrics.
//!
//! One "cycle" runs from the end of a user utterance to the delivery of the
//! response audio. The tracker stamps stage transitions as they are
//! observed and derives the end-to-end figure that matters: how long the
//! caller waited before hearing anything. Purely observational: every
//! call is infallible, out-of-order marks are swallowed, and nothing here
//! ever blocks the pipeline.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::transcript::CallId;

/// Stage timestamps for one conversational turn.
#[derive(Debug, Clone)]
pub struct CycleMetrics {
    pub cycle_id: u64,
    pub call_id: CallId,
    /// Whether this cycle's response came from a confirmed speculation.
    pub speculative: bool,
    pub started_at: Instant,
    pub user_speech_end: Option<Instant>,
    pub stt_complete: Option<Instant>,
    pub llm_first_token: Option<Instant>,
    pub llm_complete: Option<Instant>,
    pub tts_first_audio: Option<Instant>,
    pub first_audio_sent: Option<Instant>,
    pub cycle_complete: Option<Instant>,
}

impl CycleMetrics {
    fn new(cycle_id: u64, call_id: CallId) -> Self {
        Self {
            cycle_id,
            call_id,
            speculative: false,
            started_at: Instant::now(),
            user_speech_end: None,
            stt_complete: None,
            llm_first_token: None,
            llm_complete: None,
            tts_first_audio: None,
            first_audio_sent: None,
            cycle_complete: None,
        }
    }

    /// Primary KPI: time from the user finishing speech to the first audio
    /// segment handed to the delivery channel.
    pub fn end_to_end_latency(&self) -> Option<Duration> {
        Some(self.first_audio_sent?.duration_since(self.user_speech_end?))
    }

    /// Time from user speech end to the model's first token.
    pub fn time_to_first_token(&self) -> Option<Duration> {
        Some(self.llm_first_token?.duration_since(self.user_speech_end?))
    }

    /// Time from user speech end to the first synthesized audio.
    pub fn time_to_first_audio(&self) -> Option<Duration> {
        Some(self.tts_first_audio?.duration_since(self.user_speech_end?))
    }
}

/// Aggregate figures over the retained cycle history.
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub cycles: usize,
    pub speculative_cycles: usize,
    pub avg_end_to_end: Option<Duration>,
    pub min_end_to_end: Option<Duration>,
    pub max_end_to_end: Option<Duration>,
}

struct TrackerInner {
    current: Option<CycleMetrics>,
    history: VecDeque<CycleMetrics>,
    next_cycle_id: u64,
}

/// Per-call metrics tracker with a bounded history.
pub struct CycleTracker {
    call_id: CallId,
    capacity: usize,
    inner: Mutex<TrackerInner>,
}

impl CycleTracker {
    pub fn new(call_id: CallId, capacity: usize) -> Self {
        Self {
            call_id,
            capacity: capacity.max(1),
            inner: Mutex::new(TrackerInner {
                current: None,
                history: VecDeque::new(),
                next_cycle_id: 0,
            }),
        }
    }

    /// Opens a new cycle. An unfinished previous cycle is completed as-is so
    /// a dropped turn never wedges the tracker.
    pub fn start_cycle(&self) -> u64 {
        let mut inner = self.inner.lock();
        if inner.current.is_some() {
            Self::push_history(&mut inner, self.capacity);
        }
        let id = inner.next_cycle_id;
        inner.next_cycle_id += 1;
        inner.current = Some(CycleMetrics::new(id, self.call_id.clone()));
        id
    }

    pub fn mark_user_speech_end(&self) {
        self.mark(|c| &mut c.user_speech_end);
    }

    pub fn mark_stt_complete(&self) {
        self.mark(|c| &mut c.stt_complete);
    }

    pub fn mark_llm_first_token(&self) {
        self.mark(|c| &mut c.llm_first_token);
    }

    pub fn mark_llm_complete(&self) {
        self.mark(|c| &mut c.llm_complete);
    }

    pub fn mark_tts_first_audio(&self) {
        self.mark(|c| &mut c.tts_first_audio);
    }

    pub fn mark_first_audio_sent(&self) {
        self.mark(|c| &mut c.first_audio_sent);
    }

    /// Flags the current cycle as served by a confirmed speculation.
    pub fn mark_speculative(&self) {
        if let Some(current) = self.inner.lock().current.as_mut() {
            current.speculative = true;
        }
    }

    /// Closes the current cycle and moves it into history.
    pub fn complete_cycle(&self) {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.current.as_mut() {
            current.cycle_complete = Some(Instant::now());
            if let Some(latency) = current.end_to_end_latency() {
                debug!(
                    call = %self.call_id,
                    cycle = current.cycle_id,
                    speculative = current.speculative,
                    latency_ms = latency.as_millis() as u64,
                    "cycle complete"
                );
            }
        }
        Self::push_history(&mut inner, self.capacity);
    }

    /// Stamps a stage exactly once per cycle; later marks for the same stage
    /// and marks outside any cycle are ignored.
    fn mark(&self, field: fn(&mut CycleMetrics) -> &mut Option<Instant>) {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.current.as_mut() {
            let slot = field(current);
            if slot.is_none() {
                *slot = Some(Instant::now());
            }
        }
    }

    fn push_history(inner: &mut TrackerInner, capacity: usize) {
        if let Some(done) = inner.current.take() {
            if inner.history.len() >= capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(done);
        }
    }

    /// Most recent completed cycle, if any.
    pub fn last_cycle(&self) -> Option<CycleMetrics> {
        self.inner.lock().history.back().cloned()
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock();
        let latencies: Vec<Duration> = inner
            .history
            .iter()
            .filter_map(|c| c.end_to_end_latency())
            .collect();
        let speculative = inner.history.iter().filter(|c| c.speculative).count();

        let avg = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
        };

        MetricsSummary {
            cycles: inner.history.len(),
            speculative_cycles: speculative,
            avg_end_to_end: avg,
            min_end_to_end: latencies.iter().min().copied(),
            max_end_to_end: latencies.iter().max().copied(),
        }
    }
}
