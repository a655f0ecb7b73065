//! Deterministic in-process stand-ins for the external collaborators.
//!
//! The pipeline's boundaries (recognizer, response model, synthesis
//! provider, audio sink) are traits; this module provides simulated
//! implementations with tunable latency so the full pipeline can run
//! without network access. Used by the demo binary and the integration
//! tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::delivery::{AudioSegment, AudioSink, SegmentKind, SinkError};
use super::llm::{
    GENERATION_CHANNEL_CAPACITY, GenerationError, GenerationEvent, GenerationRequest,
    GenerationStream, ResponseGenerator,
};
use super::tts::base::{SynthesisProvider, SynthesisResult, VoiceParams};

/// Response model simulator: streams a scripted reply word by word with a
/// configurable per-token delay and honors out-of-band cancellation.
pub struct SimGenerator {
    /// Delay before the first token (model "thinking" time).
    pub first_token_delay: Duration,
    /// Delay between subsequent tokens.
    pub token_delay: Duration,
    /// Maps the user utterance to a reply. Defaults to a readback response.
    script: Box<dyn Fn(&str) -> String + Send + Sync>,
    /// Number of generations started, including cancelled ones.
    pub generations: AtomicU64,
}

impl SimGenerator {
    pub fn new(first_token_delay: Duration, token_delay: Duration) -> Self {
        Self {
            first_token_delay,
            token_delay,
            script: Box::new(|user_text| {
                format!("You said: {user_text}. I can take care of that for you.")
            }),
            generations: AtomicU64::new(0),
        }
    }

    /// Replaces the reply script.
    pub fn with_script(mut self, script: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.script = Box::new(script);
        self
    }

    pub fn generations_started(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponseGenerator for SimGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationStream, GenerationError> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        let reply = (self.script)(&request.user_text);
        let first_delay = self.first_token_delay;
        let token_delay = self.token_delay;

        let (tx, rx) = mpsc::channel(GENERATION_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(first_delay) => {}
            }
            for word in reply.split_inclusive(' ') {
                if token.is_cancelled() {
                    return;
                }
                if tx
                    .send(Ok(GenerationEvent::Token(word.to_string())))
                    .await
                    .is_err()
                {
                    return;
                }
                if !token_delay.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(token_delay) => {}
                    }
                }
            }
            let _ = tx.send(Ok(GenerationEvent::Done)).await;
        });

        Ok(GenerationStream::new(rx, cancel))
    }
}

/// Synthesis provider simulator: deterministic audio bytes derived from the
/// text, a configurable latency, and a call counter for cache assertions.
pub struct SimSynthesisProvider {
    name: String,
    pub latency: Duration,
    pub calls: AtomicU64,
}

impl SimSynthesisProvider {
    pub fn new(name: impl Into<String>, latency: Duration) -> Self {
        Self {
            name: name.into(),
            latency,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisProvider for SimSynthesisProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(&self, text: &str, params: &VoiceParams) -> SynthesisResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(Bytes::from(format!("pcm[{}@{}]:{text}", params.voice_id, params.sample_rate)))
    }
}

/// A segment observed by the collecting sink.
#[derive(Debug, Clone)]
pub struct DeliveredSegment {
    pub sequence: u64,
    pub kind: SegmentKind,
    pub source_text: String,
    pub delivered_at: std::time::Instant,
}

/// Audio sink simulator: records what was delivered, in order. Can be told
/// to fail to exercise the fatal delivery path.
#[derive(Default)]
pub struct SimSink {
    delivered: Mutex<Vec<DeliveredSegment>>,
    fail: std::sync::atomic::AtomicBool,
}

impl SimSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<DeliveredSegment> {
        self.delivered.lock().clone()
    }

    pub fn delivered_sequences(&self) -> Vec<u64> {
        self.delivered.lock().iter().map(|s| s.sequence).collect()
    }

    pub fn delivered_kinds(&self) -> Vec<SegmentKind> {
        self.delivered.lock().iter().map(|s| s.kind).collect()
    }

    /// Makes every subsequent delivery fail.
    pub fn break_channel(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioSink for SimSink {
    async fn deliver(&self, segment: &AudioSegment) -> Result<(), SinkError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError("simulated channel failure".to_string()));
        }
        self.delivered.lock().push(DeliveredSegment {
            sequence: segment.sequence,
            kind: segment.kind,
            source_text: segment.source_text.clone(),
            delivered_at: std::time::Instant::now(),
        });
        Ok(())
    }
}
