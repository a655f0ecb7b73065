//! Ordered audio delivery queue.
//!
//! Per-call queue of audio segments with strict sequence ordering. `drain`
//! is the only path that transitions a segment to `Sent`, which makes the
//! supersede rule race-free with respect to the delivery channel: a
//! correction can only invalidate segments the channel has not pulled yet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use super::transcript::CallId;
use super::tts::AudioRef;

/// The delivery channel refused or dropped audio. Fatal to the call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("delivery channel failure: {0}")]
pub struct SinkError(pub String);

/// Boundary trait for the external audio delivery channel. The core pushes
/// segments strictly in sequence order; the channel plays them verbatim.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn deliver(&self, segment: &AudioSegment) -> Result<(), SinkError>;
}

/// What a segment is, which decides supersede eligibility and lets the sink
/// distinguish filler from response audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Filler audio masking processing latency.
    Backchannel,
    /// Response audio for the current turn.
    Primary,
    /// Replacement audio after a discarded speculation.
    Correction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Superseded,
}

/// One unit of deliverable audio.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    pub id: Uuid,
    pub call_id: CallId,
    /// Strictly increasing per call.
    pub sequence: u64,
    pub kind: SegmentKind,
    pub source_text: String,
    pub audio: AudioRef,
    pub status: DeliveryStatus,
}

impl AudioSegment {
    pub fn new(
        call_id: CallId,
        sequence: u64,
        kind: SegmentKind,
        source_text: impl Into<String>,
        audio: AudioRef,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id,
            sequence,
            kind,
            source_text: source_text.into(),
            audio,
            status: DeliveryStatus::Queued,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    segments: BTreeMap<u64, AudioSegment>,
    last_sent: Option<u64>,
    superseded_count: u64,
}

/// Per-call ordered queue with a priority-override rule for corrections.
pub struct DeliveryQueue {
    call_id: CallId,
    inner: Mutex<QueueInner>,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl DeliveryQueue {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            inner: Mutex::new(QueueInner::default()),
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Inserts a segment in sequence order and wakes the drain task.
    /// Returns false once the queue is closed.
    pub fn enqueue(&self, segment: AudioSegment) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut inner = self.inner.lock();
            debug_assert!(
                !inner.segments.contains_key(&segment.sequence),
                "duplicate sequence number"
            );
            debug!(
                call = %self.call_id,
                sequence = segment.sequence,
                kind = ?segment.kind,
                "enqueued audio segment"
            );
            inner.segments.insert(segment.sequence, segment);
        }
        self.notify.notify_one();
        true
    }

    /// Removes and returns all currently-queued segments in sequence order,
    /// marking them `Sent`. Superseded segments are discarded, never yielded.
    pub fn drain(&self) -> Vec<AudioSegment> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.segments.len());
        let drained: Vec<AudioSegment> = std::mem::take(&mut inner.segments)
            .into_values()
            .collect();
        for mut segment in drained {
            match segment.status {
                DeliveryStatus::Superseded => continue,
                DeliveryStatus::Sent => continue,
                DeliveryStatus::Queued => {
                    segment.status = DeliveryStatus::Sent;
                    inner.last_sent = Some(segment.sequence);
                    out.push(segment);
                }
            }
        }
        out
    }

    /// Marks every not-yet-sent `Primary` segment with `sequence >=
    /// from_sequence` as superseded. Backchannel segments logically precede
    /// any correction and are never retracted. Returns the number of
    /// segments invalidated.
    pub fn supersede(&self, from_sequence: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for (_, segment) in inner.segments.range_mut(from_sequence..) {
            if segment.kind == SegmentKind::Primary && segment.status == DeliveryStatus::Queued {
                segment.status = DeliveryStatus::Superseded;
                count += 1;
            }
        }
        inner.superseded_count += count as u64;
        if count > 0 {
            debug!(
                call = %self.call_id,
                from_sequence,
                count,
                "superseded queued primary segments"
            );
        }
        count
    }

    /// Waits until at least one segment is queued or the queue closes.
    /// Returns false when closed with nothing left to drain.
    pub async fn wait_for_audio(&self) -> bool {
        loop {
            {
                let inner = self.inner.lock();
                if !inner.segments.is_empty() {
                    return true;
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            self.notify.notified().await;
        }
    }

    /// Closes the queue: further enqueues are rejected and the drain task is
    /// woken so it can observe the close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().segments.len()
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.inner.lock().last_sent
    }

    pub fn superseded_count(&self) -> u64 {
        self.inner.lock().superseded_count
    }

    /// Waits until everything queued has been drained (or the timeout
    /// expires). Delivery cadence is tens of milliseconds, so a short poll
    /// is adequate here.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.queued_len() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn segment(seq: u64, kind: SegmentKind) -> AudioSegment {
        AudioSegment::new(
            CallId::from("call-1"),
            seq,
            kind,
            format!("text {seq}"),
            AudioRef::Synthesized(Bytes::from_static(b"pcm")),
        )
    }

    fn queue() -> DeliveryQueue {
        DeliveryQueue::new(CallId::from("call-1"))
    }

    #[test]
    fn drain_yields_in_sequence_order() {
        let q = queue();
        q.enqueue(segment(3, SegmentKind::Primary));
        q.enqueue(segment(1, SegmentKind::Backchannel));
        q.enqueue(segment(2, SegmentKind::Primary));

        let drained = q.drain();
        let sequences: Vec<u64> = drained.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(drained.iter().all(|s| s.status == DeliveryStatus::Sent));
    }

    #[test]
    fn supersede_skips_queued_primaries_only() {
        let q = queue();
        q.enqueue(segment(1, SegmentKind::Backchannel));
        q.enqueue(segment(2, SegmentKind::Primary));
        q.enqueue(segment(3, SegmentKind::Primary));

        assert_eq!(q.supersede(2), 2);

        let drained = q.drain();
        let kinds: Vec<SegmentKind> = drained.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SegmentKind::Backchannel]);
    }

    #[test]
    fn supersede_respects_sequence_floor() {
        let q = queue();
        q.enqueue(segment(1, SegmentKind::Primary));
        q.enqueue(segment(2, SegmentKind::Primary));

        assert_eq!(q.supersede(2), 1);
        let sequences: Vec<u64> = q.drain().iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1]);
    }

    #[test]
    fn sent_segments_cannot_be_superseded() {
        let q = queue();
        q.enqueue(segment(1, SegmentKind::Primary));
        let drained = q.drain();
        assert_eq!(drained.len(), 1);

        // Already delivered; a later correction cannot retract it
        assert_eq!(q.supersede(1), 0);
    }

    #[test]
    fn corrections_survive_supersede_and_deliver_in_order() {
        let q = queue();
        q.enqueue(segment(1, SegmentKind::Primary));
        q.enqueue(segment(2, SegmentKind::Primary));
        q.supersede(1);
        q.enqueue(segment(3, SegmentKind::Correction));
        q.enqueue(segment(4, SegmentKind::Correction));

        let drained = q.drain();
        let sequences: Vec<u64> = drained.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert!(drained.iter().all(|s| s.kind == SegmentKind::Correction));
    }

    #[test]
    fn closed_queue_rejects_enqueue() {
        let q = queue();
        q.close();
        assert!(!q.enqueue(segment(1, SegmentKind::Primary)));
        assert!(q.is_closed());
    }

    #[tokio::test]
    async fn wait_for_audio_wakes_on_enqueue() {
        let q = Arc::new(queue());
        let waiter = q.clone();
        let task = tokio::spawn(async move { waiter.wait_for_audio().await });

        tokio::task::yield_now().await;
        q.enqueue(segment(1, SegmentKind::Primary));
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_audio_returns_false_on_close() {
        let q = Arc::new(queue());
        let waiter = q.clone();
        let task = tokio::spawn(async move { waiter.wait_for_audio().await });

        tokio::task::yield_now().await;
        q.close();
        assert!(!task.await.unwrap());
    }
}
