//! Sentence-level chunking of a streaming token feed.
//!
//! Synthesis quality and latency both depend on handing the synthesizer
//! complete clauses rather than raw token deltas. The chunker accumulates
//! streamed text and flushes a span whenever it contains a sentence boundary
//! or outgrows the buffer cap. The first chunk of a response flushes at a
//! shorter threshold than the rest: time-to-first-audio dominates perceived
//! latency, so we trade a slightly choppier opening clause for an earlier
//! start.

/// Thresholds controlling chunk flushing.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// Minimum accumulated length before the first sentence boundary flushes.
    pub first_chunk_min_chars: usize,
    /// Minimum accumulated length for subsequent boundary flushes.
    pub min_chunk_chars: usize,
    /// Hard cap: flush at the last word boundary once the buffer grows past
    /// this, boundary or not.
    pub max_buffer_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            first_chunk_min_chars: 16,
            min_chunk_chars: 48,
            max_buffer_chars: 240,
        }
    }
}

/// Accumulates a token stream and emits sentence-boundary-complete chunks.
///
/// Not thread-safe; one chunker per in-flight response.
pub struct SentenceChunker {
    config: ChunkerConfig,
    buffer: String,
    chunks_emitted: usize,
}

impl SentenceChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            chunks_emitted: 0,
        }
    }

    /// Feeds one token delta, returning any chunks that became flushable.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut out = Vec::new();

        loop {
            let threshold = if self.chunks_emitted == 0 {
                self.config.first_chunk_min_chars
            } else {
                self.config.min_chunk_chars
            };

            if let Some(end) = self.boundary_at_or_after(threshold) {
                out.push(self.take_prefix(end));
                continue;
            }

            if self.buffer.len() > self.config.max_buffer_chars {
                if let Some(end) = self.last_word_boundary() {
                    out.push(self.take_prefix(end));
                    continue;
                }
            }

            break;
        }

        out
    }

    /// Flushes whatever remains. Call once when the token stream completes.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            self.buffer.clear();
            return None;
        }
        let chunk = rest.to_string();
        self.buffer.clear();
        self.chunks_emitted += 1;
        Some(chunk)
    }

    pub fn chunks_emitted(&self) -> usize {
        self.chunks_emitted
    }

    /// Byte index just past the first sentence terminator at or after
    /// `threshold` accumulated characters, if one exists. A terminator only
    /// counts when followed by whitespace or end-of-buffer, which keeps
    /// abbreviation-free decimals like "3.5" intact.
    fn boundary_at_or_after(&self, threshold: usize) -> Option<usize> {
        for (i, c) in self.buffer.char_indices() {
            if !matches!(c, '.' | '!' | '?' | '…') {
                continue;
            }
            let end = i + c.len_utf8();
            let at_end = end >= self.buffer.len();
            let followed_by_space = self.buffer[end..]
                .chars()
                .next()
                .is_some_and(|next| next.is_whitespace());
            if (at_end || followed_by_space) && end >= threshold {
                return Some(end);
            }
        }
        None
    }

    /// Byte index of the last whitespace run, so an overflow flush never
    /// splits inside a word.
    fn last_word_boundary(&self) -> Option<usize> {
        self.buffer
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, _)| i)
            .filter(|&i| i > 0)
    }

    fn take_prefix(&mut self, end: usize) -> String {
        let chunk: String = self.buffer[..end].trim().to_string();
        self.buffer.drain(..end);
        // Drop the whitespace that separated the chunk from the remainder
        while self.buffer.starts_with(char::is_whitespace) {
            self.buffer.remove(0);
        }
        self.chunks_emitted += 1;
        chunk
    }
}
