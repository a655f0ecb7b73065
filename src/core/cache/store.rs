//! Cache store for synthesized audio.
//!
//! Maps a content-addressed key (normalized text + voice parameters) to the
//! synthesized audio bytes, so repeated utterances (greeting lines,
//! backchannel fillers, confirmations) never hit a provider twice. Entries
//! are write-once: identical keys always yield identical audio, and the
//! first writer wins on concurrent misses. Shared process-wide across calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use moka::future::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_128;

use crate::core::tts::base::VoiceParams;

/// Cache sizing and expiry settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Maximum number of entries.
    pub max_entries: u64,
    /// Optional maximum total audio size in bytes.
    pub max_size_bytes: Option<u64>,
    /// Optional TTL applied to every entry.
    pub ttl: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            max_size_bytes: Some(256 * 1024 * 1024), // 256MB
            ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Content-addressed cache key.
///
/// Built from the normalized utterance text plus every voice parameter that
/// affects the rendered audio, hashed with xxh3-128. Two keys are equal iff
/// the synthesized audio would be byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Exact key: whitespace-normalized text + voice parameters.
    pub fn for_utterance(text: &str, params: &VoiceParams) -> Self {
        Self::hash_parts(&normalize_exact(text), params)
    }

    /// Near-match key: the same derivation after collapsing case and
    /// punctuation. Two texts share a phonetic key only when they normalize
    /// to the same spoken form, so this layer can never serve audio for a
    /// semantically different utterance.
    pub fn phonetic(text: &str, params: &VoiceParams) -> Self {
        Self::hash_parts(&normalize_phonetic(text), params)
    }

    fn hash_parts(normalized_text: &str, params: &VoiceParams) -> Self {
        let material = format!("{normalized_text}\x1f{}", params.cache_fields());
        Self(format!("{:032x}", xxh3_128(material.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whitespace-collapsed form used for exact keying.
fn normalize_exact(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case- and punctuation-collapsed form used for near-match keying.
fn normalize_phonetic(text: &str) -> String {
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hit/miss counters for cache observability.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns (hits, misses, puts).
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.puts.load(Ordering::Relaxed),
        )
    }
}

struct StoredEntry {
    audio: Bytes,
    created_at: SystemTime,
    hit_count: AtomicU64,
}

/// Process-wide audio cache backed by moka.
pub struct AudioCache {
    entries: MokaCache<String, Arc<StoredEntry>>,
    /// Phonetic alias -> exact key. Kept separate so the near-match layer is
    /// a pure optimization in front of the exact lookup.
    aliases: MokaCache<String, String>,
    metrics: Arc<CacheMetrics>,
}

impl AudioCache {
    pub fn new(settings: CacheSettings) -> Self {
        let mut builder: MokaCacheBuilder<String, Arc<StoredEntry>, _> =
            MokaCache::builder().max_capacity(settings.max_entries);
        if let Some(max_size) = settings.max_size_bytes {
            builder = builder
                .weigher(|_key, entry: &Arc<StoredEntry>| entry.audio.len() as u32)
                .max_capacity(max_size);
        }
        if let Some(ttl) = settings.ttl {
            builder = builder.time_to_live(ttl);
        }

        let mut alias_builder: MokaCacheBuilder<String, String, _> =
            MokaCache::builder().max_capacity(settings.max_entries);
        if let Some(ttl) = settings.ttl {
            alias_builder = alias_builder.time_to_live(ttl);
        }

        Self {
            entries: builder.build(),
            aliases: alias_builder.build(),
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    /// Exact lookup.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        match self.entries.get(key.as_str()).await {
            Some(entry) => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_hit();
                debug!(key = key.as_str(), "audio cache hit");
                Some(entry.audio.clone())
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Near-match lookup: resolves the phonetic alias, then the exact entry.
    pub async fn get_near(&self, phonetic: &CacheKey) -> Option<Bytes> {
        let exact = self.aliases.get(phonetic.as_str()).await?;
        let entry = self.entries.get(&exact).await?;
        entry.hit_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_hit();
        debug!(key = %exact, "audio cache near-match hit");
        Some(entry.audio.clone())
    }

    /// Write-once insert: if the key is already present the existing audio is
    /// kept and the new bytes are dropped.
    pub async fn put(&self, key: &CacheKey, phonetic: &CacheKey, audio: Bytes) {
        self.metrics.record_put();
        self.entries
            .entry(key.as_str().to_string())
            .or_insert_with(async {
                debug!(key = key.as_str(), "audio cache stored entry");
                Arc::new(StoredEntry {
                    audio,
                    created_at: SystemTime::now(),
                    hit_count: AtomicU64::new(0),
                })
            })
            .await;
        self.aliases
            .entry(phonetic.as_str().to_string())
            .or_insert_with(async { key.as_str().to_string() })
            .await;
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Age of a cached entry, mostly for diagnostics.
    pub async fn entry_age(&self, key: &CacheKey) -> Option<Duration> {
        let entry = self.entries.get(key.as_str()).await?;
        entry.created_at.elapsed().ok()
    }
}
