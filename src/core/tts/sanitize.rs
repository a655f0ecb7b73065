//! Text preparation for the synthesis channel.
//!
//! The delivery channel only accepts plain utterances, so anything the
//! response model emits beyond speakable words (bracketed stage directions,
//! markdown emphasis, inline tags) is stripped before synthesis and before
//! cache keying. A second, harsher pass (`simplify`) produces the reduced
//! rendering used when a provider rejects the original text.

use once_cell::sync::Lazy;
use regex::Regex;

/// Bracketed annotations: [laughs], (aside), {cue}, <tag>.
static BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|\{[^}]*\}|<[^>]*>").expect("bracket pattern"));

/// Markdown-ish emphasis and code markers.
static EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*_`~#]+").expect("emphasis pattern"));

/// Maximum length of a simplified retry utterance, cut at a word boundary.
const SIMPLIFIED_MAX_CHARS: usize = 160;

/// Strips markup and collapses whitespace, leaving a plain utterance.
pub fn sanitize(text: &str) -> String {
    let without_brackets = BRACKETED.replace_all(text, " ");
    let without_emphasis = EMPHASIS.replace_all(&without_brackets, "");
    collapse_whitespace(&without_emphasis)
}

/// Reduced rendering for an invalid-input retry: sanitized, punctuation
/// stripped down to word characters, shortened.
pub fn simplify(text: &str) -> String {
    let sanitized = sanitize(text);
    let plain: String = sanitized
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    let collapsed = collapse_whitespace(&plain);
    truncate_at_word(&collapsed, SIMPLIFIED_MAX_CHARS)
}

/// Word -> spoken-form replacements applied before cache keying and
/// synthesis, e.g. "SQL" -> "sequel". Word-boundary aware.
#[derive(Clone, Default)]
pub struct PronunciationMap {
    patterns: Vec<(Regex, String)>,
}

impl PronunciationMap {
    pub fn new(pairs: &[(String, String)]) -> Self {
        let patterns = pairs
            .iter()
            .filter_map(|(word, spoken)| {
                let pattern = format!(r"\b{}\b", regex::escape(word));
                match Regex::new(&pattern) {
                    Ok(regex) => Some((regex, spoken.clone())),
                    Err(e) => {
                        tracing::error!("failed to compile pronunciation pattern for '{word}': {e}");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (pattern, replacement) in &self.patterns {
            result = pattern
                .replace_all(&result, replacement.as_str())
                .into_owned();
        }
        result
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut = 0;
    for (count, (i, c)) in text.char_indices().enumerate() {
        if count >= max_chars {
            break;
        }
        if c.is_whitespace() {
            cut = i;
        }
    }
    if cut == 0 {
        text.chars().take(max_chars).collect()
    } else {
        text[..cut].to_string()
    }
}
