//! Log Chunker - flush policy, boundary-aware splitting and level detection
//!
//! - `ChunkPolicy`: decides when a streamer buffer should be flushed
//! - `TextSplitter`: paragraph > newline > sentence > whitespace > hard cut,
//!   with a fixed character overlap between consecutive pieces
//! - `LevelClassifier`: keyword families in priority error > warn > debug > info

use std::time::Duration;

use crate::core::LogLevel;

// ============================================================================
// Chunking Configuration
// ============================================================================

/// Thresholds shared by the flush policy and the splitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Flush once buffered characters reach this; also the target piece size
    pub max_chunk_size: usize,
    /// Floor for time-triggered flushes
    pub min_chunk_size: usize,
    /// Flush once this many lines are buffered
    pub max_lines: usize,
    /// Time-triggered flush interval
    pub timeout: Duration,
    /// Characters of trailing context repeated at the start of the next piece
    pub overlap_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chunk_size: 1500,
            min_chunk_size: 200,
            max_lines: 25,
            timeout: Duration::from_secs(30),
            overlap_chars: 200,
        }
    }
}

impl ChunkPolicy {
    /// True iff chars ≥ max ∨ lines ≥ max_lines ∨ (elapsed ≥ timeout ∧ chars ≥ min)
    pub fn should_chunk(&self, buffered_chars: usize, buffered_lines: usize, elapsed: Duration) -> bool {
        buffered_chars >= self.max_chunk_size
            || buffered_lines >= self.max_lines
            || (elapsed >= self.timeout && buffered_chars >= self.min_chunk_size)
    }

    /// Splitter configured with this policy's size and overlap
    pub fn splitter(&self) -> TextSplitter {
        TextSplitter::new(self.max_chunk_size, self.overlap_chars)
    }
}

// ============================================================================
// Text Splitter
// ============================================================================

/// Greedy splitter that prefers natural boundaries.
///
/// Every piece except the last ends on the best boundary found in its window;
/// piece `n + 1` starts with the last `overlap` characters of piece `n`, so
/// dropping that prefix from every later piece rebuilds the input exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSplitter {
    max_chars: usize,
    overlap: usize,
}

impl TextSplitter {
    const SENTENCE_ENDS: [&'static str; 3] = [". ", "! ", "? "];

    /// `overlap` is clamped below `max_chars` so every piece makes progress
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap: overlap.min(max_chars - 1),
        }
    }

    /// Characters shared between consecutive pieces
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Split `text` into pieces of at most `max_chars` characters
    pub fn split(&self, text: &str) -> Vec<String> {
        // offsets[c] = byte offset of char c; offsets[len] = text.len()
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let total = offsets.len() - 1;

        if total == 0 {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        let mut start = 0;

        loop {
            if total - start <= self.max_chars {
                pieces.push(text[offsets[start]..].to_string());
                break;
            }

            // The cut must leave more than `overlap` chars so the next start advances
            let lo = start + self.overlap + 1;
            let hi = start + self.max_chars;
            let window = &text[offsets[lo]..offsets[hi]];

            let end = match Self::find_boundary(window) {
                Some(byte_cut) => lo + window[..byte_cut].chars().count(),
                None => hi,
            };

            pieces.push(text[offsets[start]..offsets[end]].to_string());
            start = end - self.overlap;
        }

        pieces
    }

    /// Byte offset just past the best boundary in `window`, if any
    fn find_boundary(window: &str) -> Option<usize> {
        // Paragraph break
        if let Some(pos) = window.rfind("\n\n") {
            return Some(pos + 2);
        }

        // Single newline
        if let Some(pos) = window.rfind('\n') {
            return Some(pos + 1);
        }

        // Sentence end, latest one wins
        let sentence = Self::SENTENCE_ENDS
            .iter()
            .filter_map(|end| window.rfind(end).map(|pos| pos + end.len()))
            .max();
        if sentence.is_some() {
            return sentence;
        }

        // Any whitespace
        window
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(pos, c)| pos + c.len_utf8())
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        ChunkPolicy::default().splitter()
    }
}

// ============================================================================
// Level Classification
// ============================================================================

/// Result of scanning one chunk for level keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub level: LogLevel,
    pub error_count: usize,
    pub warning_count: usize,
}

/// Case-insensitive keyword families, matched against word stems
#[derive(Debug, Clone)]
pub struct LevelClassifier {
    error_stems: Vec<&'static str>,
    warn_stems: Vec<&'static str>,
    debug_stems: Vec<&'static str>,
}

impl Default for LevelClassifier {
    fn default() -> Self {
        Self {
            error_stems: vec!["error", "err", "exception", "fail", "critical", "fatal", "panic"],
            warn_stems: vec!["warn", "deprecat"],
            debug_stems: vec!["debug", "trace", "verbose"],
        }
    }
}

impl LevelClassifier {
    pub fn classify(&self, text: &str) -> Classification {
        let mut error_count = 0;
        let mut warning_count = 0;
        let mut debug_count = 0;

        for word in words(text) {
            if Self::matches(&self.error_stems, &word) {
                error_count += 1;
            } else if Self::matches(&self.warn_stems, &word) {
                warning_count += 1;
            } else if Self::matches(&self.debug_stems, &word) {
                debug_count += 1;
            }
        }

        let level = if error_count > 0 {
            LogLevel::Error
        } else if warning_count > 0 {
            LogLevel::Warn
        } else if debug_count > 0 {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };

        Classification {
            level,
            error_count,
            warning_count,
        }
    }

    fn matches(stems: &[&str], word: &str) -> bool {
        stems.iter().any(|stem| {
            // "err" alone is a stem only as a whole word; "errno"/"erratic" are not errors
            if *stem == "err" {
                word == "err"
            } else {
                word.starts_with(stem)
            }
        })
    }
}

/// Lowercased alphabetic words
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
}

// ============================================================================
// Tests
// ============================================================================
