//! Byte-budgeted text segmentation for the mesh transport
//!
//! The mesh caps the payload of a single text packet, so long outbound text
//! is cut into parts. Words are packed greedily; a word that cannot fit in
//! a part on its own is cut character by character. When more than one
//! part results, each is suffixed with ` [i/N]`.
//!
//! # Byte accounting
//!
//! Sizes are *accounted*, not encoded: a character below U+0080 counts one
//! byte and anything else counts two. This keeps parts compatible with what
//! existing mesh peers expect. The accounting is a plain function pointer so
//! a different measure (for example real UTF-8 length) can be swapped in.
//!
//! There is no reassembly on the receive side; markers are informational.

use crate::config::{MARKER_RESERVE, MAX_BYTES_PER_MESSAGE};

/// Function measuring the accounted size of one character
pub type CharAccounting = fn(char) -> usize;

/// ASCII counts 1, everything else counts 2
pub fn approximate_char_len(c: char) -> usize {
    if (c as u32) < 128 {
        1
    } else {
        2
    }
}

/// Splits text into parts that fit the mesh payload budget
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    max_bytes: usize,
    marker_reserve: usize,
    accounting: CharAccounting,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(MAX_BYTES_PER_MESSAGE)
    }
}

impl Segmenter {
    /// Create a segmenter with the given budget and approximate accounting
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            marker_reserve: MARKER_RESERVE,
            accounting: approximate_char_len,
        }
    }

    /// Use a different per-character accounting function
    pub fn with_accounting(mut self, accounting: CharAccounting) -> Self {
        self.accounting = accounting;
        self
    }

    /// Budget of a whole part, marker included
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Budget of the text of a part, marker excluded
    pub fn effective_budget(&self) -> usize {
        self.max_bytes.saturating_sub(self.marker_reserve).max(1)
    }

    /// Accounted size of a string
    pub fn accounted_len(&self, text: &str) -> usize {
        text.chars().map(self.accounting).sum()
    }

    /// Split text into ordered parts
    ///
    /// Empty or whitespace-only text yields no parts. Text that fits the
    /// budget is returned unchanged as a single unmarked part.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if self.accounted_len(text) <= self.max_bytes {
            return vec![text.to_string()];
        }

        let budget = self.effective_budget();
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut current_bytes = 0;

        for word in text.split_whitespace() {
            let word_bytes = self.accounted_len(word);
            let space = usize::from(!current.is_empty());

            if current_bytes + space + word_bytes <= budget {
                if space == 1 {
                    current.push(' ');
                }
                current.push_str(word);
                current_bytes += space + word_bytes;
                continue;
            }

            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
                current_bytes = 0;
            }

            if word_bytes <= budget {
                current.push_str(word);
                current_bytes = word_bytes;
            } else {
                // Oversize word: emit full slices, keep the tail open for packing
                let (tail, tail_bytes) = self.hard_split(word, budget, &mut parts);
                current = tail;
                current_bytes = tail_bytes;
            }
        }

        if !current.is_empty() {
            parts.push(current);
        }

        if parts.len() > 1 {
            let total = parts.len();
            parts = parts
                .into_iter()
                .enumerate()
                .map(|(i, part)| format!("{} [{}/{}]", part, i + 1, total))
                .collect();
        }
        parts
    }

    fn hard_split(&self, word: &str, budget: usize, parts: &mut Vec<String>) -> (String, usize) {
        let mut slice = String::new();
        let mut slice_bytes = 0;
        for c in word.chars() {
            let c_bytes = (self.accounting)(c);
            if slice_bytes + c_bytes > budget && !slice.is_empty() {
                parts.push(std::mem::take(&mut slice));
                slice_bytes = 0;
            }
            slice.push(c);
            slice_bytes += c_bytes;
        }
        (slice, slice_bytes)
    }
}

/// Split with the default accounting and the given whole-part budget
pub fn split(text: &str, max_bytes: usize) -> Vec<String> {
    Segmenter::new(max_bytes).split(text)
}
