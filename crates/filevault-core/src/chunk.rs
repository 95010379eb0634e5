//! Overlapping token-window chunker.
//!
//! Splits extracted text into fixed-size windows of whitespace tokens. Window
//! `i` starts at token `i * (W - O)` where `W` is the window size and `O` the
//! overlap. Generation stops after the first window that reaches the end of
//! the text, so the tail is never emitted twice.
//!
//! Windows with fewer than `min_tokens` tokens are dropped. Because every
//! window but the last is full, in practice only the final window (or a
//! whole document that is too short) is ever discarded.
//!
//! # Example
//!
//! ```rust
//! use filevault_core::chunk::{chunk_text, ChunkParams};
//!
//! let text = vec!["word"; 1200].join(" ");
//! let windows = chunk_text(&text, &ChunkParams::default());
//! let starts: Vec<usize> = windows.iter().map(|w| w.start_token).collect();
//! assert_eq!(starts, vec![0, 450, 900]);
//! ```

use crate::models::TextWindow;

/// Window geometry for [`chunk_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub window_tokens: usize,
    pub overlap_tokens: usize,
    pub min_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            window_tokens: 500,
            overlap_tokens: 50,
            min_tokens: 50,
        }
    }
}

impl ChunkParams {
    /// Distance in tokens between consecutive window starts. Never zero.
    pub fn stride(&self) -> usize {
        self.window_tokens.saturating_sub(self.overlap_tokens).max(1)
    }
}

/// Split `text` into overlapping windows.
///
/// Deterministic: the same text and parameters always yield the same
/// boundaries, count and indices. Indices are contiguous from 0.
pub fn chunk_text(text: &str, params: &ChunkParams) -> Vec<TextWindow> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() || params.window_tokens == 0 {
        return Vec::new();
    }

    let stride = params.stride();
    let mut windows = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + params.window_tokens).min(tokens.len());
        let count = end - start;
        if count >= params.min_tokens {
            windows.push(TextWindow {
                index: windows.len() as u32,
                start_token: start,
                token_count: count,
                text: tokens[start..end].join(" "),
            });
        }
        if end == tokens.len() {
            break;
        }
        start += stride;
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    fn small() -> ChunkParams {
        ChunkParams {
            window_tokens: 10,
            overlap_tokens: 2,
            min_tokens: 5,
        }
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk_text("", &ChunkParams::default()).is_empty());
        assert!(chunk_text("   \n\t ", &ChunkParams::default()).is_empty());
    }

    #[test]
    fn test_default_geometry_offsets() {
        let windows = chunk_text(&words(1200), &ChunkParams::default());
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start_token, 0);
        assert_eq!(windows[1].start_token, 450);
        assert_eq!(windows[2].start_token, 900);
        assert_eq!(windows[2].token_count, 300);
        assert!(windows[1].text.starts_with("w450 "));
    }

    #[test]
    fn test_overlap_is_shared() {
        let windows = chunk_text(&words(20), &small());
        let first: Vec<&str> = windows[0].text.split(' ').collect();
        let second: Vec<&str> = windows[1].text.split(' ').collect();
        assert_eq!(&first[8..], &second[..2]);
    }

    #[test]
    fn test_short_tail_dropped() {
        // starts 0, 8, 16; the last window holds 3 tokens
        let windows = chunk_text(&words(19), &small());
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start_token, 8);
    }

    #[test]
    fn test_stops_at_first_window_reaching_end() {
        // second window (8..17) reaches the end; no third window
        let windows = chunk_text(&words(17), &small());
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].token_count, 9);
    }

    #[test]
    fn test_short_document_below_floor() {
        let params = ChunkParams::default();
        assert!(chunk_text(&words(49), &params).is_empty());
        assert_eq!(chunk_text(&words(50), &params).len(), 1);
    }

    #[test]
    fn test_deterministic_and_contiguous() {
        let text = words(2345);
        let a = chunk_text(&text, &ChunkParams::default());
        let b = chunk_text(&text, &ChunkParams::default());
        assert_eq!(a, b);
        for (i, w) in a.iter().enumerate() {
            assert_eq!(w.index as usize, i);
        }
    }

    #[test]
    fn test_whitespace_normalised() {
        let params = ChunkParams {
            window_tokens: 10,
            overlap_tokens: 0,
            min_tokens: 1,
        };
        let windows = chunk_text("alpha\n\n beta\tgamma", &params);
        assert_eq!(windows[0].text, "alpha beta gamma");
        assert_eq!(windows[0].token_count, 3);
    }
}
