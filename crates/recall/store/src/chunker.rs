//! Boundary-aware text chunking.
//!
//! A memory's content is partitioned into consecutive slices of at most
//! `max_chunk_chars` characters. Each slice also remembers the up to
//! `overlap_chars` characters that precede it; the embedding window of a
//! chunk is `overlap + text`, so neighbouring windows share context while the
//! slices alone still concatenate back to the original content.
//!
//! Split points are chosen in priority order: paragraph break, sentence end,
//! whitespace, and only then a hard cut at the size limit.

use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

/// Chunking limits, measured in Unicode scalar values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1000,
            overlap_chars: 100,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_chunk_chars == 0 {
            return Err(StoreError::invalid("max_chunk_chars must be positive"));
        }
        if self.overlap_chars >= self.max_chunk_chars {
            return Err(StoreError::invalid(
                "overlap_chars must be smaller than max_chunk_chars",
            ));
        }
        Ok(())
    }
}

/// One slice produced by [`Chunker::split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: u32,
    pub text: String,
    pub overlap: String,
}

impl TextChunk {
    pub fn window(&self) -> String {
        format!("{}{}", self.overlap, self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Sentence,
    WhitespaceRun,
    Whitespace,
}

const BOUNDARY_PRIORITY: [Boundary; 4] = [
    Boundary::Paragraph,
    Boundary::Sentence,
    Boundary::WhitespaceRun,
    Boundary::Whitespace,
];

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    /// Partition `text` into ordered chunks. Pure and deterministic.
    pub fn split(&self, text: &str) -> StoreResult<Vec<TextChunk>> {
        if text.is_empty() {
            return Err(StoreError::invalid("cannot chunk empty text"));
        }

        let chars: Vec<char> = text.chars().collect();
        let max = self.config.max_chunk_chars;

        if chars.len() <= max {
            return Ok(vec![TextChunk {
                index: 0,
                text: text.to_string(),
                overlap: String::new(),
            }]);
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while chars.len() - start > max {
            let end = split_point(&chars, start, start + max);
            chunks.push(self.make_chunk(&chars, chunks.len(), start, end));
            start = end;
        }
        chunks.push(self.make_chunk(&chars, chunks.len(), start, chars.len()));
        Ok(chunks)
    }

    fn make_chunk(&self, chars: &[char], index: usize, start: usize, end: usize) -> TextChunk {
        let overlap_start = start.saturating_sub(self.config.overlap_chars);
        TextChunk {
            index: index as u32,
            text: chars[start..end].iter().collect(),
            overlap: chars[overlap_start..start].iter().collect(),
        }
    }
}

/// Chunk windows (overlap followed by slice) for `text`.
pub fn chunk(text: &str, max_chunk_chars: usize, overlap_chars: usize) -> StoreResult<Vec<String>> {
    let chunker = Chunker::new(ChunkerConfig {
        max_chunk_chars,
        overlap_chars,
    })?;
    Ok(chunker
        .split(text)?
        .iter()
        .map(TextChunk::window)
        .collect())
}

/// Last position in `(start, limit]` where the next chunk may begin, by
/// boundary priority. `limit` is always `< chars.len()` here.
fn split_point(chars: &[char], start: usize, limit: usize) -> usize {
    for boundary in BOUNDARY_PRIORITY {
        if let Some(p) = (start + 1..=limit)
            .rev()
            .find(|&p| is_boundary(chars, start, p, boundary))
        {
            return p;
        }
    }
    limit
}

fn is_boundary(chars: &[char], start: usize, p: usize, boundary: Boundary) -> bool {
    let before = chars[p - 1];
    if !before.is_whitespace() {
        return false;
    }
    let after_is_text = chars.get(p).is_some_and(|c| !c.is_whitespace());
    match boundary {
        Boundary::Whitespace => true,
        Boundary::WhitespaceRun => after_is_text,
        Boundary::Paragraph => {
            after_is_text && whitespace_run(chars, start, p).filter(|c| **c == '\n').count() >= 2
        }
        Boundary::Sentence => {
            if !after_is_text {
                return false;
            }
            let run = whitespace_run(chars, start, p).count();
            let last_text = p - run;
            last_text > start && matches!(chars[last_text - 1], '.' | '!' | '?')
        }
    }
}

/// The whitespace characters ending at `p - 1`, not crossing `start`.
fn whitespace_run(chars: &[char], start: usize, p: usize) -> impl Iterator<Item = &char> {
    chars[start..p]
        .iter()
        .rev()
        .take_while(|c| c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunker(max: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_chunk_chars: max,
            overlap_chars: overlap,
        })
        .unwrap()
    }

    fn rebuild(chunks: &[TextChunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let out = chunk("The user prefers Rust", 1000, 100).unwrap();
        assert_eq!(out, vec!["The user prefers Rust".to_string()]);
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(chunk("", 10, 2), Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn bad_limits_are_rejected() {
        assert!(chunk("abc", 0, 0).is_err());
        assert!(chunk("abc", 10, 10).is_err());
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = "First sentence. Second one.\n\nNext paragraph here.";
        let chunks = chunker(40, 0).split(text).unwrap();
        assert_eq!(chunks[0].text, "First sentence. Second one.\n\n");
        assert_eq!(chunks[1].text, "Next paragraph here.");
    }

    #[test]
    fn falls_back_to_sentence_breaks() {
        let text = "Alpha beta gamma. Delta epsilon zeta eta theta.";
        let chunks = chunker(30, 0).split(text).unwrap();
        assert_eq!(chunks[0].text, "Alpha beta gamma. ");
        assert_eq!(rebuild(&chunks), text);
    }

    #[test]
    fn falls_back_to_whitespace() {
        let text = "one two three four five six";
        let chunks = chunker(10, 0).split(text).unwrap();
        assert_eq!(chunks[0].text, "one two ");
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 10));
        assert_eq!(rebuild(&chunks), text);
    }

    #[test]
    fn hard_cut_without_boundaries() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = chunker(10, 3).split(text).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcdefghij", "klmnopqrst", "uvwxyz"]);
        assert_eq!(chunks[1].overlap, "hij");
        assert_eq!(chunks[1].window(), "hijklmnopqrst");
        assert_eq!(chunks[0].overlap, "");
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "ééééééééééééééé";
        let chunks = chunker(4, 1).split(text).unwrap();
        assert_eq!(rebuild(&chunks), text);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 4));
    }

    proptest! {
        #[test]
        fn chunking_is_deterministic(text in "[a-z .!?\n]{1,400}", max in 5usize..80, overlap in 0usize..5) {
            let a = chunk(&text, max, overlap).unwrap();
            let b = chunk(&text, max, overlap).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn slices_reconstruct_content(text in "\\PC{1,400}", max in 5usize..80, overlap in 0usize..5) {
            let chunks = chunker(max, overlap).split(&text).unwrap();
            prop_assert_eq!(rebuild(&chunks), text);
        }

        #[test]
        fn slices_are_bounded_and_indexed(text in "[a-z .\n]{1,400}", max in 5usize..80) {
            let chunks = chunker(max, 4).split(&text).unwrap();
            for (i, c) in chunks.iter().enumerate() {
                prop_assert_eq!(c.index as usize, i);
                prop_assert!(!c.text.is_empty());
                prop_assert!(c.text.chars().count() <= max);
                prop_assert!(c.overlap.chars().count() <= 4);
            }
        }

        #[test]
        fn short_input_is_unsplit(text in "[a-z ]{1,50}") {
            prop_assert_eq!(chunk(&text, 50, 10).unwrap(), vec![text]);
        }
    }
}
