//! Document chunking for per-chunk graph generation.

use serde::{Deserialize, Serialize};

/// A window of the source document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Byte offset of the chunk start in the source.
    pub start: usize,
    /// Byte offset one past the chunk end.
    pub end: usize,
}

/// Splits documents into overlapping windows, breaking at paragraph
/// boundaries where possible.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            chunk_size: 12_000,
            overlap: 1_000,
        }
    }
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Split `text` into chunks. A document shorter than one window yields a
    /// single chunk.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }
        if text.len() <= self.chunk_size {
            return vec![Chunk {
                index: 0,
                text: text.to_string(),
                start: 0,
                end: text.len(),
            }];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut index = 0usize;

        while start < text.len() {
            let hard_end = (start + self.chunk_size).min(text.len());
            let end = if hard_end < text.len() {
                self.break_point(text, start, hard_end)
            } else {
                hard_end
            };

            chunks.push(Chunk {
                index,
                text: text[start..end].to_string(),
                start,
                end,
            });
            index += 1;

            if end >= text.len() {
                break;
            }
            // Step back for overlap, staying on a char boundary.
            let mut next = end.saturating_sub(self.overlap).max(start + 1);
            while next > 0 && !text.is_char_boundary(next) {
                next -= 1;
            }
            start = next;
        }

        chunks
    }

    /// Prefer breaking at a blank line, then a newline, inside the back half
    /// of the window; otherwise cut at the size limit on a char boundary.
    fn break_point(&self, text: &str, start: usize, hard_end: usize) -> usize {
        let window = &text[start..hard_end];
        let search_from = window.len() / 2;

        if let Some(pos) = window[search_from..].rfind("\n\n") {
            return start + search_from + pos + 2;
        }
        if let Some(pos) = window[search_from..].rfind('\n') {
            return start + search_from + pos + 1;
        }
        let mut end = hard_end;
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_document_single_chunk() {
        let chunker = Chunker::default();
        let chunks = chunker.chunk("Machine learning is a subset of AI.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start, 0);
    }

    #[test]
    fn test_empty_document_no_chunks() {
        assert!(Chunker::default().chunk("").is_empty());
    }

    #[test]
    fn test_chunks_overlap() {
        let chunker = Chunker::new(100, 20);
        let text = "abcdefghij".repeat(30); // 300 chars, no newlines
        let chunks = chunker.chunk(&text);

        assert!(chunks.len() >= 3);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].start < pair[0].end,
                "consecutive chunks must overlap"
            );
            assert_eq!(pair[0].end - pair[1].start, 20);
        }
        assert_eq!(chunks.last().unwrap().end, text.len());
    }

    #[test]
    fn test_breaks_at_paragraph_boundary() {
        let chunker = Chunker::new(100, 10);
        let mut text = "a".repeat(70);
        text.push_str("\n\n");
        text.push_str(&"b".repeat(100));
        let chunks = chunker.chunk(&text);

        // First chunk should end right after the blank line, not at 100.
        assert_eq!(chunks[0].end, 72);
        assert!(chunks[0].text.ends_with("\n\n"));
    }

    #[test]
    fn test_chunks_cover_document() {
        let chunker = Chunker::new(50, 10);
        let text = "word ".repeat(100);
        let chunks = chunker.chunk(&text);

        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.len());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(&text[chunk.start..chunk.end], chunk.text);
        }
    }
}
