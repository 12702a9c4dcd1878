//! Separator-driven text chunking with min/max character bounds

use regex::Regex;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};
use crate::types::{ChunkReference, SliceConfig};

fn image_link_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("Invalid regex"))
}

/// Splits text at separators, then packs the pieces into chunks of `[min, max]` characters.
///
/// Pieces longer than `max` are cut on grapheme boundaries. A trailing chunk shorter than
/// `min` is folded into its predecessor when that still fits under `max`. Text is never
/// dropped, so a document shorter than `min` yields one short chunk.
pub struct TextChunker {
    separators: Regex,
    min_len: usize,
    max_len: usize,
}

impl TextChunker {
    /// Create a chunker from a resolved slice config
    pub fn new(config: &SliceConfig) -> Result<Self> {
        let (min_len, max_len) = config.length_range;
        if min_len == 0 || min_len > max_len {
            return Err(Error::validation(format!(
                "Invalid chunk length range [{}, {}]",
                min_len, max_len
            )));
        }

        let alternatives: Vec<String> = config
            .separators
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| regex::escape(s))
            .collect();
        let pattern = if alternatives.is_empty() {
            regex::escape("\n")
        } else {
            alternatives.join("|")
        };
        let separators = Regex::new(&pattern)
            .map_err(|e| Error::validation(format!("Invalid separators: {}", e)))?;

        Ok(Self {
            separators,
            min_len,
            max_len,
        })
    }

    /// Chunk a whole document
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for piece in self.pieces(text) {
            for part in self.bounded(piece) {
                let part_len = part.chars().count();

                if current_len + part_len <= self.max_len {
                    current.push_str(part);
                    current_len += part_len;
                    continue;
                }

                if current_len >= self.min_len {
                    push_trimmed(&mut chunks, &current);
                    current = part.to_string();
                    current_len = part_len;
                    continue;
                }

                // Current is short: top it up to max from this part, carry the rest
                let room = self.max_len - current_len;
                let split_at = byte_offset_after_graphemes(part, room);
                current.push_str(&part[..split_at]);
                push_trimmed(&mut chunks, &current);
                current = part[split_at..].to_string();
                current_len = current.chars().count();
            }
        }

        let tail = current.trim();
        if !tail.is_empty() {
            let tail_len = tail.chars().count();
            match chunks.last_mut() {
                Some(last) if tail_len < self.min_len
                    && last.chars().count() + tail_len + 1 <= self.max_len =>
                {
                    last.push('\n');
                    last.push_str(tail);
                }
                _ => chunks.push(tail.to_string()),
            }
        }

        chunks
    }

    /// Cut after every separator match, keeping the separator with its piece
    fn pieces<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::new();
        let mut start = 0;
        for m in self.separators.find_iter(text) {
            pieces.push(&text[start..m.end()]);
            start = m.end();
        }
        if start < text.len() {
            pieces.push(&text[start..]);
        }
        pieces
    }

    /// Split a piece into parts of at most `max_len` characters
    fn bounded<'a>(&self, piece: &'a str) -> Vec<&'a str> {
        let mut parts = Vec::new();
        let mut rest = piece;
        while rest.chars().count() > self.max_len {
            let split_at = byte_offset_after_graphemes(rest, self.max_len);
            if split_at == 0 {
                break;
            }
            parts.push(&rest[..split_at]);
            rest = &rest[split_at..];
        }
        if !rest.is_empty() {
            parts.push(rest);
        }
        parts
    }
}

fn push_trimmed(chunks: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Byte offset after as many whole graphemes as fit in `max_chars` characters
fn byte_offset_after_graphemes(text: &str, max_chars: usize) -> usize {
    let mut chars = 0;
    let mut offset = 0;
    for (idx, grapheme) in text.grapheme_indices(true) {
        let len = grapheme.chars().count();
        if chars + len > max_chars {
            break;
        }
        chars += len;
        offset = idx + grapheme.len();
    }
    offset
}

/// Markdown image links found in a chunk
pub fn extract_image_references(text: &str) -> Vec<ChunkReference> {
    image_link_pattern()
        .captures_iter(text)
        .map(|cap| ChunkReference {
            label: cap.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            link: cap.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        })
        .collect()
}

/// True when the text contains any blocked term, case-insensitively
pub fn contains_blocked_term(text: &str, blocked_terms: &[String]) -> bool {
    if blocked_terms.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    blocked_terms
        .iter()
        .filter(|t| !t.is_empty())
        .any(|t| lowered.contains(&t.to_lowercase()))
}
