//! Splitting documents into overlapping chunks for embedding.

/// Default chunk length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Break points tried in order, coarsest first.
const SEPARATORS: [&[char]; 3] = [&['\n', '\n'], &['\n'], &[' ']];

/// Chunk length and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkConfig {
    /// Build a config; the overlap is clamped below the chunk size.
    #[must_use]
    pub fn new(size: usize, overlap: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            overlap: overlap.min(size - 1),
        }
    }
}

/// Split `text` into chunks of at most `config.size` characters.
///
/// Chunks end at a paragraph break, line break or space when one falls past
/// the overlap region, otherwise at the size limit. Consecutive chunks share
/// up to `config.overlap` characters. Whitespace-only chunks are dropped.
#[must_use]
pub fn split_text(text: &str, config: ChunkConfig) -> Vec<String> {
    let ChunkConfig { size, overlap } = ChunkConfig::new(config.size, config.overlap);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let cut = if end == chars.len() {
            end
        } else {
            break_point(&chars, start + overlap + 1, end).unwrap_or(end)
        };

        let chunk: String = chars[start..cut].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        if cut == chars.len() {
            break;
        }
        start = cut.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

/// Position just past the last separator ending in `min..=end`.
fn break_point(chars: &[char], min: usize, end: usize) -> Option<usize> {
    SEPARATORS.iter().find_map(|sep| {
        let last_start = end.checked_sub(sep.len())?;
        (min.saturating_sub(sep.len())..=last_start)
            .rev()
            .find(|&i| &chars[i..i + sep.len()] == *sep)
            .map(|i| i + sep.len())
            .filter(|&cut| cut >= min)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = split_text("  brand values  ", ChunkConfig::default());
        assert_eq!(chunks, vec!["brand values"]);
        assert!(split_text("   \n\n ", ChunkConfig::default()).is_empty());
        assert!(split_text("", ChunkConfig::default()).is_empty());
    }

    #[test]
    fn test_prefers_paragraph_breaks() {
        let text = "aaaa aaaa\n\nbbbb bbbb\n\ncccc";
        let chunks = split_text(text, ChunkConfig::new(14, 0));
        assert_eq!(chunks, vec!["aaaa aaaa", "bbbb bbbb", "cccc"]);
    }

    #[test]
    fn test_falls_back_to_spaces_then_hard_cut() {
        let chunks = split_text("one two three four", ChunkConfig::new(9, 0));
        assert_eq!(chunks, vec!["one two", "three", "four"]);

        let chunks = split_text("abcdefghij", ChunkConfig::new(4, 0));
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let text: String = (0u8..30).map(|i| char::from(b'a' + i % 26)).collect();
        let chunks = split_text(&text, ChunkConfig::new(10, 4));
        assert_eq!(chunks[0], text[..10]);
        assert_eq!(chunks[1], text[6..16]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert!(chunks.last().unwrap().ends_with(&text[26..]));
    }

    #[test]
    fn test_multibyte_text() {
        let text = "é".repeat(25);
        let chunks = split_text(&text, ChunkConfig::new(10, 2));
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks[0].chars().count(), 10);
    }

    #[test]
    fn test_overlap_clamped_below_size() {
        assert_eq!(ChunkConfig::new(5, 9), ChunkConfig { size: 5, overlap: 4 });
        assert_eq!(ChunkConfig::new(0, 3), ChunkConfig { size: 1, overlap: 0 });
        assert_eq!(split_text("abc", ChunkConfig::new(1, 5)), vec!["a", "b", "c"]);
    }
}
