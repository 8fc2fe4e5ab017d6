//! Source chunking and representative sampling.
//!
//! Offsets are counted in characters so a chunk boundary never splits a
//! UTF-8 code point.

/// A contiguous slice of the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Zero-based position in the full chunk list
    pub index: usize,
    /// Character offset of the first character
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    pub text: String,
}

/// Split `source` into chunks of `chunk_size` characters where consecutive
/// chunks share `overlap` characters. An empty source yields no chunks.
pub fn split_chunks(source: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);
    let step = chunk_size - overlap;

    let offsets: Vec<usize> = source
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(source.len()))
        .collect();
    let total = offsets.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        chunks.push(Chunk {
            index: chunks.len(),
            start,
            end,
            text: source[offsets[start]..offsets[end]].to_string(),
        });
        if end == total {
            break;
        }
        start += step;
    }
    chunks
}

/// Keep at most `max_segments` chunks, evenly spaced by index and always
/// including the first and last chunk.
pub fn sample_chunks(chunks: Vec<Chunk>, max_segments: usize) -> Vec<Chunk> {
    let max_segments = max_segments.max(1);
    let n = chunks.len();
    if n <= max_segments {
        return chunks;
    }
    if max_segments == 1 {
        return chunks.into_iter().take(1).collect();
    }

    let picked: Vec<usize> = (0..max_segments)
        .map(|i| i * (n - 1) / (max_segments - 1))
        .collect();
    chunks
        .into_iter()
        .filter(|c| picked.binary_search(&c.index).is_ok())
        .collect()
}

/// Render sampled chunks as one labeled block for the extraction prompts.
pub fn render_segments(chunks: &[Chunk], total_chunks: usize) -> String {
    chunks
        .iter()
        .map(|c| {
            format!(
                "[Segment {}/{} · chars {}–{}]\n{}",
                c.index + 1,
                total_chunks,
                c.start,
                c.end,
                c.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_with_overlap() {
        let chunks = split_chunks("abcdefghij", 4, 1);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunks[1].start, 3);
        assert_eq!(chunks[2].end, 10);
    }

    #[test]
    fn test_split_counts_characters_not_bytes() {
        let source = "第一天他来了。第二天她走了。";
        let chunks = split_chunks(source, 5, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "第一天他来");
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, source);
    }

    #[test]
    fn test_split_empty_and_short() {
        assert!(split_chunks("", 100, 10).is_empty());
        let chunks = split_chunks("short", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short");
    }

    #[test]
    fn test_overlap_larger_than_chunk_still_progresses() {
        let chunks = split_chunks("abcdef", 3, 10);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.last().unwrap().end, 6);
    }

    #[test]
    fn test_sample_keeps_first_and_last() {
        let chunks = split_chunks(&"x".repeat(100), 5, 0);
        assert_eq!(chunks.len(), 20);
        let sampled = sample_chunks(chunks, 4);
        let indices: Vec<usize> = sampled.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 6, 12, 19]);
    }

    #[test]
    fn test_sample_never_exceeds_max() {
        for n in 1..40 {
            for max in 1..12 {
                let chunks = split_chunks(&"y".repeat(n * 3), 3, 0);
                let sampled = sample_chunks(chunks, max);
                assert!(sampled.len() <= max, "n={} max={}", n, max);
                assert_eq!(sampled[0].index, 0);
            }
        }
    }

    #[test]
    fn test_render_segments_labels() {
        let chunks = split_chunks("abcdefgh", 4, 0);
        let rendered = render_segments(&chunks, chunks.len());
        assert!(rendered.starts_with("[Segment 1/2 · chars 0–4]\nabcd"));
        assert!(rendered.contains("[Segment 2/2 · chars 4–8]\nefgh"));
    }
}
