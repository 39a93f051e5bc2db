//! Line-packing, token-bounded chunker.
//!
//! Splits document content into chunks that never exceed a configurable
//! `max_tokens_per_chunk`. The indivisible unit is one line, including its
//! trailing newline, so concatenating the chunks in order reproduces the
//! input byte for byte.
//!
//! # Tokenizer
//!
//! Token counts come from a fixed, versioned tokenizer
//! ([`TOKENIZER_VERSION`]): a token is a maximal run of non-whitespace
//! characters. Because a token never spans a newline, counts are additive
//! across chunks: the chunk counts always sum to the document count.
//! Documents stored under an older tokenizer version are rechunked on next
//! access.
//!
//! # Algorithm
//!
//! 1. Split content into lines with `split_inclusive('\n')`.
//! 2. If a single line holds more than `max_tokens_per_chunk` tokens, fail
//!    with a chunking error (the unit is indivisible).
//! 3. Append lines to the current chunk until the next line would push it
//!    past the limit; then flush and start a new chunk.
//! 4. Flush the trailing chunk. Empty content yields zero chunks.
//!
//! # Example
//!
//! ```rust
//! use memory_agent_core::chunk::{chunk, reassemble_text};
//!
//! let text = "alpha beta\ngamma\ndelta epsilon zeta\n";
//! let chunks = chunk(text, 3).unwrap();
//! assert_eq!(chunks, vec!["alpha beta\ngamma\n", "delta epsilon zeta\n"]);
//! assert_eq!(reassemble_text(&chunks), text);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{MemoryError, MemoryResult};
use crate::models::DocumentChunk;

/// Version of the built-in tokenizer. Bump when token boundaries change.
pub const TOKENIZER_VERSION: u32 = 1;

/// Default chunk size, in tokens.
pub const DEFAULT_MAX_TOKENS_PER_CHUNK: usize = 4000;

/// Count tokens in `text` using the built-in tokenizer.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The prefix of `text` holding at most `max_tokens` tokens.
///
/// Used by the reasoning strategy to fit a single oversized candidate into
/// its context budget.
pub fn truncate_tokens(text: &str, max_tokens: usize) -> &str {
    let mut seen = 0;
    let mut in_token = false;
    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_token = false;
        } else if !in_token {
            if seen == max_tokens {
                return &text[..i];
            }
            seen += 1;
            in_token = true;
        }
    }
    text
}

/// Split `content` into token-bounded chunks.
///
/// # Errors
///
/// [`MemoryError::Chunking`] when `max_tokens_per_chunk` is zero or when a
/// single line exceeds the limit. Chunking errors are never retried.
pub fn chunk(content: &str, max_tokens_per_chunk: usize) -> MemoryResult<Vec<String>> {
    if max_tokens_per_chunk == 0 {
        return Err(MemoryError::Chunking {
            message: "max tokens per chunk must be positive".to_string(),
        });
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for (line_no, line) in content.split_inclusive('\n').enumerate() {
        let tokens = count_tokens(line);
        if tokens > max_tokens_per_chunk {
            return Err(MemoryError::Chunking {
                message: format!(
                    "line {} holds {} tokens, more than the {}-token chunk limit",
                    line_no + 1,
                    tokens,
                    max_tokens_per_chunk
                ),
            });
        }

        if current_tokens + tokens > max_tokens_per_chunk && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        current.push_str(line);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    Ok(chunks)
}

/// Chunk a document's content into [`DocumentChunk`]s with contiguous
/// numbers, token counts, and SHA-256 content hashes.
pub fn build_chunks(
    document_id: &str,
    content: &str,
    max_tokens_per_chunk: usize,
) -> MemoryResult<Vec<DocumentChunk>> {
    let pieces = chunk(content, max_tokens_per_chunk)?;
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| make_chunk(document_id, i as u32, text))
        .collect())
}

/// Concatenate chunk contents in `chunk_number` order.
pub fn reassemble(chunks: &[DocumentChunk]) -> String {
    let mut ordered: Vec<&DocumentChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_number);
    ordered.iter().map(|c| c.content.as_str()).collect()
}

/// Concatenate raw chunk strings as returned by [`chunk`].
pub fn reassemble_text(chunks: &[String]) -> String {
    chunks.concat()
}

/// Hex-encoded SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, number: u32, text: String) -> DocumentChunk {
    DocumentChunk {
        document_id: document_id.to_string(),
        chunk_number: number,
        token_count: count_tokens(&text),
        content_hash: content_hash(&text),
        content: text,
        embedding: None,
        embedding_model_version: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `lines` lines of `per_line` tokens each.
    fn synthetic(lines: usize, per_line: usize) -> String {
        (0..lines)
            .map(|l| {
                let words: Vec<String> = (0..per_line).map(|w| format!("w{l}_{w}")).collect();
                format!("{}\n", words.join(" "))
            })
            .collect()
    }

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("  one\ttwo\n three  "), 3);
        assert_eq!(count_tokens("# Heading\n\n- item"), 4);
    }

    #[test]
    fn test_empty_content_yields_no_chunks() {
        assert!(chunk("", 10).unwrap().is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk("Hello, world!", 700).unwrap();
        assert_eq!(chunks, vec!["Hello, world!"]);
    }

    #[test]
    fn test_ten_thousand_tokens_split_4000_4000_2000() {
        let text = synthetic(1000, 10);
        assert_eq!(count_tokens(&text), 10_000);

        let chunks = build_chunks("doc1", &text, 4000).unwrap();
        let counts: Vec<usize> = chunks.iter().map(|c| c.token_count).collect();
        assert_eq!(counts, vec![4000, 4000, 2000]);
        assert_eq!(counts.iter().sum::<usize>(), 10_000);
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_round_trip_preserves_whitespace_exactly() {
        let text = "# Title\n\n  indented line  \n\n\ttab\r\nno trailing newline";
        for max in [3, 4, 5, 100] {
            let chunks = chunk(text, max).unwrap();
            assert_eq!(reassemble_text(&chunks), text, "max = {max}");
        }
    }

    #[test]
    fn test_every_chunk_within_limit() {
        let text = (0..200)
            .map(|i| format!("{}\n", "tok ".repeat(i % 7 + 1)))
            .collect::<String>();
        let chunks = build_chunks("doc1", &text, 9).unwrap();
        assert!(chunks.iter().all(|c| c.token_count <= 9));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_number, i as u32);
        }
    }

    #[test]
    fn test_oversized_line_is_chunking_error() {
        let err = chunk("a b c d e f\nshort\n", 4).unwrap_err();
        assert!(matches!(err, MemoryError::Chunking { .. }));
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_zero_limit_is_chunking_error() {
        assert!(matches!(
            chunk("x", 0).unwrap_err(),
            MemoryError::Chunking { .. }
        ));
    }

    #[test]
    fn test_deterministic() {
        let text = synthetic(37, 3);
        let a = build_chunks("d", &text, 10).unwrap();
        let b = build_chunks("d", &text, 10).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_reassemble_orders_by_chunk_number() {
        let mut chunks = build_chunks("d", "one\ntwo\nthree\n", 1).unwrap();
        chunks.reverse();
        assert_eq!(reassemble(&chunks), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────┐\n│ Hello │\n└──────┘";
        let chunks = chunk(text, 3).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(reassemble_text(&chunks), text);
    }

    #[test]
    fn test_truncate_tokens() {
        assert_eq!(truncate_tokens("a bb  ccc dddd", 2), "a bb  ");
        assert_eq!(truncate_tokens("a bb", 5), "a bb");
        assert_eq!(truncate_tokens("a bb", 0), "");
    }

    #[test]
    fn test_hash_is_sha256() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
