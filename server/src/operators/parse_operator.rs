use regex::Regex;
use regex_split::RegexSplit;

/// Preferred chunk length. Chunks may run past this to finish a sentence.
pub const CHUNK_TARGET_CHARS: usize = 500;
/// Tail of the previous chunk carried into the next one.
pub const CHUNK_OVERLAP_CHARS: usize = 50;
/// Absolute ceiling on chunk text, so embedding requests stay predictable.
pub const CHUNK_HARD_CAP_CHARS: usize = 2000;

fn take_chars_on_boundary(text: &str, max_chars: usize) -> usize {
    let mut byte_index = 0;
    for (count, (idx, ch)) in text.char_indices().enumerate() {
        if count == max_chars {
            return idx;
        }
        byte_index = idx + ch.len_utf8();
    }
    byte_index
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = vec![];
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let cut = take_chars_on_boundary(rest, max_chars);
        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let sentence_regex = Regex::new(r"[.!?。！？]+\s*").expect("Invalid sentence regex");
    sentence_regex
        .split_inclusive_left(paragraph)
        .map(|s| s.to_string())
        .collect()
}

fn split_punctuation(sentence: &str) -> Vec<String> {
    let punctuation_regex = Regex::new(r"[,;:，；：]+\s*").expect("Invalid punctuation regex");
    punctuation_regex
        .split_inclusive_left(sentence)
        .map(|s| s.to_string())
        .collect()
}

/// Break page text into atomic segments, preferring paragraph breaks, then
/// sentence ends, then punctuation, then a hard cut. Every segment fits the
/// hard cap.
fn segment_text(text: &str) -> Vec<String> {
    let paragraph_regex = Regex::new(r"\n\s*\n").expect("Invalid paragraph regex");

    let mut segments = vec![];
    for paragraph in paragraph_regex.split(text) {
        if paragraph.trim().is_empty() {
            continue;
        }
        for sentence in split_sentences(paragraph) {
            if sentence.chars().count() <= CHUNK_TARGET_CHARS {
                segments.push(sentence);
                continue;
            }
            for piece in split_punctuation(&sentence) {
                if piece.chars().count() <= CHUNK_HARD_CAP_CHARS {
                    segments.push(piece);
                } else {
                    segments.extend(hard_split(&piece, CHUNK_HARD_CAP_CHARS));
                }
            }
        }
    }

    segments
}

pub fn overlap_tail(chunk: &str, overlap_chars: usize) -> String {
    let total = chunk.chars().count();
    if total <= overlap_chars {
        return chunk.to_string();
    }
    let cut = take_chars_on_boundary(chunk, total - overlap_chars);
    chunk[cut..].to_string()
}

/// Split one page's text into overlapping retrieval chunks.
/// Whitespace-only input produces no chunks.
pub fn chunk_page_text(text: &str) -> Vec<String> {
    let segments = segment_text(text);
    if segments.is_empty() {
        return vec![];
    }

    let mut chunks: Vec<String> = vec![];
    let mut current = String::new();

    for segment in segments {
        let current_len = current.chars().count();
        let segment_len = segment.chars().count();

        if current_len > 0 && current_len + segment_len > CHUNK_TARGET_CHARS {
            let emitted = current.trim().to_string();
            if !emitted.is_empty() {
                current = overlap_tail(&emitted, CHUNK_OVERLAP_CHARS);
                chunks.push(emitted);
            } else {
                current.clear();
            }
        }

        current.push_str(&segment);

        if current.chars().count() > CHUNK_HARD_CAP_CHARS {
            let mut pieces = hard_split(current.trim(), CHUNK_HARD_CAP_CHARS);
            current = pieces.pop().unwrap_or_default();
            chunks.extend(pieces.into_iter().filter(|p| !p.trim().is_empty()));
        }
    }

    let emitted = current.trim().to_string();
    if !emitted.is_empty() {
        chunks.push(emitted);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence_block(count: usize) -> String {
        (0..count)
            .map(|i| format!("Sentence number {} describes the reset procedure in detail. ", i))
            .collect::<String>()
    }

    #[test]
    fn empty_and_whitespace_input_yield_no_chunks() {
        assert!(chunk_page_text("").is_empty());
        assert!(chunk_page_text("   \n\n \t ").is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_page_text("A single short line about pump maintenance.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "A single short line about pump maintenance.");
    }

    #[test]
    fn long_text_splits_on_sentences_with_overlap() {
        let text = format!("{}\n\n{}", sentence_block(12), sentence_block(12));
        assert!(text.chars().count() > 1200);

        let chunks = chunk_page_text(&text);
        assert!(chunks.len() >= 2, "expected multiple chunks, got {:?}", chunks);

        for chunk in &chunks {
            assert!(!chunk.trim().is_empty());
            assert!(chunk.chars().count() <= CHUNK_HARD_CAP_CHARS);
        }

        let tail = overlap_tail(&chunks[0], CHUNK_OVERLAP_CHARS);
        assert!(
            chunks[1].starts_with(tail.trim_start()),
            "second chunk should begin with the tail of the first"
        );
    }

    #[test]
    fn unbroken_text_is_hard_capped() {
        let text = "a".repeat(5000);
        let chunks = chunk_page_text(&text);

        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= CHUNK_HARD_CAP_CHARS);
        }
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 5000);
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_character() {
        let text = "文".repeat(2500);
        let chunks = chunk_page_text(&text);
        assert!(chunks.len() >= 2);
        for chunk in chunks {
            assert!(chunk.chars().all(|c| c == '文'));
        }
    }
}
