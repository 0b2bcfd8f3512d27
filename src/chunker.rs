/// Splits draft text into bounded-size chunks without splitting sentences.
///
/// Sentences are delimited by terminal punctuation (`.`, `!`, `?`) followed by
/// whitespace or end of input. Each sentence keeps its exact bytes, so
/// concatenating the returned chunks reproduces the input verbatim. A single
/// sentence larger than `max_bytes` becomes its own oversized chunk rather
/// than being truncated. Whitespace-only input yields one chunk holding the
/// whole input, never zero chunks.
pub fn chunk(text: &str, max_bytes: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if !current.is_empty() && current.len() + sentence.len() > max_bytes {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(sentence);
        if current.len() > max_bytes {
            // Oversized single sentence; emit as-is.
            chunks.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Sentence-like slices covering the input exactly, boundaries falling right
/// after terminal punctuation that precedes whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            let at_boundary = match chars.peek() {
                Some((_, next)) => next.is_whitespace(),
                None => true,
            };
            if at_boundary {
                sentences.push(&text[start..end]);
                start = end;
            }
        }
    }

    if start < text.len() {
        sentences.push(&text[start..]);
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_reproduces_input() {
        let text = "Alice meets Bob. They fight a dragon! Do they win? Yes.\nThe end.";
        let chunks = chunk(text, 20);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn respects_byte_budget() {
        let text = "One two. Three four. Five six. Seven eight.";
        for c in chunk(text, 25) {
            assert!(c.len() <= 25, "chunk over budget: {:?}", c);
        }
    }

    #[test]
    fn oversized_sentence_is_its_own_chunk() {
        let long = "word ".repeat(50) + "end.";
        let text = format!("Short. {} Tail.", long);
        let chunks = chunk(&text, 30);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().any(|c| c.len() > 30));
        // Everything around the oversized sentence still fits.
        assert!(chunks.iter().filter(|c| c.len() > 30).count() == 1);
    }

    #[test]
    fn empty_input_yields_single_chunk() {
        assert_eq!(chunk("", 100), vec!["".to_string()]);
        assert_eq!(chunk("   ", 100), vec!["   ".to_string()]);
    }

    #[test]
    fn deterministic() {
        let text = "A b c. D e f! G h?";
        assert_eq!(chunk(text, 10), chunk(text, 10));
    }

    #[test]
    fn no_break_inside_abbreviation_like_runs() {
        // Punctuation not followed by whitespace is not a boundary.
        let text = "Version 1.2 shipped. Done.";
        let chunks = chunk(text, 21);
        assert_eq!(chunks[0], "Version 1.2 shipped.");
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn multibyte_text_measured_in_bytes() {
        let text = "日本語の文です。 Another one. 最後です。";
        let chunks = chunk(text, 40);
        assert_eq!(chunks.concat(), text);
    }
}
