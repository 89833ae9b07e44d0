use crate::models::{ChunkKind, TextFeatures};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

const ALLOWED_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':', '(', ')', '\'', '"', '-'];

fn sentence_terminators() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[.!?]+").expect("sentence pattern is valid"))
}

fn query_noise() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"[^\w\s'"-]"#).expect("query pattern is valid"))
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_quote(ch: char) -> char {
    match ch {
        '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' | '\u{2032}' | '`' => '\'',
        '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' | '\u{2033}' => '"',
        other => other,
    }
}

/// Cleans a paragraph for indexing: quote variants are unified, characters outside the
/// alphanumeric/punctuation allow-list are dropped, runs of the same punctuation mark
/// collapse to one and whitespace collapses to single spaces.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut previous: Option<char> = None;

    for ch in text.chars().map(normalize_quote) {
        let keep = ch.is_alphanumeric() || ch.is_whitespace() || ALLOWED_PUNCTUATION.contains(&ch);
        if !keep {
            continue;
        }
        if ALLOWED_PUNCTUATION.contains(&ch) && previous == Some(ch) {
            continue;
        }
        cleaned.push(ch);
        previous = Some(ch);
    }

    normalize_whitespace(&cleaned)
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn text_features(text: &str) -> TextFeatures {
    let word_count = text.split_whitespace().count();
    let sentence_count = sentence_terminators()
        .split(text)
        .filter(|sentence| !sentence.trim().is_empty())
        .count();
    let avg_words_per_sentence = if sentence_count == 0 {
        0
    } else {
        word_count / sentence_count
    };

    TextFeatures {
        word_count,
        sentence_count,
        char_count: char_len(text),
        avg_words_per_sentence,
        has_numbers: text.chars().any(|ch| ch.is_ascii_digit()),
        has_capitals: text.chars().any(char::is_uppercase),
    }
}

/// Lowercases a search query and reduces it to word characters, spaces, hyphens and quotes.
pub fn normalize_query(query: &str) -> String {
    let lowered = query.trim().to_lowercase();
    let stripped = query_noise().replace_all(&lowered, " ");
    normalize_whitespace(&stripped)
}

/// Alphanumeric tokens of `text`, lowercased.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn make_chunk_id(
    document_id: &str,
    kind: ChunkKind,
    record_index: usize,
    page: u32,
    text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update((record_index as u64).to_le_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

const MAX_PLAIN_ID_LEN: usize = 128;

/// Whether `id` can appear verbatim inside derived names such as index uids and cache keys:
/// ASCII letters, digits, `-` and `_`, at most 128 bytes.
pub fn is_plain_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PLAIN_ID_LEN
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// Hex sha256 of `id`, used in derived names when the id is not plain.
pub fn id_digest(id: &str) -> String {
    format!("{:x}", Sha256::digest(id.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof \u{a0}  spacing";
        assert_eq!(normalize_whitespace(input), "A lot of spacing");
    }

    #[test]
    fn cleaning_unifies_quotes_and_strips_symbols() {
        let cleaned = clean_text("  \u{201c}Hello\u{201d} \u{2014} it\u{2019}s   a test!!!  \u{2022} ok... ");
        assert_eq!(cleaned, "\"Hello\" it's a test! ok.");
    }

    #[test]
    fn cleaning_keeps_unicode_letters_and_digits() {
        assert_eq!(clean_text("Größe 42 mm"), "Größe 42 mm");
    }

    #[test]
    fn features_count_words_and_sentences() {
        let features = text_features("The pump failed. Pressure was 12 bar! Why?");
        assert_eq!(features.word_count, 8);
        assert_eq!(features.sentence_count, 3);
        assert_eq!(features.avg_words_per_sentence, 2);
        assert!(features.has_numbers);
        assert!(features.has_capitals);
    }

    #[test]
    fn features_without_sentences_average_to_zero() {
        let features = text_features("");
        assert_eq!(features.sentence_count, 0);
        assert_eq!(features.avg_words_per_sentence, 0);

        let punctuation_only = text_features("...");
        assert_eq!(punctuation_only.sentence_count, 0);
        assert_eq!(punctuation_only.avg_words_per_sentence, 0);
    }

    #[test]
    fn query_normalization_lowercases_and_strips_noise() {
        assert_eq!(normalize_query("  Hydraulic   PUMP?! (x-ray) "), "hydraulic pump x-ray");
        assert_eq!(normalize_query("it's \"quoted\""), "it's \"quoted\"");
    }

    #[test]
    fn chunk_ids_are_deterministic_per_record() {
        let first = make_chunk_id("doc", ChunkKind::Paragraph, 0, 1, "text");
        let again = make_chunk_id("doc", ChunkKind::Paragraph, 0, 1, "text");
        let other = make_chunk_id("doc", ChunkKind::Table, 0, 1, "text");
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[test]
    fn plain_ids_are_limited_to_name_safe_characters() {
        assert!(is_plain_id("3f2b8c1e-0c4d-4a8e-9d55-1b2f6a7c9e01"));
        assert!(is_plain_id("doc_1"));
        assert!(!is_plain_id(""));
        assert!(!is_plain_id("a.b"));
        assert!(!is_plain_id("a:b"));
        assert!(!is_plain_id(&"x".repeat(200)));
        assert_eq!(id_digest("a.b").len(), 64);
        assert_ne!(id_digest("a.b"), id_digest("a_b"));
    }
}
