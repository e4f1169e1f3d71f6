//! Slugs and command intents

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::store::{EntityType, PatternType};

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("word pattern is valid"));

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "please", "pls", "kindly", "can", "could", "would", "you", "me", "my", "our",
    "i", "we", "now", "again", "just", "to", "for", "of", "on", "in", "and", "with", "some",
    "this", "that", "it", "is", "be", "up",
];

/// Words kept in an intent
const MAX_INTENT_WORDS: usize = 4;

const MAX_SLUG_LEN: usize = 120;

/// Lowercase, hyphen-separated form of a text.
///
/// Text with no ASCII letters or digits slugs to a short content hash, so
/// distinct descriptions never collapse onto the same key.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let slug = WORD
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return slug;
        }
        return content_hash(trimmed);
    }
    if slug.len() > MAX_SLUG_LEN {
        slug[..MAX_SLUG_LEN].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("h{}", hex::encode(&digest[..8]))
}

/// Identity of a pattern row
pub fn pattern_slug(pattern_type: PatternType, entity_type: EntityType, description: &str) -> String {
    format!(
        "{}-{}-{}",
        pattern_type.as_str().replace('_', "-"),
        entity_type,
        slugify(description)
    )
}

/// Reduce a free-form command to the words that carry its intent.
///
/// Filler words and bare numbers are dropped and at most four words are
/// kept, so "please deploy staging now" and "deploy staging" share an intent.
pub fn normalize_intent(command: &str) -> String {
    let lowered = command.to_lowercase();
    let words: Vec<&str> = WORD
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|w| !STOPWORDS.contains(w))
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .take(MAX_INTENT_WORDS)
        .collect();

    if words.is_empty() {
        lowered.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        words.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  Fast Reviews, every time! "), "fast-reviews-every-time");
        assert_eq!(slugify(""), "");
        assert!(slugify(&"word ".repeat(100)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn test_non_ascii_text_gets_distinct_slugs() {
        let a = slugify("レビューが速い");
        let b = slugify("デプロイが失敗する");
        assert!(!a.is_empty());
        assert_ne!(a, b);
        assert_eq!(a, slugify("  レビューが速い "));
        assert_ne!(
            pattern_slug(PatternType::Success, EntityType::Agent, "レビューが速い"),
            pattern_slug(PatternType::Success, EntityType::Agent, "デプロイが失敗する"),
        );
    }

    #[test]
    fn test_pattern_slug_includes_type_and_entity() {
        let a = pattern_slug(PatternType::Success, EntityType::Agent, "Fast reviews");
        let b = pattern_slug(PatternType::Failure, EntityType::Agent, "Fast reviews");
        assert_eq!(a, "success-agent-fast-reviews");
        assert_ne!(a, b);
    }

    #[test]
    fn test_normalize_intent() {
        assert_eq!(normalize_intent("Please deploy staging now"), "deploy staging");
        assert_eq!(normalize_intent("deploy   STAGING"), "deploy staging");
        assert_eq!(normalize_intent("rerun job 42 for me"), "rerun job");
        assert_eq!(
            normalize_intent("export weekly sales report to csv file"),
            "export weekly sales report"
        );
        assert_eq!(normalize_intent("the"), "the");
    }
}
