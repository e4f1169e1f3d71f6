//! Keyword-based complexity classification

use serde::{Deserialize, Serialize};

use crate::store::types::sql_enum;

sql_enum! {
    pub enum Complexity {
        Architecture => "architecture",
        High => "high",
        Medium => "medium",
        Simple => "simple",
    }
}

const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture",
    "architect",
    "system design",
    "redesign",
    "re-architect",
    "platform",
    "infrastructure",
    "schema design",
];

const HIGH_KEYWORDS: &[&str] = &[
    "complex",
    "refactor",
    "security",
    "performance",
    "optimize",
    "concurrency",
    "distributed",
    "algorithm",
    "migration",
    "integration",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "typo", "rename", "format", "lint", "comment", "docs", "readme", "bump", "simple", "minor",
    "tweak", "small",
];

const CREATIVE_KEYWORDS: &[&str] = &[
    "creative",
    "brainstorm",
    "story",
    "slogan",
    "tagline",
    "campaign idea",
    "copywriting",
];

/// Lowercased alphanumeric words of a text
pub(crate) fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn mentions(text: &str, keywords: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    let tokens = words(&lowered);
    keywords.iter().any(|k| {
        if k.contains(' ') {
            lowered.contains(k)
        } else {
            tokens.iter().any(|t| t == k)
        }
    })
}

/// Classify a description. An explicit hint always wins.
pub fn classify(description: &str, hint: Option<Complexity>) -> Complexity {
    if let Some(hint) = hint {
        return hint;
    }
    if mentions(description, ARCHITECTURE_KEYWORDS) {
        Complexity::Architecture
    } else if mentions(description, HIGH_KEYWORDS) {
        Complexity::High
    } else if mentions(description, SIMPLE_KEYWORDS) {
        Complexity::Simple
    } else {
        Complexity::Medium
    }
}

pub fn mentions_creativity(description: &str) -> bool {
    mentions(description, CREATIVE_KEYWORDS)
}
