//! Pattern and repetition detection

mod detector;
pub mod normalize;

pub use detector::{ActionablePattern, ActionablePatterns, PatternDetector};
pub use normalize::{normalize_intent, pattern_slug, slugify};
