//! Tokenization and keyword preparation.
//!
//! Fulltext values and search keywords go through the same pipeline:
//!
//! 1. Unicode NFD decomposition with combining marks removed (`é` → `e`).
//! 2. Lowercasing.
//! 3. Word segmentation on UAX #29 word boundaries.
//! 4. Truncation of each word to [`MAX_WORD_LENGTH`] characters.
//!
//! Stored words carry a score: occurrence count multiplied by the field's
//! boost. Keywords shorter than the server's minimum length are dropped from
//! the query and reported as ignored.

use std::collections::BTreeMap;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

use crate::query::{Conjunction, Keys};

/// Longest word stored in a token table.
pub const MAX_WORD_LENGTH: usize = 50;

/// Case- and diacritic-fold a string.
pub fn normalize(input: &str) -> String {
    input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Split text into normalized words.
pub fn tokenize(input: &str) -> Vec<String> {
    normalize(input)
        .unicode_words()
        .map(|w| w.chars().take(MAX_WORD_LENGTH).collect())
        .collect()
}

/// Word → score map for one fulltext value set.
pub fn word_scores<'a>(texts: impl IntoIterator<Item = &'a str>, boost: f64) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();
    for text in texts {
        for word in tokenize(text) {
            *scores.entry(word).or_insert(0.0) += boost;
        }
    }
    scores
}

/// Keywords after tokenization and minimum-length filtering.
#[derive(Debug, Clone, Default)]
pub struct PreparedKeys {
    /// `None` when no usable keyword survived.
    pub keys: Option<Keys>,
    /// Words dropped for being shorter than the minimum length.
    pub ignored: Vec<String>,
}

/// Tokenize every keyword of `keys` and drop words shorter than `min_chars`.
///
/// A keyword that splits into several words becomes an AND group of those
/// words. Groups left without children are removed; a non-negated group with
/// a single child collapses into that child.
pub fn prepare_keys(keys: &Keys, min_chars: usize) -> PreparedKeys {
    let mut ignored = Vec::new();
    let keys = prepare_node(keys, min_chars, &mut ignored);
    PreparedKeys { keys, ignored }
}

fn prepare_node(keys: &Keys, min_chars: usize, ignored: &mut Vec<String>) -> Option<Keys> {
    match keys {
        Keys::Keyword(raw) => {
            let mut kept = Vec::new();
            for word in tokenize(raw) {
                if word.chars().count() < min_chars {
                    if !ignored.contains(&word) {
                        ignored.push(word);
                    }
                } else if !kept.contains(&word) {
                    kept.push(word);
                }
            }
            match kept.len() {
                0 => None,
                1 => kept.pop().map(Keys::Keyword),
                _ => Some(Keys::Group {
                    conjunction: Conjunction::And,
                    negation: false,
                    children: kept.into_iter().map(Keys::Keyword).collect(),
                }),
            }
        }
        Keys::Group {
            conjunction,
            negation,
            children,
        } => {
            let mut prepared: Vec<Keys> = children
                .iter()
                .filter_map(|c| prepare_node(c, min_chars, ignored))
                .collect();
            if prepared.is_empty() {
                return None;
            }
            if prepared.len() == 1 && !negation {
                return prepared.pop();
            }
            Some(Keys::Group {
                conjunction: *conjunction,
                negation: *negation,
                children: prepared,
            })
        }
    }
}
