use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::types::Category;

/// Maps a piece of text to the names of the categories it matches.
pub trait CategorizationService: Send + Sync {
    fn extract_categories(&self, text: &str, vocabulary: &[Category]) -> BTreeSet<String>;
}

/// Treats each category pattern as a case-insensitive regular expression.
/// Patterns that fail to compile never match. Each distinct pattern is compiled
/// once and shared by every thread using the categorizer.
#[derive(Debug, Default)]
pub struct KeywordCategorizer {
    compiled: RwLock<HashMap<String, Option<Regex>>>,
}

impl KeywordCategorizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn matcher(&self, category: &Category) -> Option<Regex> {
        if let Ok(cache) = self.compiled.read() {
            if let Some(hit) = cache.get(&category.pattern) {
                return hit.clone();
            }
        }
        match self.compiled.write() {
            Ok(mut cache) => cache
                .entry(category.pattern.clone())
                .or_insert_with(|| Self::compile(category))
                .clone(),
            // poisoned lock: fall back to an uncached compile
            Err(_) => Self::compile(category),
        }
    }

    fn compile(category: &Category) -> Option<Regex> {
        match RegexBuilder::new(&category.pattern)
            .case_insensitive(true)
            .build()
        {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(category = %category.name, error = %e, "Skipping invalid category pattern");
                None
            }
        }
    }
}

impl CategorizationService for KeywordCategorizer {
    fn extract_categories(&self, text: &str, vocabulary: &[Category]) -> BTreeSet<String> {
        vocabulary
            .iter()
            .filter(|category| !category.pattern.is_empty())
            .filter(|category| self.matcher(category).is_some_and(|re| re.is_match(text)))
            .map(|category| category.name.clone())
            .collect()
    }
}
