use super::normalizer::normalize_label;
use crate::pipeline::domain::Category;
use std::collections::{BTreeMap, HashMap};

/// Maps raw source labels onto canonical category names.
#[derive(Debug, Clone, Default)]
pub(crate) struct CategoryMap {
    aliases: HashMap<String, Category>,
}

impl CategoryMap {
    pub(crate) fn from_aliases(aliases: &BTreeMap<String, String>) -> Self {
        let mut map = HashMap::with_capacity(aliases.len());
        for (raw, canonical) in aliases {
            map.insert(
                normalize_label(raw),
                Category(normalize_label(canonical)),
            );
        }
        Self { aliases: map }
    }

    /// Canonical category for a raw label. Unaliased labels map to their normalized form.
    pub(crate) fn canonical(&self, raw: &str) -> Option<Category> {
        let normalized = normalize_label(raw);
        if normalized.is_empty() {
            return None;
        }

        Some(
            self.aliases
                .get(&normalized)
                .cloned()
                .unwrap_or(Category(normalized)),
        )
    }
}
