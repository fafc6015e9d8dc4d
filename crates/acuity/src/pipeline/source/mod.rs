//! Source table adapter: turns one heterogeneous CSV table into uniform [`Fact`]s.

mod mapping;
mod normalizer;
mod parser;

pub use parser::parse_timestamp;
pub(crate) use normalizer::normalize_label;

use super::definition::{SourceDefinition, SourceLayout};
use super::domain::{Category, EntityId, Fact, FactValue};
use mapping::CategoryMap;
use parser::CheckedTable;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Input that cannot be reasoned about downstream. Fails the run before any batch starts.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("source `{source_table}` is missing required column `{column}`")]
    MissingColumn {
        source_table: String,
        column: String,
    },
    #[error("category `{category}` is declared by both `{first}` and `{second}`")]
    CategoryClash {
        category: String,
        first: String,
        second: String,
    },
    #[error("feature `{feature}` needs category `{category}`, which no source provides")]
    MissingCategory { feature: String, category: String },
    #[error("rule `{rule}` of component `{component}` reads unknown feature `{feature}`")]
    UnknownFeature {
        component: String,
        rule: String,
        feature: String,
    },
    #[error("feature `{0}` is defined more than once")]
    DuplicateFeature(String),
    #[error("feature `{feature}` is invalid: {detail}")]
    InvalidFeature { feature: String, detail: String },
    #[error("category `{category}` is invalid: {detail}")]
    InvalidCategory { category: String, detail: String },
    #[error("source `{0}` has no input table")]
    MissingInput(String),
    #[error("source `{source_table}` could not be read: {source}")]
    Io {
        source_table: String,
        source: std::io::Error,
    },
    #[error("source `{source_table}` is not valid CSV: {source}")]
    Csv {
        source_table: String,
        source: csv::Error,
    },
}

/// Ingestion counters for one source table. Excluded rows are counted, never listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source_table: String,
    pub rows_read: usize,
    pub facts_kept: usize,
    pub filtered_out: usize,
    pub invalid_rows: usize,
}

#[derive(Debug, Clone)]
pub struct AdaptedSource {
    pub facts: Vec<Fact>,
    pub stats: SourceStats,
}

/// Reads one source table, keeping only allowlisted categories.
#[derive(Debug, Clone)]
pub struct SourceAdapter {
    definition: SourceDefinition,
    categories: CategoryMap,
    allowlist: BTreeSet<Category>,
}

impl SourceAdapter {
    pub fn new(definition: SourceDefinition) -> Self {
        let categories = CategoryMap::from_aliases(&definition.aliases);
        let allowlist = definition
            .allowlist
            .iter()
            .map(|name| Category(normalize_label(name)))
            .collect();

        Self {
            definition,
            categories,
            allowlist,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Categories this table declares in the shared namespace.
    pub fn declared(&self) -> &BTreeSet<Category> {
        &self.allowlist
    }

    /// Narrows the allowlist to the categories a run actually needs.
    pub fn restrict_to(mut self, needed: &BTreeSet<Category>) -> Self {
        self.allowlist.retain(|category| needed.contains(category));
        self
    }

    pub fn from_path<P: AsRef<Path>>(&self, path: P) -> Result<AdaptedSource, SchemaError> {
        let file = std::fs::File::open(path).map_err(|source| SchemaError::Io {
            source_table: self.definition.name.clone(),
            source,
        })?;
        self.read(file)
    }

    /// Reads the definition's own path.
    pub fn read_configured(&self) -> Result<AdaptedSource, SchemaError> {
        match &self.definition.path {
            Some(path) => self.from_path(path),
            None => Err(SchemaError::MissingInput(self.definition.name.clone())),
        }
    }

    pub fn read<R: Read>(&self, reader: R) -> Result<AdaptedSource, SchemaError> {
        let source_table = self.definition.name.clone();
        let csv_error = |source: csv::Error| SchemaError::Csv {
            source_table: source_table.clone(),
            source,
        };

        let mut table = CheckedTable::open(reader, self.required_columns())
            .map_err(csv_error)?
            .map_err(|column| SchemaError::MissingColumn {
                source_table: source_table.clone(),
                column,
            })?;

        let layout = self.resolve_layout(&table);
        let entity_idx = table.index_of(&self.definition.entity_column);
        let timestamp_idx = table.index_of(&self.definition.timestamp_column);
        let (Some(entity_idx), Some(timestamp_idx)) = (entity_idx, timestamp_idx) else {
            return Err(SchemaError::MissingColumn {
                source_table: source_table.clone(),
                column: self.definition.entity_column.clone(),
            });
        };

        let mut stats = SourceStats {
            source_table: source_table.clone(),
            ..SourceStats::default()
        };
        let mut facts = Vec::new();

        for record in table.records() {
            let record = record.map_err(csv_error)?;
            stats.rows_read += 1;

            let entity = record.get(entity_idx).map(str::trim).unwrap_or_default();
            let timestamp = record
                .get(timestamp_idx)
                .and_then(parse_timestamp)
                .filter(|_| !entity.is_empty());
            let Some(timestamp) = timestamp else {
                stats.invalid_rows += 1;
                continue;
            };

            let kept_before = facts.len();
            let (mut filtered, mut invalid) = (false, false);
            for (raw_category, raw_value) in layout.cells(&record) {
                let Some(category) = raw_category else {
                    invalid = true;
                    continue;
                };
                if !self.allowlist.contains(&category) {
                    filtered = true;
                    continue;
                }
                let Some(value) = raw_value.and_then(FactValue::parse) else {
                    invalid = true;
                    continue;
                };

                facts.push(Fact {
                    entity_id: EntityId(entity.to_string()),
                    timestamp,
                    category,
                    value,
                    source_table: source_table.clone(),
                });
            }

            // A row counts once, and only when it contributed no fact.
            if facts.len() == kept_before {
                if invalid {
                    stats.invalid_rows += 1;
                } else if filtered {
                    stats.filtered_out += 1;
                }
            }
        }

        stats.facts_kept = facts.len();
        debug!(
            source = %stats.source_table,
            rows = stats.rows_read,
            kept = stats.facts_kept,
            filtered = stats.filtered_out,
            invalid = stats.invalid_rows,
            "source table adapted"
        );

        Ok(AdaptedSource { facts, stats })
    }

    fn required_columns(&self) -> Vec<&str> {
        let mut columns = vec![
            self.definition.entity_column.as_str(),
            self.definition.timestamp_column.as_str(),
        ];
        match &self.definition.layout {
            SourceLayout::Long {
                category_column,
                value_column,
            } => {
                columns.push(category_column);
                columns.push(value_column);
            }
            SourceLayout::Wide { columns: mapped } => {
                columns.extend(mapped.keys().map(String::as_str));
            }
        }
        columns
    }

    fn resolve_layout<R: Read>(&self, table: &CheckedTable<R>) -> ResolvedLayout {
        match &self.definition.layout {
            SourceLayout::Long {
                category_column,
                value_column,
            } => ResolvedLayout::Long {
                category_idx: table.index_of(category_column).unwrap_or_default(),
                value_idx: table.index_of(value_column).unwrap_or_default(),
                categories: self.categories.clone(),
            },
            SourceLayout::Wide { columns } => ResolvedLayout::Wide(
                columns
                    .iter()
                    .filter_map(|(column, category)| {
                        table
                            .index_of(column)
                            .map(|idx| (idx, self.categories.canonical(category)))
                    })
                    .collect(),
            ),
        }
    }
}

/// Column indices resolved against the actual header.
enum ResolvedLayout {
    Long {
        category_idx: usize,
        value_idx: usize,
        categories: CategoryMap,
    },
    Wide(Vec<(usize, Option<Category>)>),
}

impl ResolvedLayout {
    fn cells<'r>(
        &'r self,
        record: &'r csv::StringRecord,
    ) -> Box<dyn Iterator<Item = (Option<Category>, Option<&'r str>)> + 'r> {
        match self {
            ResolvedLayout::Long {
                category_idx,
                value_idx,
                categories,
            } => {
                let category = record
                    .get(*category_idx)
                    .and_then(|raw| categories.canonical(raw));
                Box::new(std::iter::once((category, record.get(*value_idx))))
            }
            ResolvedLayout::Wide(columns) => Box::new(
                columns
                    .iter()
                    .map(move |(idx, category)| (category.clone(), record.get(*idx))),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn labs_definition() -> SourceDefinition {
        let mut aliases = BTreeMap::new();
        aliases.insert("PLT".to_string(), "platelets".to_string());
        SourceDefinition {
            name: "labs".to_string(),
            path: None,
            entity_column: "encounter_id".to_string(),
            timestamp_column: "resulted_at".to_string(),
            layout: SourceLayout::Long {
                category_column: "test".to_string(),
                value_column: "result".to_string(),
            },
            aliases,
            allowlist: vec!["platelets".to_string(), "bilirubin".to_string()],
        }
    }

    fn vitals_definition() -> SourceDefinition {
        let mut columns = BTreeMap::new();
        columns.insert("map".to_string(), "map".to_string());
        columns.insert("gcs_total".to_string(), "gcs".to_string());
        SourceDefinition {
            name: "vitals".to_string(),
            path: None,
            entity_column: "encounter_id".to_string(),
            timestamp_column: "charted_at".to_string(),
            layout: SourceLayout::Wide { columns },
            aliases: BTreeMap::new(),
            allowlist: vec!["map".to_string(), "gcs".to_string()],
        }
    }

    #[test]
    fn long_layout_keeps_allowlisted_categories_only() {
        let csv = "encounter_id,resulted_at,test,result\n\
E1,2024-03-01T01:00:00Z,PLT,80\n\
E1,2024-03-01T02:00:00Z,Sodium,140\n\
E1,2024-03-01T03:00:00Z,Bilirubin,1.4\n";
        let adapted = SourceAdapter::new(labs_definition())
            .read(csv.as_bytes())
            .expect("labs adapt");

        assert_eq!(adapted.facts.len(), 2);
        assert_eq!(adapted.facts[0].category, Category::from("platelets"));
        assert_eq!(adapted.facts[0].value, FactValue::Number(80.0));
        assert_eq!(adapted.facts[0].source_table, "labs");
        assert_eq!(adapted.stats.rows_read, 3);
        assert_eq!(adapted.stats.filtered_out, 1);
    }

    #[test]
    fn restricting_the_allowlist_drops_unneeded_categories() {
        let csv = "encounter_id,resulted_at,test,result\n\
E1,2024-03-01T01:00:00Z,PLT,80\n\
E1,2024-03-01T03:00:00Z,Bilirubin,1.4\n";
        let needed = BTreeSet::from([Category::from("platelets")]);
        let adapted = SourceAdapter::new(labs_definition())
            .restrict_to(&needed)
            .read(csv.as_bytes())
            .expect("labs adapt");

        assert_eq!(adapted.facts.len(), 1);
        assert_eq!(adapted.stats.filtered_out, 1);
    }

    #[test]
    fn wide_layout_emits_one_fact_per_mapped_column() {
        let csv = "encounter_id,charted_at,map,gcs_total,heart_rate\n\
E1,2024-03-01 04:00:00,63,,110\n\
E1,2024-03-01 05:00:00,,,112\n";
        let adapted = SourceAdapter::new(vitals_definition())
            .read(csv.as_bytes())
            .expect("vitals adapt");

        assert_eq!(adapted.facts.len(), 1);
        assert_eq!(adapted.facts[0].category, Category::from("map"));
        assert_eq!(adapted.stats.rows_read, 2);
        assert_eq!(adapted.stats.invalid_rows, 1);
    }

    #[test]
    fn unparseable_rows_are_counted_not_raised() {
        let csv = "encounter_id,resulted_at,test,result\n\
,2024-03-01T01:00:00Z,PLT,80\n\
E1,not-a-time,PLT,80\n\
E1,2024-03-01T01:00:00Z,PLT,\n";
        let adapted = SourceAdapter::new(labs_definition())
            .read(csv.as_bytes())
            .expect("labs adapt");

        assert!(adapted.facts.is_empty());
        assert_eq!(adapted.stats.invalid_rows, 3);
    }

    #[test]
    fn missing_required_column_is_a_schema_error() {
        let csv = "encounter_id,resulted_at,test\nE1,2024-03-01T01:00:00Z,PLT\n";
        let error = SourceAdapter::new(labs_definition())
            .read(csv.as_bytes())
            .expect_err("schema error");

        match error {
            SchemaError::MissingColumn {
                source_table,
                column,
            } => {
                assert_eq!(source_table, "labs");
                assert_eq!(column, "result");
            }
            other => panic!("expected missing column, got {other:?}"),
        }
    }

    #[test]
    fn unconfigured_path_is_reported() {
        let error = SourceAdapter::new(labs_definition())
            .read_configured()
            .expect_err("no path");
        assert!(matches!(error, SchemaError::MissingInput(name) if name == "labs"));
    }
}
