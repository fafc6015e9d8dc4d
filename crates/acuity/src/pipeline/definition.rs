//! Serde model of a pipeline definition file.
//!
//! A definition is plain data: which source tables to read, which categories they provide,
//! which features to extract and which rule table to score them with. It is turned into a
//! typed [`ExtractionPlan`](super::plan::ExtractionPlan) by the plan builder, which is where
//! validation happens.

use crate::scoring::MissingComponentPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::windows::Strictness;

const DEFAULT_ALIGNMENT_MINUTES: i64 = 240;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub sources: Vec<SourceDefinition>,
    #[serde(default)]
    pub categories: Vec<CategoryDefinition>,
    pub features: Vec<FeatureDefinition>,
    pub rule_table: RuleTableRef,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub missing_components: MissingComponentPolicy,
    #[serde(default)]
    pub carry_forward: bool,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    pub fn from_json(raw: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(raw).map_err(DefinitionError::Json)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Resolves relative source and rule-table paths against `base`.
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        for source in &mut self.sources {
            if let Some(path) = source.path.take() {
                source.path = Some(join_relative(base, path));
            }
        }
        if let RuleTableRef::File { path } = &mut self.rule_table {
            *path = join_relative(base, std::mem::take(path));
        }
        self
    }

    pub fn source(&self, name: &str) -> Option<&SourceDefinition> {
        self.sources.iter().find(|source| source.name == name)
    }
}

fn join_relative(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub entity_column: String,
    pub timestamp_column: String,
    pub layout: SourceLayout,
    /// Raw label → canonical category.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Canonical categories this table is allowed to contribute.
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceLayout {
    /// One row per measurement, the category named in a column.
    Long {
        category_column: String,
        value_column: String,
    },
    /// Several measurements per row; each value column maps to one category.
    Wide { columns: BTreeMap<String, String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub name: String,
    /// Maximum age of a pre-window fact usable as fallback. `None` disables fallback.
    #[serde(default)]
    pub lookback_minutes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDefinition {
    pub category: String,
    pub tolerance_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureDefinition {
    Worst {
        name: String,
        category: String,
        direction: Direction,
        /// Ordered labels for categorical signals, least severe first.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        levels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextDefinition>,
    },
    Ratio {
        name: String,
        numerator: String,
        denominator: String,
        direction: Direction,
        #[serde(default = "default_alignment_minutes")]
        alignment_minutes: i64,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextDefinition>,
    },
}

impl FeatureDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::Worst { name, .. } | Self::Ratio { name, .. } => name,
        }
    }
}

fn default_alignment_minutes() -> i64 {
    DEFAULT_ALIGNMENT_MINUTES
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleTableRef {
    Builtin(String),
    File { path: PathBuf },
}

/// Batch knobs; unset values fall back to the application defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverSettings {
    #[serde(default)]
    pub max_facts_per_entity: Option<usize>,
    #[serde(default)]
    pub entity_deadline_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read pipeline definition {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid pipeline definition: {0}")]
    Json(#[source] serde_json::Error),
}
