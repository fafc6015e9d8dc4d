//! Declarative tiered rule tables and their compiled form.

use crate::pipeline::definition::RuleTableRef;
use crate::pipeline::extract::FeatureVector;
use crate::pipeline::plan::ExtractionPlan;
use crate::pipeline::source::{normalize_label, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const SOFA: &str = include_str!("../../rules/sofa.json");
const SOFA2: &str = include_str!("../../rules/sofa2.json");

pub const BUILTIN_TABLES: &[&str] = &["sofa", "sofa2"];

fn default_max_tier() -> u8 {
    4
}

#[derive(Debug, thiserror::Error)]
pub enum RuleTableError {
    #[error("unknown built-in rule table `{0}`")]
    UnknownBuiltin(String),
    #[error("failed to read rule table {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid rule table: {0}")]
    Json(#[source] serde_json::Error),
    #[error("rule id `{0}` is used more than once")]
    DuplicateRule(String),
    #[error("component `{0}` is declared more than once")]
    DuplicateComponent(String),
    #[error("component `{0}` has no rules")]
    EmptyComponent(String),
    #[error("rule `{rule}` assigns tier {tier}, above the table maximum of {max}")]
    TierOutOfRange { rule: String, tier: u8, max: u8 },
    #[error("rule `{0}` reads no feature")]
    NoFeature(String),
    #[error("{components} components at tier {max_tier} overflow the total score")]
    TotalOverflow { components: usize, max_tier: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Evaluated ahead of every threshold rule of the component.
    Override,
    Threshold,
}

/// Comparisons against a null feature are false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Lt { feature: String, value: f64 },
    Le { feature: String, value: f64 },
    Gt { feature: String, value: f64 },
    Ge { feature: String, value: f64 },
    /// `lower <= value < upper`.
    Between {
        feature: String,
        lower: f64,
        upper: f64,
    },
    ContextIn {
        feature: String,
        values: Vec<String>,
    },
    Present { feature: String },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn evaluate(&self, vector: &FeatureVector) -> bool {
        let value = |feature: &str| vector.get(feature).map(|feature| feature.value);
        match self {
            Predicate::Lt { feature, value: bound } => value(feature).is_some_and(|v| v < *bound),
            Predicate::Le { feature, value: bound } => value(feature).is_some_and(|v| v <= *bound),
            Predicate::Gt { feature, value: bound } => value(feature).is_some_and(|v| v > *bound),
            Predicate::Ge { feature, value: bound } => value(feature).is_some_and(|v| v >= *bound),
            Predicate::Between {
                feature,
                lower,
                upper,
            } => value(feature).is_some_and(|v| *lower <= v && v < *upper),
            Predicate::ContextIn { feature, values } => vector
                .get(feature)
                .and_then(|feature| feature.context.as_deref())
                .map(normalize_label)
                .is_some_and(|context| {
                    values
                        .iter()
                        .any(|candidate| normalize_label(candidate) == context)
                }),
            Predicate::Present { feature } => vector.get(feature).is_some(),
            Predicate::All { of } => of.iter().all(|predicate| predicate.evaluate(vector)),
            Predicate::Any { of } => of.iter().any(|predicate| predicate.evaluate(vector)),
            Predicate::Not { predicate } => !predicate.evaluate(vector),
        }
    }

    /// Features read, in first-appearance order.
    pub fn features(&self) -> Vec<&str> {
        let mut features = Vec::new();
        self.collect_features(&mut features);
        features
    }

    fn collect_features<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Lt { feature, .. }
            | Predicate::Le { feature, .. }
            | Predicate::Gt { feature, .. }
            | Predicate::Ge { feature, .. }
            | Predicate::Between { feature, .. }
            | Predicate::ContextIn { feature, .. }
            | Predicate::Present { feature } => {
                if !out.contains(&feature.as_str()) {
                    out.push(feature);
                }
            }
            Predicate::All { of } | Predicate::Any { of } => {
                for predicate in of {
                    predicate.collect_features(out);
                }
            }
            Predicate::Not { predicate } => predicate.collect_features(out),
        }
    }

    /// The feature credited when the predicate holds: the first satisfied branch of an
    /// `any`, otherwise the first feature read.
    fn deciding_feature(&self, vector: &FeatureVector) -> Option<&str> {
        match self {
            Predicate::Any { of } => of
                .iter()
                .find(|predicate| predicate.evaluate(vector))
                .and_then(|predicate| predicate.deciding_feature(vector)),
            Predicate::All { of } => of
                .first()
                .and_then(|predicate| predicate.deciding_feature(vector)),
            _ => self.features().first().copied(),
        }
    }

    /// True when the predicate cannot hold while every feature it reads is null.
    fn null_strict(&self) -> bool {
        match self {
            Predicate::All { of } => of.iter().any(Predicate::null_strict),
            Predicate::Any { of } => of.iter().all(Predicate::null_strict),
            Predicate::Not { .. } => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub kind: RuleKind,
    pub when: Predicate,
    pub tier: u8,
    /// Feature credited in provenance. Ignored for `any` rules, which credit the branch
    /// that matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRules {
    pub component: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    pub name: String,
    pub version: String,
    #[serde(default = "default_max_tier")]
    pub max_tier: u8,
    pub components: Vec<ComponentRules>,
}

impl RuleTable {
    pub fn builtin(name: &str) -> Result<Self, RuleTableError> {
        let raw = match name {
            "sofa" => SOFA,
            "sofa2" => SOFA2,
            other => return Err(RuleTableError::UnknownBuiltin(other.to_string())),
        };
        Self::from_json(raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, RuleTableError> {
        let table: Self = serde_json::from_str(raw).map_err(RuleTableError::Json)?;
        table.validate()?;
        Ok(table)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, RuleTableError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RuleTableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn load(reference: &RuleTableRef) -> Result<Self, RuleTableError> {
        match reference {
            RuleTableRef::Builtin(name) => Self::builtin(name),
            RuleTableRef::File { path } => Self::from_path(path),
        }
    }

    /// Resolves a CLI-style reference: a built-in name or a path.
    pub fn named_or_path(reference: &str) -> Result<Self, RuleTableError> {
        if BUILTIN_TABLES.contains(&reference) {
            Self::builtin(reference)
        } else {
            Self::from_path(reference)
        }
    }

    pub fn validate(&self) -> Result<(), RuleTableError> {
        let ceiling = self
            .components
            .len()
            .checked_mul(usize::from(self.max_tier));
        if !matches!(ceiling, Some(ceiling) if ceiling <= usize::from(u16::MAX)) {
            return Err(RuleTableError::TotalOverflow {
                components: self.components.len(),
                max_tier: self.max_tier,
            });
        }

        let mut rule_ids = BTreeSet::new();
        let mut components = BTreeSet::new();

        for component in &self.components {
            if !components.insert(component.component.as_str()) {
                return Err(RuleTableError::DuplicateComponent(
                    component.component.clone(),
                ));
            }
            if component.rules.is_empty() {
                return Err(RuleTableError::EmptyComponent(component.component.clone()));
            }
            for rule in &component.rules {
                if !rule_ids.insert(rule.id.as_str()) {
                    return Err(RuleTableError::DuplicateRule(rule.id.clone()));
                }
                if rule.tier > self.max_tier {
                    return Err(RuleTableError::TierOutOfRange {
                        rule: rule.id.clone(),
                        tier: rule.tier,
                        max: self.max_tier,
                    });
                }
                if rule.when.features().is_empty() {
                    return Err(RuleTableError::NoFeature(rule.id.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|component| component.component.clone())
            .collect()
    }

    /// Every feature the table reads.
    pub fn features(&self) -> BTreeSet<&str> {
        self.components
            .iter()
            .flat_map(|component| component.rules.iter())
            .flat_map(|rule| rule.when.features())
            .collect()
    }

    /// Reference evaluation: overrides top-down, then thresholds top-down, first match wins.
    pub fn first_match(&self, component: &str, vector: &FeatureVector) -> Option<&Rule> {
        let rules = &self
            .components
            .iter()
            .find(|candidate| candidate.component == component)?
            .rules;
        let overrides = rules.iter().filter(|rule| rule.kind == RuleKind::Override);
        let thresholds = rules.iter().filter(|rule| rule.kind == RuleKind::Threshold);
        overrides
            .chain(thresholds)
            .find(|rule| rule.when.evaluate(vector))
    }

    /// Checks feature references against the plan and hoists overrides.
    pub fn compile(&self, plan: &ExtractionPlan) -> Result<CompiledRuleTable, SchemaError> {
        let mut components = Vec::with_capacity(self.components.len());

        for component in &self.components {
            let mut hoisted: Vec<&Rule> = component
                .rules
                .iter()
                .filter(|rule| rule.kind == RuleKind::Override)
                .collect();
            hoisted.extend(
                component
                    .rules
                    .iter()
                    .filter(|rule| rule.kind == RuleKind::Threshold),
            );

            let mut rules = Vec::with_capacity(hoisted.len());
            for rule in hoisted {
                let reads: Vec<String> = rule.when.features().into_iter().map(String::from).collect();
                let credited = match rule.when {
                    Predicate::Any { .. } => None,
                    _ => rule.feature.clone(),
                };
                if let Some(unknown) = reads
                    .iter()
                    .chain(credited.iter())
                    .find(|feature| !plan.produces(feature))
                {
                    return Err(SchemaError::UnknownFeature {
                        component: component.component.clone(),
                        rule: rule.id.clone(),
                        feature: unknown.clone(),
                    });
                }

                rules.push(CompiledRule {
                    id: rule.id.clone(),
                    tier: rule.tier,
                    feature: credited,
                    null_strict: rule.when.null_strict(),
                    predicate: rule.when.clone(),
                    reads,
                });
            }

            components.push(CompiledComponent {
                component: component.component.clone(),
                rules,
            });
        }

        Ok(CompiledRuleTable {
            name: self.name.clone(),
            version: self.version.clone(),
            components,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub id: String,
    pub tier: u8,
    feature: Option<String>,
    predicate: Predicate,
    reads: Vec<String>,
    null_strict: bool,
}

impl CompiledRule {
    fn matches(&self, vector: &FeatureVector) -> bool {
        if self.null_strict && self.reads.iter().all(|feature| vector.get(feature).is_none()) {
            return false;
        }
        self.predicate.evaluate(vector)
    }

    /// Feature credited for a match on `vector`.
    pub fn contributing_feature(&self, vector: &FeatureVector) -> Option<&str> {
        self.feature
            .as_deref()
            .or_else(|| self.predicate.deciding_feature(vector))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledComponent {
    pub component: String,
    rules: Vec<CompiledRule>,
}

impl CompiledComponent {
    pub fn first_match(&self, vector: &FeatureVector) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| rule.matches(vector))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRuleTable {
    pub name: String,
    pub version: String,
    components: Vec<CompiledComponent>,
}

impl CompiledRuleTable {
    pub fn components(&self) -> &[CompiledComponent] {
        &self.components
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|component| component.component.clone())
            .collect()
    }
}
