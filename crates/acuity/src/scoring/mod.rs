//! Tiered severity scoring over wide feature rows.

mod carry;
mod policy;
mod rules;

pub use carry::CarryForward;
pub use policy::MissingComponentPolicy;
pub use rules::{
    CompiledComponent, CompiledRule, CompiledRuleTable, ComponentRules, Predicate, Rule,
    RuleKind, RuleTable, RuleTableError, BUILTIN_TABLES,
};

use crate::pipeline::domain::{format_timestamp, Window};
use crate::pipeline::extract::FeatureVector;
use crate::pipeline::pivot::{RowStatus, WideRow, WideTable};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreSource {
    Rule,
    /// No rule matched; the component is null.
    Unmatched,
    CarriedForward {
        from: DateTime<Utc>,
    },
    /// First day without data, scored as zero.
    Defaulted,
}

impl ScoreSource {
    fn label(&self) -> String {
        match self {
            ScoreSource::Rule => "rule".to_string(),
            ScoreSource::Unmatched => "unmatched".to_string(),
            ScoreSource::CarriedForward { from } => format!("carried:{}", format_timestamp(*from)),
            ScoreSource::Defaulted => "defaulted".to_string(),
        }
    }
}

/// A component's tier with provenance. `tier == None` is distinct from tier 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentScore {
    pub component: String,
    pub tier: Option<u8>,
    pub contributing_feature: Option<String>,
    pub rule_id: Option<String>,
    pub raw_value: Option<f64>,
    pub context: Option<String>,
    pub source: ScoreSource,
}

impl ComponentScore {
    fn unmatched(component: &str) -> Self {
        Self {
            component: component.to_string(),
            tier: None,
            contributing_feature: None,
            rule_id: None,
            raw_value: None,
            context: None,
            source: ScoreSource::Unmatched,
        }
    }

    fn from_rule(component: &str, rule: &CompiledRule, vector: &FeatureVector) -> Self {
        let feature = rule.contributing_feature(vector);
        let value = feature.and_then(|feature| vector.get(feature));
        Self {
            component: component.to_string(),
            tier: Some(rule.tier),
            contributing_feature: feature.map(String::from),
            rule_id: Some(rule.id.clone()),
            raw_value: value.map(|value| value.value),
            context: value.and_then(|value| value.context.clone()),
            source: ScoreSource::Rule,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreRow {
    pub window: Window,
    pub status: RowStatus,
    pub components: Vec<ComponentScore>,
    pub total: Option<u16>,
}

impl ScoreRow {
    pub fn component(&self, name: &str) -> Option<&ComponentScore> {
        self.components
            .iter()
            .find(|component| component.component == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreTable {
    components: Vec<String>,
    rows: Vec<ScoreRow>,
}

impl ScoreTable {
    pub fn concat(components: Vec<String>, tables: impl IntoIterator<Item = ScoreTable>) -> Self {
        let mut rows = Vec::new();
        for table in tables {
            rows.extend(table.rows);
        }
        Self { components, rows }
    }

    pub fn rows(&self) -> &[ScoreRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ScoreRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes one nullable column per component and the total, optionally followed by
    /// `<component>_rule` and `<component>_source` provenance columns.
    pub fn write_csv<W: Write>(&self, writer: W, provenance: bool) -> Result<(), csv::Error> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = vec![
            "entity_id".to_string(),
            "window_start".to_string(),
            "window_end".to_string(),
            "status".to_string(),
        ];
        header.extend(self.components.iter().cloned());
        header.push("total".to_string());
        if provenance {
            for component in &self.components {
                header.push(format!("{component}_rule"));
                header.push(format!("{component}_source"));
            }
        }
        csv_writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = vec![
                row.window.entity_id.to_string(),
                format_timestamp(row.window.start),
                format_timestamp(row.window.end),
                row.status.to_string(),
            ];
            for component in &self.components {
                record.push(
                    row.component(component)
                        .and_then(|score| score.tier)
                        .map(|tier| tier.to_string())
                        .unwrap_or_default(),
                );
            }
            record.push(row.total.map(|total| total.to_string()).unwrap_or_default());
            if provenance {
                for component in &self.components {
                    let score = row.component(component);
                    record.push(
                        score
                            .and_then(|score| score.rule_id.clone())
                            .unwrap_or_default(),
                    );
                    record.push(score.map(|score| score.source.label()).unwrap_or_default());
                }
            }
            csv_writer.write_record(&record)?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}

pub struct ScoringEngine {
    table: CompiledRuleTable,
    policy: MissingComponentPolicy,
    carry_forward: Option<CarryForward>,
}

impl ScoringEngine {
    pub fn new(table: CompiledRuleTable, policy: MissingComponentPolicy) -> Self {
        Self {
            table,
            policy,
            carry_forward: None,
        }
    }

    pub fn with_carry_forward(mut self, enabled: bool) -> Self {
        self.carry_forward = enabled.then(|| CarryForward::new(self.policy));
        self
    }

    pub fn component_names(&self) -> Vec<String> {
        self.table.component_names()
    }

    pub fn score_row(&self, row: &WideRow) -> ScoreRow {
        if row.status != RowStatus::Complete {
            return ScoreRow {
                window: row.window().clone(),
                status: row.status,
                components: self
                    .table
                    .components()
                    .iter()
                    .map(|component| ComponentScore::unmatched(&component.component))
                    .collect(),
                total: None,
            };
        }

        let components: Vec<ComponentScore> = self
            .table
            .components()
            .iter()
            .map(|component| match component.first_match(&row.vector) {
                Some(rule) => ComponentScore::from_rule(&component.component, rule, &row.vector),
                None => ComponentScore::unmatched(&component.component),
            })
            .collect();
        let total = self
            .policy
            .combine(components.iter().map(|component| component.tier));

        ScoreRow {
            window: row.window().clone(),
            status: row.status,
            components,
            total,
        }
    }

    /// Scores every row; carry-forward, when enabled, runs over the scored rows.
    pub fn score(&self, table: &WideTable) -> ScoreTable {
        let mut rows: Vec<ScoreRow> = table.rows().iter().map(|row| self.score_row(row)).collect();
        if let Some(carry_forward) = &self.carry_forward {
            carry_forward.apply(&mut rows);
        }
        ScoreTable {
            components: self.component_names(),
            rows,
        }
    }
}
