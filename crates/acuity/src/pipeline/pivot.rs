//! Wide feature table: one row per catalog window, left-joined against extracted features.

use super::domain::{format_timestamp, EntityId, Window};
use super::extract::FeatureVector;
use super::plan::ExtractionPlan;
use super::windows::WindowCatalog;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Complete,
    /// The entity exceeded its resolver budget; features are null.
    ResolverTimeout,
    /// The batch was skipped in best-effort mode; features are null.
    BatchFailed,
    /// The run was cancelled before the batch started.
    Cancelled,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Complete => "complete",
            RowStatus::ResolverTimeout => "resolver_timeout",
            RowStatus::BatchFailed => "batch_failed",
            RowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WideRow {
    pub status: RowStatus,
    #[serde(flatten)]
    pub vector: FeatureVector,
}

impl WideRow {
    pub fn window(&self) -> &Window {
        &self.vector.window
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Column {
    feature: String,
    context: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WideTable {
    columns: Vec<Column>,
    rows: Vec<WideRow>,
}

impl WideTable {
    fn with_columns(plan: &ExtractionPlan) -> Self {
        let columns = plan
            .steps()
            .iter()
            .map(|step| Column {
                feature: step.name().to_string(),
                context: step.has_context(),
            })
            .collect();
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// A null row for every window, all carrying `status`.
    pub fn placeholder(catalog: &WindowCatalog, plan: &ExtractionPlan, status: RowStatus) -> Self {
        let mut table = Self::with_columns(plan);
        table.rows = catalog
            .windows()
            .iter()
            .map(|window| WideRow {
                status,
                vector: FeatureVector::empty(window.clone(), plan),
            })
            .collect();
        table
    }

    /// Concatenates tables in iteration order.
    pub fn concat(plan: &ExtractionPlan, tables: impl IntoIterator<Item = WideTable>) -> Self {
        let mut merged = Self::with_columns(plan);
        for table in tables {
            merged.rows.extend(table.rows);
        }
        merged
    }

    pub fn rows(&self) -> &[WideRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<WideRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec![
            "entity_id".to_string(),
            "window_start".to_string(),
            "window_end".to_string(),
            "status".to_string(),
        ];
        for column in &self.columns {
            header.push(column.feature.clone());
            if column.context {
                header.push(format!("{}_context", column.feature));
            }
        }
        header
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(self.header())?;

        for row in &self.rows {
            let window = row.window();
            let mut record = vec![
                window.entity_id.to_string(),
                format_timestamp(window.start),
                format_timestamp(window.end),
                row.status.to_string(),
            ];
            for column in &self.columns {
                let value = row.vector.get(&column.feature);
                record.push(value.map(|v| v.value.to_string()).unwrap_or_default());
                if column.context {
                    record.push(
                        value
                            .and_then(|v| v.context.clone())
                            .unwrap_or_default(),
                    );
                }
            }
            csv_writer.write_record(&record)?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}

/// Collects one batch's extracted vectors and joins them onto its catalog.
pub struct PivotBuilder<'p> {
    plan: &'p ExtractionPlan,
    extracted: HashMap<Window, FeatureVector>,
    aborted: BTreeMap<EntityId, RowStatus>,
}

impl<'p> PivotBuilder<'p> {
    pub fn new(plan: &'p ExtractionPlan) -> Self {
        Self {
            plan,
            extracted: HashMap::new(),
            aborted: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, vector: FeatureVector) {
        self.extracted.insert(vector.window.clone(), vector);
    }

    /// Nulls every row of `entity`, discarding anything already extracted for it.
    pub fn abort_entity(&mut self, entity: &EntityId, status: RowStatus) {
        self.extracted
            .retain(|window, _| &window.entity_id != entity);
        self.aborted.insert(entity.clone(), status);
    }

    /// Left join: every catalog window yields exactly one row.
    pub fn build(mut self, catalog: &WindowCatalog) -> WideTable {
        let mut table = WideTable::with_columns(self.plan);
        table.rows = catalog
            .windows()
            .iter()
            .map(|window| {
                if let Some(status) = self.aborted.get(&window.entity_id) {
                    return WideRow {
                        status: *status,
                        vector: FeatureVector::empty(window.clone(), self.plan),
                    };
                }
                let vector = self
                    .extracted
                    .remove(window)
                    .unwrap_or_else(|| FeatureVector::empty(window.clone(), self.plan));
                WideRow {
                    status: RowStatus::Complete,
                    vector,
                }
            })
            .collect();
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::definition::PipelineDefinition;
    use crate::pipeline::extract::FeatureValue;
    use crate::pipeline::plan::PlanBuilder;
    use crate::pipeline::windows::Strictness;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp")
            + Duration::hours(hour)
    }

    fn plan() -> ExtractionPlan {
        let definition = PipelineDefinition::from_json(
            r#"{
            "name": "pivot",
            "sources": [{"name": "all", "entity_column": "e", "timestamp_column": "t",
                "layout": {"kind": "long", "category_column": "c", "value_column": "v"},
                "allowlist": ["platelets", "map", "vasopressor"]}],
            "features": [
                {"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min"},
                {"kind": "worst", "name": "map", "category": "map", "direction": "min",
                 "context": {"category": "vasopressor", "tolerance_minutes": 60}}
            ],
            "rule_table": "sofa"
        }"#,
        )
        .expect("definition parses");
        PlanBuilder::new(&definition).build().expect("plan builds")
    }

    fn catalog() -> WindowCatalog {
        let windows = vec![
            Window::new("E1", at(0), at(23)),
            Window::new("E1", at(24), at(47)),
            Window::new("E2", at(0), at(23)),
        ];
        WindowCatalog::ingest(windows, None, Strictness::Strict)
            .expect("valid windows")
            .0
    }

    #[test]
    fn every_window_gets_a_row_even_without_features() {
        let plan = plan();
        let catalog = catalog();
        let mut builder = PivotBuilder::new(&plan);
        let mut vector = FeatureVector::empty(catalog.windows()[0].clone(), &plan);
        vector.features.insert(
            "platelets".to_string(),
            Some(FeatureValue {
                value: 40.0,
                observed_at: at(10),
                context: None,
            }),
        );
        builder.insert(vector);

        let table = builder.build(&catalog);
        assert_eq!(table.len(), catalog.len());
        assert_eq!(
            table.rows()[0].vector.get("platelets").map(|v| v.value),
            Some(40.0)
        );
        assert!(table.rows()[1].vector.get("platelets").is_none());
        assert!(table
            .rows()
            .iter()
            .all(|row| row.status == RowStatus::Complete));
    }

    #[test]
    fn aborted_entities_keep_their_rows_with_status() {
        let plan = plan();
        let catalog = catalog();
        let mut builder = PivotBuilder::new(&plan);
        builder.insert(FeatureVector::empty(catalog.windows()[0].clone(), &plan));
        builder.abort_entity(&EntityId::from("E1"), RowStatus::ResolverTimeout);

        let table = builder.build(&catalog);
        let statuses: Vec<_> = table.rows().iter().map(|row| row.status).collect();
        assert_eq!(
            statuses,
            vec![
                RowStatus::ResolverTimeout,
                RowStatus::ResolverTimeout,
                RowStatus::Complete
            ]
        );
    }

    #[test]
    fn csv_output_has_context_columns_and_empty_nulls() {
        let plan = plan();
        let catalog = catalog().restrict(&[EntityId::from("E2")]);
        let mut builder = PivotBuilder::new(&plan);
        let mut vector = FeatureVector::empty(catalog.windows()[0].clone(), &plan);
        vector.features.insert(
            "map".to_string(),
            Some(FeatureValue {
                value: 58.0,
                observed_at: at(5),
                context: Some("dopamine".to_string()),
            }),
        );
        builder.insert(vector);

        let mut out = Vec::new();
        builder
            .build(&catalog)
            .write_csv(&mut out)
            .expect("csv writes");
        let text = String::from_utf8(out).expect("utf8 output");

        assert_eq!(
            text,
            "entity_id,window_start,window_end,status,platelets,map,map_context\n\
E2,2024-03-01T00:00:00Z,2024-03-01T23:00:00Z,complete,,58,dopamine\n"
        );
    }

    #[test]
    fn placeholders_cover_the_whole_catalog() {
        let plan = plan();
        let table = WideTable::placeholder(&catalog(), &plan, RowStatus::BatchFailed);
        assert_eq!(table.len(), 3);
        assert!(table
            .rows()
            .iter()
            .all(|row| row.status == RowStatus::BatchFailed && row.vector.get("map").is_none()));
    }
}
