use super::batch::BatchFailure;
use super::domain::EntityId;
use super::source::SourceStats;
use super::windows::DroppedWindow;
use serde::Serialize;
use std::fmt::Write as _;

/// An entity whose rows were nulled because it exceeded the resolver budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbortedEntity {
    pub entity_id: EntityId,
    pub batch: usize,
    pub windows: usize,
    pub reason: String,
}

/// Structured account of a run, returned alongside the possibly partial tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub pipeline_version: String,
    pub rule_table: String,
    pub rule_table_version: String,
    pub windows: usize,
    pub entities: usize,
    pub batches: usize,
    pub sources: Vec<SourceStats>,
    pub dropped_windows: Vec<DroppedWindow>,
    pub skipped_batches: Vec<BatchFailure>,
    pub cancelled_batches: Vec<usize>,
    pub aborted_entities: Vec<AbortedEntity>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        !self.skipped_batches.is_empty()
            || !self.cancelled_batches.is_empty()
            || !self.aborted_entities.is_empty()
    }

    /// Human-readable summary for the command line.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "pipeline {} v{} scored with {} v{}",
            self.pipeline, self.pipeline_version, self.rule_table, self.rule_table_version
        );
        let _ = writeln!(
            out,
            "{} windows across {} entities in {} batches ({} ms)",
            self.windows, self.entities, self.batches, self.elapsed_ms
        );
        for source in &self.sources {
            let _ = writeln!(
                out,
                "  source {}: {} rows, {} facts kept, {} filtered, {} invalid",
                source.source_table,
                source.rows_read,
                source.facts_kept,
                source.filtered_out,
                source.invalid_rows
            );
        }
        if !self.dropped_windows.is_empty() {
            let _ = writeln!(out, "  dropped windows: {}", self.dropped_windows.len());
        }
        for failure in &self.skipped_batches {
            let _ = writeln!(out, "  skipped {failure}");
        }
        if !self.cancelled_batches.is_empty() {
            let _ = writeln!(out, "  cancelled batches: {:?}", self.cancelled_batches);
        }
        for entity in &self.aborted_entities {
            let _ = writeln!(
                out,
                "  aborted entity {} ({} windows): {}",
                entity.entity_id, entity.windows, entity.reason
            );
        }
        out
    }
}
