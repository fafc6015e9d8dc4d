//! A scoring run: sources and windows in, wide feature table, score table and report out.

use super::batch::{
    BatchFailure, BatchInput, BatchOptions, BatchOrchestrator, BatchProcessor, CancelFlag,
};
use super::definition::{DefinitionError, PipelineDefinition};
use super::domain::{EntityId, Window};
use super::extract::FeatureExtractor;
use super::pivot::{PivotBuilder, RowStatus, WideTable};
use super::plan::{ExtractionPlan, PlanBuilder};
use super::report::{AbortedEntity, RunReport};
use super::resolver::{Resolver, ResolverBudget};
use super::source::{AdaptedSource, SchemaError, SourceAdapter};
use super::store::FactStore;
use super::windows::{Strictness, WindowCatalog, WindowError};
use crate::scoring::{RuleTable, RuleTableError, ScoreTable, ScoringEngine};
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    RuleTable(#[from] RuleTableError),
    #[error(transparent)]
    Batch(#[from] BatchFailure),
    #[error("pipeline has no source named `{0}`")]
    UnknownSource(String),
}

/// Inputs of one run. Sources must already be adapted.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub sources: Vec<AdaptedSource>,
    pub windows: Vec<Window>,
    /// Entity registry windows are checked against; `None` skips the check.
    pub known_entities: Option<BTreeSet<EntityId>>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub features: WideTable,
    pub scores: ScoreTable,
    pub report: RunReport,
}

pub struct ScoringJob {
    definition: PipelineDefinition,
    plan: Arc<ExtractionPlan>,
    rules: RuleTable,
    engine: Arc<ScoringEngine>,
}

impl ScoringJob {
    /// Builds the plan and compiles the rule table; fails before any data is read.
    pub fn new(definition: PipelineDefinition, rules: RuleTable) -> Result<Self, RunError> {
        let plan = PlanBuilder::new(&definition).build()?;
        let compiled = rules.compile(&plan)?;
        let engine = ScoringEngine::new(compiled, definition.missing_components)
            .with_carry_forward(definition.carry_forward);

        info!(
            pipeline = %definition.name,
            features = plan.steps().len(),
            rule_table = %rules.name,
            components = rules.components.len(),
            "scoring job prepared"
        );

        Ok(Self {
            definition,
            plan: Arc::new(plan),
            rules,
            engine: Arc::new(engine),
        })
    }

    /// Loads the rule table the definition references.
    pub fn from_definition(definition: PipelineDefinition) -> Result<Self, RunError> {
        let rules = RuleTable::load(&definition.rule_table)?;
        Self::new(definition, rules)
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn plan(&self) -> &ExtractionPlan {
        &self.plan
    }

    /// Definition batch settings layered over `defaults`.
    pub fn batch_options(&self, defaults: BatchOptions) -> BatchOptions {
        let batch = &self.definition.batch;
        BatchOptions {
            size: batch.size.unwrap_or(defaults.size),
            workers: batch.workers.unwrap_or(defaults.workers),
            timeout: batch
                .timeout_secs
                .map(Duration::from_secs)
                .or(defaults.timeout),
            strictness: match defaults.strictness {
                Strictness::Strict => Strictness::Strict,
                Strictness::Lenient => self.definition.strictness,
            },
        }
    }

    fn adapter(&self, name: &str) -> Result<SourceAdapter, RunError> {
        let definition = self
            .definition
            .source(name)
            .ok_or_else(|| RunError::UnknownSource(name.to_string()))?;
        Ok(SourceAdapter::new(definition.clone()).restrict_to(&self.plan.required_categories(name)))
    }

    /// Adapts one named source from an in-memory reader.
    pub fn adapt_source<R: Read>(&self, name: &str, reader: R) -> Result<AdaptedSource, RunError> {
        Ok(self.adapter(name)?.read(reader)?)
    }

    /// Reads every source the plan needs from its configured path.
    pub fn load_sources(&self) -> Result<Vec<AdaptedSource>, RunError> {
        let mut sources = Vec::new();
        for source in &self.definition.sources {
            if self.plan.required_categories(&source.name).is_empty() {
                debug!(source = %source.name, "source not needed by any feature");
                continue;
            }
            sources.push(self.adapter(&source.name)?.read_configured()?);
        }
        Ok(sources)
    }

    pub async fn run(
        &self,
        inputs: RunInputs,
        options: BatchOptions,
        cancel: CancelFlag,
    ) -> Result<RunOutput, RunError> {
        let started = Instant::now();
        let (catalog, dropped_windows) = WindowCatalog::ingest(
            inputs.windows,
            inputs.known_entities.as_ref(),
            options.strictness,
        )?;
        let catalog = Arc::new(catalog);
        let entities = catalog.entities();

        let mut stats = Vec::with_capacity(inputs.sources.len());
        let mut facts = Vec::new();
        for source in inputs.sources {
            stats.push(source.stats);
            facts.extend(source.facts);
        }
        let store = Arc::new(FactStore::from_facts(facts));

        info!(
            pipeline = %self.definition.name,
            windows = catalog.len(),
            entities = entities.len(),
            facts = store.fact_count(),
            batch_size = options.size,
            "scoring run started"
        );

        let resolver = Resolver::new(
            self.plan.lookback().clone(),
            ResolverBudget {
                max_facts_per_entity: self.definition.resolver.max_facts_per_entity,
                entity_deadline: self
                    .definition
                    .resolver
                    .entity_deadline_ms
                    .map(Duration::from_millis),
            },
        );
        let processor = Arc::new(BatchContext {
            plan: Arc::clone(&self.plan),
            engine: Arc::clone(&self.engine),
            store,
            catalog: Arc::clone(&catalog),
            resolver,
        });

        let orchestrator = BatchOrchestrator::new(options, cancel);
        let batches = orchestrator.partition(&entities).len();
        let outcome = orchestrator.run(processor, &entities).await?;

        let mut feature_tables = Vec::with_capacity(outcome.outputs.len());
        let mut score_tables = Vec::with_capacity(outcome.outputs.len());
        let mut aborted_entities = Vec::new();
        for output in outcome.outputs {
            feature_tables.push(output.features);
            score_tables.push(output.scores);
            aborted_entities.extend(output.aborted);
        }

        let features = WideTable::concat(&self.plan, feature_tables);
        let scores = ScoreTable::concat(self.engine.component_names(), score_tables);

        let report = RunReport {
            pipeline: self.definition.name.clone(),
            pipeline_version: self.definition.version.clone(),
            rule_table: self.rules.name.clone(),
            rule_table_version: self.rules.version.clone(),
            windows: catalog.len(),
            entities: entities.len(),
            batches,
            sources: stats,
            dropped_windows,
            skipped_batches: outcome.failures,
            cancelled_batches: outcome.cancelled,
            aborted_entities,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        info!(
            pipeline = %report.pipeline,
            rows = features.len(),
            skipped = report.skipped_batches.len(),
            aborted = report.aborted_entities.len(),
            elapsed_ms = report.elapsed_ms,
            "scoring run finished"
        );

        Ok(RunOutput {
            features,
            scores,
            report,
        })
    }
}

#[derive(Debug)]
pub struct BatchOutput {
    pub features: WideTable,
    pub scores: ScoreTable,
    pub aborted: Vec<AbortedEntity>,
}

/// Run-wide read-only state shared by every batch.
struct BatchContext {
    plan: Arc<ExtractionPlan>,
    engine: Arc<ScoringEngine>,
    store: Arc<FactStore>,
    catalog: Arc<WindowCatalog>,
    resolver: Resolver,
}

impl BatchProcessor for BatchContext {
    type Output = BatchOutput;
    type Error = Infallible;

    fn process(&self, batch: &BatchInput) -> Result<Self::Output, Self::Error> {
        let catalog = self.catalog.restrict(&batch.entities);
        let facts = self.store.prefetch(&batch.entities);
        let extractor = FeatureExtractor::new(&self.plan);
        let mut pivot = PivotBuilder::new(&self.plan);
        let mut aborted = Vec::new();

        for entity in &batch.entities {
            let windows = catalog.for_entity(entity);
            let extracted = self.resolver.entity(&facts, entity).and_then(|resolver| {
                windows
                    .iter()
                    .map(|window| extractor.extract(&resolver, window))
                    .collect::<Result<Vec<_>, _>>()
            });

            match extracted {
                Ok(vectors) => vectors.into_iter().for_each(|vector| pivot.insert(vector)),
                Err(error) => {
                    warn!(batch = batch.index, entity = %entity, error = %error, "aborting entity");
                    pivot.abort_entity(entity, RowStatus::ResolverTimeout);
                    aborted.push(AbortedEntity {
                        entity_id: entity.clone(),
                        batch: batch.index,
                        windows: windows.len(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        let features = pivot.build(&catalog);
        let scores = self.engine.score(&features);
        debug!(
            batch = batch.index,
            entities = batch.entities.len(),
            windows = features.len(),
            facts = facts.fact_count(),
            aborted = aborted.len(),
            "batch scored"
        );

        Ok(BatchOutput {
            features,
            scores,
            aborted,
        })
    }

    fn placeholder(&self, batch: &BatchInput, status: RowStatus) -> Self::Output {
        let catalog = self.catalog.restrict(&batch.entities);
        let features = WideTable::placeholder(&catalog, &self.plan, status);
        let scores = self.engine.score(&features);
        BatchOutput {
            features,
            scores,
            aborted: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    const DEFINITION: &str = r#"{
        "name": "coag",
        "sources": [{"name": "labs", "entity_column": "encounter_id", "timestamp_column": "at",
            "layout": {"kind": "long", "category_column": "test", "value_column": "value"},
            "aliases": {"PLT": "platelets"},
            "allowlist": ["platelets", "sodium"]}],
        "features": [
            {"kind": "worst", "name": "platelets", "category": "platelets", "direction": "min"}
        ],
        "rule_table": {"path": "unused.json"},
        "resolver": {"max_facts_per_entity": 3}
    }"#;

    const TABLE: &str = r#"{"name": "coag", "version": "1", "components": [
        {"component": "coagulation", "rules": [
            {"id": "coag_3", "kind": "threshold", "when": {"op": "lt", "feature": "platelets", "value": 50}, "tier": 3},
            {"id": "coag_0", "kind": "threshold", "when": {"op": "ge", "feature": "platelets", "value": 50}, "tier": 0}
        ]}]}"#;

    const LABS: &str = "encounter_id,at,test,value\n\
E1,2024-03-01T01:00:00Z,PLT,80\n\
E1,2024-03-01T10:00:00Z,PLT,40\n\
E1,2024-03-01T11:00:00Z,sodium,140\n\
E2,2024-03-01T02:00:00Z,PLT,1\n\
E2,2024-03-01T03:00:00Z,PLT,2\n\
E2,2024-03-01T04:00:00Z,PLT,3\n\
E2,2024-03-01T05:00:00Z,PLT,4\n";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn job() -> ScoringJob {
        let definition = PipelineDefinition::from_json(DEFINITION).expect("definition parses");
        let rules = RuleTable::from_json(TABLE).expect("table loads");
        ScoringJob::new(definition, rules).expect("job builds")
    }

    #[tokio::test]
    async fn over_budget_entities_are_aborted_without_failing_the_batch() {
        let job = job();
        let labs = job.adapt_source("labs", LABS.as_bytes()).expect("labs adapt");
        assert_eq!(labs.stats.filtered_out, 1);

        let inputs = RunInputs {
            sources: vec![labs],
            windows: vec![
                Window::new("E1", start(), start() + chrono::Duration::hours(24)),
                Window::new("E2", start(), start() + chrono::Duration::hours(24)),
            ],
            known_entities: None,
        };
        let output = job
            .run(inputs, job.batch_options(BatchOptions::default()), CancelFlag::default())
            .await
            .expect("run succeeds");

        assert_eq!(output.features.len(), 2);
        assert_eq!(output.features.rows()[0].status, RowStatus::Complete);
        assert_eq!(output.features.rows()[1].status, RowStatus::ResolverTimeout);
        assert_eq!(output.scores.rows()[0].total, Some(3));
        assert_eq!(output.scores.rows()[1].total, None);
        assert_eq!(output.report.aborted_entities.len(), 1);
        assert_eq!(output.report.aborted_entities[0].entity_id, EntityId::from("E2"));
    }

    #[tokio::test]
    async fn strict_window_errors_fail_before_batches_run() {
        let job = job();
        let inputs = RunInputs {
            sources: Vec::new(),
            windows: vec![Window::new("E1", start() + chrono::Duration::hours(2), start())],
            known_entities: None,
        };
        let options = BatchOptions {
            strictness: Strictness::Strict,
            ..BatchOptions::default()
        };

        let error = job
            .run(inputs, options, CancelFlag::default())
            .await
            .expect_err("strict run fails");
        assert!(matches!(error, RunError::Window(WindowError::Inverted { .. })));
    }

    #[test]
    fn unknown_sources_are_reported() {
        let error = job()
            .adapt_source("vitals", "a,b\n".as_bytes())
            .expect_err("no such source");
        assert!(matches!(error, RunError::UnknownSource(name) if name == "vitals"));
    }

    #[test]
    fn definition_batch_settings_override_defaults() {
        let mut definition = PipelineDefinition::from_json(DEFINITION).expect("definition parses");
        definition.batch.size = Some(7);
        definition.strictness = Strictness::Strict;
        let job = ScoringJob::new(definition, RuleTable::from_json(TABLE).expect("table loads"))
            .expect("job builds");

        let options = job.batch_options(BatchOptions::default());
        assert_eq!(options.size, 7);
        assert_eq!(options.workers, 4);
        assert_eq!(options.strictness, Strictness::Strict);
    }

    #[test]
    fn strict_defaults_cannot_be_relaxed_by_the_definition() {
        let options = job().batch_options(BatchOptions {
            strictness: Strictness::Strict,
            ..BatchOptions::default()
        });
        assert_eq!(options.strictness, Strictness::Strict);
    }
}
