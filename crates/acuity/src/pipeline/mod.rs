//! Windowed feature extraction: source adaptation, point-in-time resolution, wide pivot and
//! batch orchestration.

pub mod batch;
pub mod definition;
pub mod domain;
pub mod extract;
pub mod job;
pub mod pivot;
pub mod plan;
pub mod report;
pub mod resolver;
pub mod source;
pub mod store;
pub mod windows;

pub use batch::{
    BatchFailure, BatchFailureReason, BatchInput, BatchOptions, BatchOrchestrator,
    BatchOutcome, BatchProcessor, CancelFlag,
};
pub use definition::{
    BatchSettings, CategoryDefinition, ContextDefinition, DefinitionError, Direction,
    FeatureDefinition, PipelineDefinition, ResolverSettings, RuleTableRef, SourceDefinition,
    SourceLayout,
};
pub use domain::{format_timestamp, Category, EntityId, Fact, FactValue, Window};
pub use extract::{FeatureExtractor, FeatureValue, FeatureVector};
pub use job::{BatchOutput, RunError, RunInputs, RunOutput, ScoringJob};
pub use pivot::{PivotBuilder, RowStatus, WideRow, WideTable};
pub use plan::{ContextStep, ExtractionPlan, FeatureStep, PlanBuilder, RatioStep, WorstStep};
pub use report::{AbortedEntity, RunReport};
pub use resolver::{
    EntityResolver, LookbackPolicy, ResolvedValueSet, Resolver, ResolverBudget,
    ResolverTimeoutError,
};
pub use source::{parse_timestamp, AdaptedSource, SchemaError, SourceAdapter, SourceStats};
pub use store::{EntityFacts, FactLookup, FactStore, Observation, Series, StoreSlice};
pub use windows::{DroppedWindow, Strictness, WindowCatalog, WindowError};
