use crate::infra::{deserialize_timestamp, AppState};
use acuity::error::AppError;
use acuity::pipeline::{
    CancelFlag, EntityId, PipelineDefinition, RuleTableRef, RunError, RunInputs, RunReport,
    ScoringJob, WideRow, WindowCatalog,
};
use acuity::scoring::{RuleTable, ScoreRow};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound on `daily.days` for one request.
const MAX_DAILY_DAYS: u32 = 366;

/// Inline scoring request. Sources are keyed by the source names of the pipeline.
#[derive(Debug, Deserialize)]
pub(crate) struct ScoreRequest {
    pub(crate) pipeline: PipelineDefinition,
    /// Replaces the pipeline's rule table reference when present.
    #[serde(default)]
    pub(crate) rules: Option<RuleTable>,
    #[serde(default)]
    pub(crate) sources: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) windows_csv: Option<String>,
    #[serde(default)]
    pub(crate) daily: Option<DailyWindows>,
    #[serde(default)]
    pub(crate) known_entities: Option<BTreeSet<EntityId>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DailyWindows {
    pub(crate) entities: Vec<EntityId>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub(crate) start: DateTime<Utc>,
    pub(crate) days: u32,
}

#[derive(Debug, Serialize)]
pub(crate) struct ScoreResponse {
    pub(crate) report: RunReport,
    pub(crate) features: Vec<WideRow>,
    pub(crate) scores: Vec<ScoreRow>,
}

pub(crate) fn router() -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/score", post(score_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };
    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub(crate) async fn score_endpoint(
    Extension(state): Extension<AppState>,
    Json(payload): Json<ScoreRequest>,
) -> Result<Json<ScoreResponse>, AppError> {
    let ScoreRequest {
        pipeline,
        rules,
        sources,
        windows_csv,
        daily,
        known_entities,
    } = payload;

    let rules = match rules {
        Some(table) => {
            table.validate().map_err(RunError::from)?;
            table
        }
        None => match &pipeline.rule_table {
            RuleTableRef::Builtin(name) => RuleTable::builtin(name).map_err(RunError::from)?,
            RuleTableRef::File { .. } => {
                return Err(AppError::InvalidRequest(
                    "rule table files are not read over HTTP; send the table inline".to_string(),
                ))
            }
        },
    };

    let job = ScoringJob::new(pipeline, rules)?;

    if let Some(missing) = job.definition().sources.iter().find(|source| {
        !sources.contains_key(&source.name)
            && !job.plan().required_categories(&source.name).is_empty()
    }) {
        return Err(AppError::InvalidRequest(format!(
            "source `{}` is required by the pipeline but was not supplied",
            missing.name
        )));
    }

    let mut adapted = Vec::with_capacity(sources.len());
    for (name, table) in &sources {
        adapted.push(job.adapt_source(name, table.as_bytes())?);
    }

    if windows_csv.is_none() && daily.is_none() {
        return Err(AppError::InvalidRequest(
            "supply windows_csv or daily windows".to_string(),
        ));
    }
    let mut windows = match windows_csv {
        Some(raw) => WindowCatalog::read_csv(raw.as_bytes()).map_err(RunError::from)?,
        None => Vec::new(),
    };
    if let Some(daily) = daily {
        if daily.days > MAX_DAILY_DAYS {
            return Err(AppError::InvalidRequest(format!(
                "daily windows are limited to {MAX_DAILY_DAYS} days per request"
            )));
        }
        for entity in &daily.entities {
            windows.extend(
                WindowCatalog::daily(entity, daily.start, daily.days).map_err(RunError::from)?,
            );
        }
    }

    let options = job.batch_options(state.engine.batch_options());
    let output = job
        .run(
            RunInputs {
                sources: adapted,
                windows,
                known_entities,
            },
            options,
            CancelFlag::default(),
        )
        .await?;

    Ok(Json(ScoreResponse {
        report: output.report,
        features: output.features.into_rows(),
        scores: output.scores.into_rows(),
    }))
}
