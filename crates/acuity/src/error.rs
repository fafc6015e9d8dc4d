use crate::config::ConfigError;
use crate::pipeline::RunError;
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Run(RunError),
    Output(csv::Error),
    InvalidRequest(String),
}

impl AppError {
    /// Whether the caller's input caused the failure.
    pub fn is_input_error(&self) -> bool {
        match self {
            AppError::Run(err) => !matches!(err, RunError::Batch(_)),
            AppError::InvalidRequest(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Run(err) => write!(f, "scoring run failed: {}", err),
            AppError::Output(err) => write!(f, "failed to write output: {}", err),
            AppError::InvalidRequest(detail) => write!(f, "invalid request: {}", detail),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Run(err) => Some(err),
            AppError::Output(err) => Some(err),
            AppError::InvalidRequest(_) => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.is_input_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<RunError> for AppError {
    fn from(value: RunError) -> Self {
        Self::Run(value)
    }
}

impl From<csv::Error> for AppError {
    fn from(value: csv::Error) -> Self {
        Self::Output(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{BatchFailure, BatchFailureReason, SchemaError};

    #[test]
    fn schema_errors_are_client_errors() {
        let error = AppError::from(RunError::Schema(SchemaError::DuplicateFeature(
            "platelets".to_string(),
        )));
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn batch_failures_are_server_errors() {
        let error = AppError::from(RunError::Batch(BatchFailure {
            index: 0,
            entities: 3,
            reason: BatchFailureReason::Panicked("boom".to_string()),
        }));
        assert_eq!(
            error.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn invalid_requests_are_client_errors() {
        let error = AppError::InvalidRequest("no windows supplied".to_string());
        assert_eq!(error.to_string(), "invalid request: no windows supplied");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
