use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::billing::ledger::LedgerError;
use crate::generation::GenerationError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("quota ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

/// HTTP status for a generation failure code.
pub fn generation_status(error: &GenerationError) -> StatusCode {
    match error {
        GenerationError::Validation(_) => StatusCode::BAD_REQUEST,
        GenerationError::SubscriberUnavailable(_) | GenerationError::Subscription { .. } => {
            StatusCode::FORBIDDEN
        }
        GenerationError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GenerationError::BackendTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GenerationError::BackendTerminal { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GenerationError::PostProcessing(_) => StatusCode::BAD_GATEWAY,
        GenerationError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        GenerationError::Canceled => StatusCode::CONFLICT,
        GenerationError::NotFound(_) => StatusCode::NOT_FOUND,
        GenerationError::Store(_) | GenerationError::Ledger(_) | GenerationError::Transition(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Maps a result error code back onto a status, for handlers that only hold the result.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
        "SUBSCRIBER_UNAVAILABLE" | "SUBSCRIPTION_REQUIRED" => StatusCode::FORBIDDEN,
        "QUOTA_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
        "BACKEND_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
        "BACKEND_REJECTED" => StatusCode::UNPROCESSABLE_ENTITY,
        "POST_PROCESSING_FAILED" => StatusCode::BAD_GATEWAY,
        "GENERATION_TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        "GENERATION_CANCELED" => StatusCode::CONFLICT,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Generation(error) = &self {
            let status = generation_status(error);
            if status.is_server_error() {
                tracing::error!(?error);
            }
            return (status, Json(error.to_body())).into_response();
        }

        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Ledger(LedgerError::SubscriberNotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Ledger(LedgerError::InvalidAmount(_)) => StatusCode::BAD_REQUEST,
            AppError::Ledger(LedgerError::QuotaExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Db(_) | AppError::Ledger(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
