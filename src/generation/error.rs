use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::billing::entitlements::entitlement_for;
use crate::billing::ledger::LedgerError;
use crate::billing::models::Tier;

use super::backend::BackendError;
use super::models::{ErrorBody, TransitionError};
use super::postprocess::PostProcessingError;
use super::retry::RetryError;
use super::store::StoreError;

/// key: generation-errors -> caller-facing taxonomy
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0}")]
    Validation(String),
    #[error("subscriber {0} not found or inactive")]
    SubscriberUnavailable(Uuid),
    #[error("{feature} is not available on the {tier} tier")]
    Subscription {
        feature: String,
        tier: Tier,
        required: Option<Tier>,
    },
    #[error("Monthly quota exceeded")]
    QuotaExceeded {
        tier: Tier,
        remaining: i64,
        reset_date: DateTime<Utc>,
    },
    #[error("generation backend unavailable after {attempts} attempt(s): {source}")]
    BackendTransient { attempts: u32, source: BackendError },
    #[error("generation backend rejected the request: {source}")]
    BackendTerminal { attempt: u32, source: BackendError },
    #[error(transparent)]
    PostProcessing(#[from] PostProcessingError),
    #[error("generation timed out")]
    DeadlineExceeded,
    #[error("generation canceled")]
    Canceled,
    #[error("generation {0} not found")]
    NotFound(Uuid),
    #[error("generation storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("quota ledger failure: {0}")]
    Ledger(#[from] LedgerError),
    #[error("generation state machine violation: {0}")]
    Transition(#[from] TransitionError),
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::Validation(_) => "VALIDATION_ERROR",
            GenerationError::SubscriberUnavailable(_) => "SUBSCRIBER_UNAVAILABLE",
            GenerationError::Subscription { .. } => "SUBSCRIPTION_REQUIRED",
            GenerationError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            GenerationError::BackendTransient { .. } => "BACKEND_UNAVAILABLE",
            GenerationError::BackendTerminal { .. } => "BACKEND_REJECTED",
            GenerationError::PostProcessing(_) => "POST_PROCESSING_FAILED",
            GenerationError::DeadlineExceeded => "GENERATION_TIMEOUT",
            GenerationError::Canceled => "GENERATION_CANCELED",
            GenerationError::NotFound(_) => "NOT_FOUND",
            GenerationError::Store(_)
            | GenerationError::Ledger(_)
            | GenerationError::Transition(_) => "INTERNAL_ERROR",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            GenerationError::Subscription { tier, required, .. } => Some(json!({
                "tier": tier,
                "required_tier": required,
            })),
            GenerationError::QuotaExceeded {
                tier,
                remaining,
                reset_date,
            } => Some(json!({
                "remaining": remaining,
                "reset_date": reset_date,
                "upgrade_hint": upgrade_hint(*tier, *reset_date),
            })),
            GenerationError::BackendTransient { attempts, source } => Some(json!({
                "attempts": attempts,
                "kind": source.kind,
            })),
            GenerationError::BackendTerminal { attempt, source } => Some(json!({
                "attempts": attempt,
                "kind": source.kind,
            })),
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            // Internal failures are logged in full; callers get a generic message.
            GenerationError::Store(_)
            | GenerationError::Ledger(_)
            | GenerationError::Transition(_) => "internal error while processing generation".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
            details: self.details(),
        }
    }
}

impl From<RetryError<BackendError>> for GenerationError {
    fn from(err: RetryError<BackendError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => GenerationError::BackendTransient {
                attempts,
                source: last,
            },
            RetryError::Rejected { attempt, error } => GenerationError::BackendTerminal {
                attempt,
                source: error,
            },
            RetryError::DeadlineExceeded { .. } => GenerationError::DeadlineExceeded,
        }
    }
}

fn upgrade_hint(tier: Tier, reset_date: DateTime<Utc>) -> String {
    match tier.upgrade() {
        Some(next) => format!(
            "Upgrade to {next} for {} credits per month, or wait for the reset on {}",
            entitlement_for(next).monthly_limit,
            reset_date.format("%Y-%m-%d")
        ),
        None => format!("Quota resets on {}", reset_date.format("%Y-%m-%d")),
    }
}
