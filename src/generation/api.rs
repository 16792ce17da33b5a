use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::billing::api::resolve_subscriber;
use crate::billing::ledger::QuotaLedger;
use crate::error::{status_for_code, AppError, AppResult};
use crate::extractor::AuthSubscriber;

use super::models::{GenerationRecord, GenerationRequest};
use super::orchestrator::{CancelOutcome, CostPreview, Orchestrator};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// key: generation-api -> rest endpoints
///
/// The generation runs on its own task. Dropping this handler (client went away)
/// cancels it through the drop guard; the record is still settled.
pub async fn create_generation(
    Extension(orchestrator): Extension<Orchestrator>,
    Extension(ledger): Extension<QuotaLedger>,
    auth: AuthSubscriber,
    Json(request): Json<GenerationRequest>,
) -> AppResult<Response> {
    let subscriber = resolve_subscriber(&ledger, &auth).await?;

    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    let worker = orchestrator.clone();
    let result = tokio::spawn(async move {
        worker
            .generate_with_cancel(subscriber.id, request, token)
            .await
    })
    .await
    .map_err(|err| AppError::Message(format!("generation task failed: {err}")))?;
    guard.disarm();

    let status = match result.error_code() {
        None => StatusCode::CREATED,
        Some(code) => status_for_code(code),
    };
    Ok((status, Json(result)).into_response())
}

pub async fn preview_generation(
    Extension(orchestrator): Extension<Orchestrator>,
    Extension(ledger): Extension<QuotaLedger>,
    auth: AuthSubscriber,
    Json(request): Json<GenerationRequest>,
) -> AppResult<Json<CostPreview>> {
    let subscriber = resolve_subscriber(&ledger, &auth).await?;
    let preview = orchestrator.preview_cost(subscriber.id, &request).await?;
    Ok(Json(preview))
}

pub async fn list_generations(
    Extension(orchestrator): Extension<Orchestrator>,
    Extension(ledger): Extension<QuotaLedger>,
    auth: AuthSubscriber,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<GenerationRecord>>> {
    let subscriber = resolve_subscriber(&ledger, &auth).await?;
    let records = orchestrator
        .list_generations(subscriber.id, query.limit, query.offset)
        .await?;
    Ok(Json(records))
}

pub async fn get_generation(
    Extension(orchestrator): Extension<Orchestrator>,
    Extension(ledger): Extension<QuotaLedger>,
    auth: AuthSubscriber,
    Path(generation_id): Path<Uuid>,
) -> AppResult<Json<GenerationRecord>> {
    let subscriber = resolve_subscriber(&ledger, &auth).await?;
    let record = orchestrator
        .get_generation(subscriber.id, generation_id)
        .await?;
    Ok(Json(record))
}

pub async fn cancel_generation(
    Extension(orchestrator): Extension<Orchestrator>,
    Extension(ledger): Extension<QuotaLedger>,
    auth: AuthSubscriber,
    Path(generation_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<CancelOutcome>)> {
    let subscriber = resolve_subscriber(&ledger, &auth).await?;
    let outcome = orchestrator.cancel(subscriber.id, generation_id).await?;
    let status = match outcome {
        CancelOutcome::Signalled => StatusCode::ACCEPTED,
        CancelOutcome::RunningElsewhere => StatusCode::CONFLICT,
        CancelOutcome::Canceled | CancelOutcome::AlreadyFinished(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}
