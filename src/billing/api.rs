use axum::{extract::Extension, Json};
use serde::Serialize;

use crate::error::AppResult;
use crate::extractor::AuthSubscriber;
use crate::generation::models::Quality;

use super::entitlements::{entitlement_for, Entitlement};
use super::ledger::QuotaLedger;
use super::models::{QuotaSnapshot, Subscriber};

/// Maps a token subject onto its subscriber, creating one on first sign-in.
pub async fn resolve_subscriber(
    ledger: &QuotaLedger,
    auth: &AuthSubscriber,
) -> AppResult<Subscriber> {
    Ok(ledger.ensure_subscriber(&auth.subject, auth.tier).await?)
}

/// key: quota-api -> rest endpoints
pub async fn get_quota(
    Extension(ledger): Extension<QuotaLedger>,
    auth: AuthSubscriber,
) -> AppResult<Json<QuotaEnvelope>> {
    let subscriber = resolve_subscriber(&ledger, &auth).await?;
    let quota = ledger.snapshot(subscriber.id).await?;
    Ok(Json(QuotaEnvelope {
        entitlement: EntitlementView::from(entitlement_for(quota.tier)),
        quota,
    }))
}

#[derive(Debug, Serialize)]
pub struct QuotaEnvelope {
    pub quota: QuotaSnapshot,
    pub entitlement: EntitlementView,
}

#[derive(Debug, Serialize)]
pub struct EntitlementView {
    pub monthly_limit: i64,
    pub allowed_qualities: Vec<Quality>,
    pub max_batch_size: u32,
    pub allows_multi_image: bool,
    pub allows_custom_model: bool,
}

impl From<Entitlement> for EntitlementView {
    fn from(entitlement: Entitlement) -> Self {
        Self {
            monthly_limit: entitlement.monthly_limit,
            allowed_qualities: entitlement.allowed_qualities.to_vec(),
            max_batch_size: entitlement.max_batch_size,
            allows_multi_image: entitlement.allows_multi_image,
            allows_custom_model: entitlement.allows_custom_model,
        }
    }
}
