pub mod api;
pub mod entitlements;
pub mod ledger;
pub mod models;
pub mod scheduler;

pub use api::{get_quota, resolve_subscriber, EntitlementView, QuotaEnvelope};
pub use entitlements::{entitlement_for, minimum_tier, Entitlement};
pub use ledger::{
    next_reset_after, InMemoryQuotaStore, LedgerError, PgQuotaStore, QuotaLedger, QuotaStore,
};
pub use models::{QuotaCounter, QuotaReservation, QuotaSnapshot, Subscriber, Tier};
pub use scheduler::{
    process_tick as run_quota_reset_tick, spawn as spawn_quota_scheduler, TickSummary,
};
