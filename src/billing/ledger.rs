use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::subscribers as db;

use super::entitlements::entitlement_for;
use super::models::{QuotaCounter, QuotaReservation, QuotaSnapshot, Subscriber, Tier};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("credits must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("subscriber {0} not found")]
    SubscriberNotFound(Uuid),
    #[error("Monthly quota exceeded")]
    QuotaExceeded {
        remaining: i64,
        reset_date: DateTime<Utc>,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// key: quota-store -> storage primitives behind the ledger
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn subscriber(&self, id: Uuid) -> sqlx::Result<Option<Subscriber>>;
    async fn subscriber_by_external_id(&self, external_id: &str)
        -> sqlx::Result<Option<Subscriber>>;
    async fn insert_subscriber(&self, subscriber: &Subscriber) -> sqlx::Result<Subscriber>;
    /// Must be one atomic conditional update: an elapsed `quota_reset_date` is rolled to
    /// `next_reset` with usage zeroed, then `amount` is added only if the total stays
    /// within `limit`.
    async fn increment_if_below_limit(
        &self,
        id: Uuid,
        amount: i64,
        limit: i64,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>>;
    /// Lowers usage only while the stored `quota_reset_date` still equals `period`.
    async fn decrement(
        &self,
        id: Uuid,
        amount: i64,
        period: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>>;
    /// Zeroes usage only while the subscriber is live and `quota_reset_date <= now`.
    async fn reset(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>>;
    async fn add_generated(&self, id: Uuid, images: i64) -> sqlx::Result<bool>;
    async fn soft_delete(&self, id: Uuid) -> sqlx::Result<bool>;
    async fn due_for_reset(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Uuid>>;
}

#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn subscriber(&self, id: Uuid) -> sqlx::Result<Option<Subscriber>> {
        db::fetch_subscriber(&self.pool, id).await
    }

    async fn subscriber_by_external_id(
        &self,
        external_id: &str,
    ) -> sqlx::Result<Option<Subscriber>> {
        db::fetch_subscriber_by_external_id(&self.pool, external_id).await
    }

    async fn insert_subscriber(&self, subscriber: &Subscriber) -> sqlx::Result<Subscriber> {
        db::insert_subscriber(&self.pool, subscriber).await
    }

    async fn increment_if_below_limit(
        &self,
        id: Uuid,
        amount: i64,
        limit: i64,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>> {
        db::increment_if_below_limit(&self.pool, id, amount, limit, now, next_reset).await
    }

    async fn decrement(
        &self,
        id: Uuid,
        amount: i64,
        period: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>> {
        db::decrement_usage(&self.pool, id, amount, period).await
    }

    async fn reset(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>> {
        db::reset_usage(&self.pool, id, now, next_reset).await
    }

    async fn add_generated(&self, id: Uuid, images: i64) -> sqlx::Result<bool> {
        db::add_generated(&self.pool, id, images).await
    }

    async fn soft_delete(&self, id: Uuid) -> sqlx::Result<bool> {
        db::soft_delete(&self.pool, id).await
    }

    async fn due_for_reset(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Uuid>> {
        db::due_for_reset(&self.pool, now).await
    }
}

/// key: quota-store-memory -> process-local ledger backing
/// Each subscriber entry is mutated under its dashmap shard lock, which gives the
/// conditional increment the same all-or-nothing behaviour as the SQL update.
/// `external_ids` is the unique index; first sign-in claims its entry before the row is
/// visible by subject.
#[derive(Clone, Default)]
pub struct InMemoryQuotaStore {
    subscribers: Arc<DashMap<Uuid, Subscriber>>,
    external_ids: Arc<DashMap<String, Uuid>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a subscriber as-is, bypassing first-sign-in defaults.
    pub fn put(&self, subscriber: Subscriber) {
        self.external_ids
            .insert(subscriber.external_id.clone(), subscriber.id);
        self.subscribers.insert(subscriber.id, subscriber);
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn subscriber(&self, id: Uuid) -> sqlx::Result<Option<Subscriber>> {
        Ok(self.subscribers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn subscriber_by_external_id(
        &self,
        external_id: &str,
    ) -> sqlx::Result<Option<Subscriber>> {
        let Some(id) = self.external_ids.get(external_id).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self.subscribers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn insert_subscriber(&self, subscriber: &Subscriber) -> sqlx::Result<Subscriber> {
        let existing = match self.external_ids.entry(subscriber.external_id.clone()) {
            Entry::Occupied(slot) => *slot.get(),
            Entry::Vacant(slot) => {
                self.subscribers.insert(subscriber.id, subscriber.clone());
                slot.insert(subscriber.id);
                return Ok(subscriber.clone());
            }
        };
        self.subscribers
            .get(&existing)
            .map(|entry| entry.value().clone())
            .ok_or(sqlx::Error::RowNotFound)
    }

    async fn increment_if_below_limit(
        &self,
        id: Uuid,
        amount: i64,
        limit: i64,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>> {
        let Some(mut entry) = self.subscribers.get_mut(&id) else {
            return Ok(None);
        };
        if entry.is_deleted() {
            return Ok(None);
        }
        let elapsed = now >= entry.quota_reset_date;
        let current = if elapsed { 0 } else { entry.monthly_usage };
        if current + amount > limit {
            return Ok(None);
        }
        if elapsed {
            entry.quota_reset_date = next_reset;
        }
        entry.monthly_usage = current + amount;
        entry.updated_at = Utc::now();
        Ok(Some(QuotaCounter {
            monthly_usage: entry.monthly_usage,
            quota_reset_date: entry.quota_reset_date,
        }))
    }

    async fn decrement(
        &self,
        id: Uuid,
        amount: i64,
        period: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>> {
        let Some(mut entry) = self.subscribers.get_mut(&id) else {
            return Ok(None);
        };
        if entry.quota_reset_date != period {
            return Ok(None);
        }
        entry.monthly_usage = (entry.monthly_usage - amount).max(0);
        entry.updated_at = Utc::now();
        Ok(Some(QuotaCounter {
            monthly_usage: entry.monthly_usage,
            quota_reset_date: entry.quota_reset_date,
        }))
    }

    async fn reset(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> sqlx::Result<Option<QuotaCounter>> {
        let Some(mut entry) = self.subscribers.get_mut(&id) else {
            return Ok(None);
        };
        if entry.is_deleted() || entry.quota_reset_date > now {
            return Ok(None);
        }
        entry.monthly_usage = 0;
        entry.quota_reset_date = next_reset;
        entry.updated_at = Utc::now();
        Ok(Some(QuotaCounter {
            monthly_usage: 0,
            quota_reset_date: next_reset,
        }))
    }

    async fn add_generated(&self, id: Uuid, images: i64) -> sqlx::Result<bool> {
        Ok(self
            .subscribers
            .get_mut(&id)
            .map(|mut entry| {
                entry.total_generated += images;
                entry.updated_at = Utc::now();
            })
            .is_some())
    }

    async fn soft_delete(&self, id: Uuid) -> sqlx::Result<bool> {
        Ok(self
            .subscribers
            .get_mut(&id)
            .filter(|entry| !entry.is_deleted())
            .map(|mut entry| {
                let now = Utc::now();
                entry.deleted_at = Some(now);
                entry.active = false;
                entry.updated_at = now;
            })
            .is_some())
    }

    async fn due_for_reset(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Uuid>> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .subscribers
            .iter()
            .filter(|entry| !entry.is_deleted() && entry.quota_reset_date <= now)
            .map(|entry| (entry.quota_reset_date, entry.id))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }
}

/// First instant of the calendar month after `now`, in UTC.
pub fn next_reset_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let month_start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    month_start
        .checked_add_months(Months::new(1))
        .unwrap_or(month_start + Duration::days(31))
}

/// key: quota-ledger -> monthly credit accounting
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self::new(Arc::new(PgQuotaStore::new(pool)))
    }

    pub async fn subscriber(&self, subscriber_id: Uuid) -> Result<Option<Subscriber>, LedgerError> {
        Ok(self
            .store
            .subscriber(subscriber_id)
            .await?
            .filter(|subscriber| !subscriber.is_deleted()))
    }

    /// Returns the subscriber for an identity subject, creating it on first sign-in.
    /// The tier only applies to newly created subscribers.
    pub async fn ensure_subscriber(
        &self,
        external_id: &str,
        tier: Tier,
    ) -> Result<Subscriber, LedgerError> {
        if let Some(existing) = self.store.subscriber_by_external_id(external_id).await? {
            return Ok(existing);
        }
        let subscriber = Subscriber::new(external_id, tier, next_reset_after(Utc::now()));
        let stored = self.store.insert_subscriber(&subscriber).await?;
        if stored.id == subscriber.id {
            info!(subscriber = %stored.id, tier = %stored.tier, "subscriber created on first sign-in");
        }
        Ok(stored)
    }

    pub async fn check_and_reserve(
        &self,
        subscriber_id: Uuid,
        credits: i64,
    ) -> Result<QuotaReservation, LedgerError> {
        if credits <= 0 {
            return Err(LedgerError::InvalidAmount(credits));
        }
        let subscriber = self
            .subscriber(subscriber_id)
            .await?
            .ok_or(LedgerError::SubscriberNotFound(subscriber_id))?;
        let limit = entitlement_for(subscriber.tier).monthly_limit;
        let now = Utc::now();

        let reserved = self
            .store
            .increment_if_below_limit(subscriber_id, credits, limit, now, next_reset_after(now))
            .await?;

        match reserved {
            Some(counter) => {
                debug!(
                    %subscriber_id,
                    credits,
                    used = counter.monthly_usage,
                    limit,
                    "quota reserved"
                );
                Ok(QuotaReservation {
                    subscriber_id,
                    credits,
                    usage_after: counter.monthly_usage,
                    limit,
                    reset_date: counter.quota_reset_date,
                })
            }
            None => {
                let current = self
                    .subscriber(subscriber_id)
                    .await?
                    .ok_or(LedgerError::SubscriberNotFound(subscriber_id))?;
                let used = current.effective_usage(now);
                let reset_date = if now >= current.quota_reset_date {
                    next_reset_after(now)
                } else {
                    current.quota_reset_date
                };
                info!(
                    %subscriber_id,
                    credits,
                    used,
                    limit,
                    "quota reservation refused"
                );
                Err(LedgerError::QuotaExceeded {
                    remaining: (limit - used).max(0),
                    reset_date,
                })
            }
        }
    }

    /// Compensates a reservation made in `period` (the reservation's `reset_date`).
    /// Returns `false` without touching the counter once that period has rolled over,
    /// since the credits were never charged against the current one.
    pub async fn release(
        &self,
        subscriber_id: Uuid,
        credits: i64,
        period: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        if credits <= 0 {
            return Err(LedgerError::InvalidAmount(credits));
        }
        match self.store.decrement(subscriber_id, credits, period).await? {
            Some(counter) => {
                debug!(
                    %subscriber_id,
                    credits,
                    used = counter.monthly_usage,
                    "quota released"
                );
                Ok(true)
            }
            None => {
                if self.store.subscriber(subscriber_id).await?.is_none() {
                    return Err(LedgerError::SubscriberNotFound(subscriber_id));
                }
                debug!(
                    %subscriber_id,
                    credits,
                    %period,
                    "quota period rolled over; nothing to release"
                );
                Ok(false)
            }
        }
    }

    /// Starts a new period for a subscriber whose reset date has passed at `now`.
    /// `None` means the subscriber was not due (a reservation may already have rolled
    /// the period) or no longer exists.
    pub async fn reset_monthly(
        &self,
        subscriber_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaCounter>, LedgerError> {
        Ok(self
            .store
            .reset(subscriber_id, now, next_reset_after(now))
            .await?)
    }

    pub async fn record_generated(&self, subscriber_id: Uuid, images: i64) -> Result<(), LedgerError> {
        if images <= 0 {
            return Ok(());
        }
        if !self.store.add_generated(subscriber_id, images).await? {
            warn!(%subscriber_id, images, "lifetime counter update matched no subscriber");
            return Err(LedgerError::SubscriberNotFound(subscriber_id));
        }
        Ok(())
    }

    pub async fn soft_delete(&self, subscriber_id: Uuid) -> Result<bool, LedgerError> {
        Ok(self.store.soft_delete(subscriber_id).await?)
    }

    pub async fn due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, LedgerError> {
        Ok(self.store.due_for_reset(now).await?)
    }

    pub async fn snapshot(&self, subscriber_id: Uuid) -> Result<QuotaSnapshot, LedgerError> {
        let subscriber = self
            .subscriber(subscriber_id)
            .await?
            .ok_or(LedgerError::SubscriberNotFound(subscriber_id))?;
        let now = Utc::now();
        let limit = entitlement_for(subscriber.tier).monthly_limit;
        let used = subscriber.effective_usage(now);
        let reset_date = if now >= subscriber.quota_reset_date {
            next_reset_after(now)
        } else {
            subscriber.quota_reset_date
        };
        Ok(QuotaSnapshot {
            subscriber_id,
            tier: subscriber.tier,
            used,
            limit,
            remaining: (limit - used).max(0),
            reset_date,
            total_generated: subscriber.total_generated,
        })
    }
}
