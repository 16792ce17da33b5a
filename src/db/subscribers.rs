use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, Postgres};
use uuid::Uuid;

use crate::billing::models::{QuotaCounter, Subscriber, Tier};

#[derive(Debug, FromRow)]
struct SubscriberRow {
    id: Uuid,
    external_id: String,
    tier: String,
    monthly_usage: i64,
    quota_reset_date: DateTime<Utc>,
    total_generated: i64,
    active: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriberRow> for Subscriber {
    fn from(row: SubscriberRow) -> Self {
        Subscriber {
            id: row.id,
            external_id: row.external_id,
            tier: Tier::parse(&row.tier),
            monthly_usage: row.monthly_usage,
            quota_reset_date: row.quota_reset_date,
            total_generated: row.total_generated,
            active: row.active,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CounterRow {
    monthly_usage: i64,
    quota_reset_date: DateTime<Utc>,
}

impl From<CounterRow> for QuotaCounter {
    fn from(row: CounterRow) -> Self {
        QuotaCounter {
            monthly_usage: row.monthly_usage,
            quota_reset_date: row.quota_reset_date,
        }
    }
}

// key: quota-db -> subscriber rows
pub async fn fetch_subscriber<'c, E>(executor: E, id: Uuid) -> Result<Option<Subscriber>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as::<_, SubscriberRow>("SELECT * FROM subscribers WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(Subscriber::from))
}

pub async fn fetch_subscriber_by_external_id<'c, E>(
    executor: E,
    external_id: &str,
) -> Result<Option<Subscriber>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as::<_, SubscriberRow>("SELECT * FROM subscribers WHERE external_id = $1")
        .bind(external_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(Subscriber::from))
}

/// Inserts the subscriber unless the external id is already known; returns the stored row.
pub async fn insert_subscriber<'c, E>(
    executor: E,
    subscriber: &Subscriber,
) -> Result<Subscriber, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as::<_, SubscriberRow>(
        r#"
        INSERT INTO subscribers (
            id,
            external_id,
            tier,
            monthly_usage,
            quota_reset_date,
            total_generated,
            active
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (external_id)
        DO UPDATE SET external_id = EXCLUDED.external_id
        RETURNING *
        "#,
    )
    .bind(subscriber.id)
    .bind(&subscriber.external_id)
    .bind(subscriber.tier.as_str())
    .bind(subscriber.monthly_usage)
    .bind(subscriber.quota_reset_date)
    .bind(subscriber.total_generated)
    .bind(subscriber.active)
    .fetch_one(executor)
    .await?;
    Ok(row.into())
}

/// Single conditional update: applies an elapsed reset and the increment together, and only
/// when the resulting usage stays within `limit`. `None` means the ceiling would be crossed
/// (or the subscriber is missing or deleted) and nothing was written.
pub async fn increment_if_below_limit<'c, E>(
    executor: E,
    id: Uuid,
    amount: i64,
    limit: i64,
    now: DateTime<Utc>,
    next_reset: DateTime<Utc>,
) -> Result<Option<QuotaCounter>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as::<_, CounterRow>(
        r#"
        UPDATE subscribers
        SET
            monthly_usage = CASE
                WHEN quota_reset_date <= $4 THEN $2
                ELSE monthly_usage + $2
            END,
            quota_reset_date = CASE
                WHEN quota_reset_date <= $4 THEN $5
                ELSE quota_reset_date
            END,
            updated_at = NOW()
        WHERE id = $1
          AND deleted_at IS NULL
          AND (CASE WHEN quota_reset_date <= $4 THEN 0 ELSE monthly_usage END) + $2 <= $3
        RETURNING monthly_usage, quota_reset_date
        "#,
    )
    .bind(id)
    .bind(amount)
    .bind(limit)
    .bind(now)
    .bind(next_reset)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(QuotaCounter::from))
}

/// Refunds credits into the period they were reserved in. A row whose `quota_reset_date`
/// no longer equals `period` has rolled over and is left alone (`None`).
pub async fn decrement_usage<'c, E>(
    executor: E,
    id: Uuid,
    amount: i64,
    period: DateTime<Utc>,
) -> Result<Option<QuotaCounter>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as::<_, CounterRow>(
        r#"
        UPDATE subscribers
        SET
            monthly_usage = GREATEST(monthly_usage - $2, 0),
            updated_at = NOW()
        WHERE id = $1
          AND quota_reset_date = $3
        RETURNING monthly_usage, quota_reset_date
        "#,
    )
    .bind(id)
    .bind(amount)
    .bind(period)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(QuotaCounter::from))
}

/// Zeroes usage only while the row is still due at `now`. A reservation that already
/// rolled the period forward makes this a no-op (`None`).
pub async fn reset_usage<'c, E>(
    executor: E,
    id: Uuid,
    now: DateTime<Utc>,
    next_reset: DateTime<Utc>,
) -> Result<Option<QuotaCounter>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as::<_, CounterRow>(
        r#"
        UPDATE subscribers
        SET
            monthly_usage = 0,
            quota_reset_date = $3,
            updated_at = NOW()
        WHERE id = $1
          AND deleted_at IS NULL
          AND quota_reset_date <= $2
        RETURNING monthly_usage, quota_reset_date
        "#,
    )
    .bind(id)
    .bind(now)
    .bind(next_reset)
    .fetch_optional(executor)
    .await?;
    Ok(row.map(QuotaCounter::from))
}

pub async fn add_generated<'c, E>(executor: E, id: Uuid, images: i64) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE subscribers SET total_generated = total_generated + $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(images)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn soft_delete<'c, E>(executor: E, id: Uuid) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        "UPDATE subscribers SET deleted_at = NOW(), active = FALSE, updated_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn due_for_reset<'c, E>(executor: E, now: DateTime<Utc>) -> Result<Vec<Uuid>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_scalar(
        "SELECT id FROM subscribers WHERE deleted_at IS NULL AND quota_reset_date <= $1 ORDER BY quota_reset_date",
    )
    .bind(now)
    .fetch_all(executor)
    .await
}
