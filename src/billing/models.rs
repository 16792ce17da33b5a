use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// key: billing-tier -> subscription levels
/// Unknown tier strings fail closed to `Free`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Tier {
    #[default]
    Free,
    Plus,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Plus => "plus",
            Tier::Pro => "pro",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "plus" => Tier::Plus,
            "pro" => Tier::Pro,
            _ => Tier::Free,
        }
    }

    pub fn upgrade(&self) -> Option<Tier> {
        match self {
            Tier::Free => Some(Tier::Plus),
            Tier::Plus => Some(Tier::Pro),
            Tier::Pro => None,
        }
    }
}

impl From<String> for Tier {
    fn from(value: String) -> Self {
        Tier::parse(&value)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: billing-subscriber -> quota owner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscriber {
    pub id: Uuid,
    pub external_id: String,
    pub tier: Tier,
    pub monthly_usage: i64,
    pub quota_reset_date: DateTime<Utc>,
    pub total_generated: i64,
    pub active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn new(external_id: impl Into<String>, tier: Tier, quota_reset_date: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            tier,
            monthly_usage: 0,
            quota_reset_date,
            total_generated: 0,
            active: true,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_usable(&self) -> bool {
        self.active && !self.is_deleted()
    }

    /// Usage as of `now`, treating an elapsed reset date as already reset.
    pub fn effective_usage(&self, now: DateTime<Utc>) -> i64 {
        if now >= self.quota_reset_date {
            0
        } else {
            self.monthly_usage.max(0)
        }
    }
}

/// Counter state returned by the storage primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounter {
    pub monthly_usage: i64,
    pub quota_reset_date: DateTime<Utc>,
}

/// key: billing-reservation -> credits held for one request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuotaReservation {
    pub subscriber_id: Uuid,
    pub credits: i64,
    pub usage_after: i64,
    pub limit: i64,
    pub reset_date: DateTime<Utc>,
}

impl QuotaReservation {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.usage_after).max(0)
    }
}

/// key: billing-quota-snapshot -> caller-facing usage view
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuotaSnapshot {
    pub subscriber_id: Uuid,
    pub tier: Tier,
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub reset_date: DateTime<Utc>,
    pub total_generated: i64,
}
