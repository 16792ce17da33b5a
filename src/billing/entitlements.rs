use serde::Serialize;

use crate::generation::models::Quality;

use super::models::Tier;

/// key: billing-entitlement-model -> tier capabilities
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Entitlement {
    pub monthly_limit: i64,
    pub allowed_qualities: &'static [Quality],
    pub max_batch_size: u32,
    pub allows_multi_image: bool,
    pub allows_custom_model: bool,
}

impl Entitlement {
    pub fn allows_quality(&self, quality: Quality) -> bool {
        self.allowed_qualities.contains(&quality)
    }
}

const FREE: Entitlement = Entitlement {
    monthly_limit: 10,
    allowed_qualities: &[Quality::Standard],
    max_batch_size: 1,
    allows_multi_image: false,
    allows_custom_model: false,
};

const PLUS: Entitlement = Entitlement {
    monthly_limit: 100,
    allowed_qualities: &[Quality::Standard, Quality::Hd],
    max_batch_size: 4,
    allows_multi_image: true,
    allows_custom_model: false,
};

const PRO: Entitlement = Entitlement {
    monthly_limit: 500,
    allowed_qualities: &[Quality::Standard, Quality::Hd, Quality::Ultra],
    max_batch_size: 8,
    allows_multi_image: true,
    allows_custom_model: true,
};

pub fn entitlement_for(tier: Tier) -> Entitlement {
    match tier {
        Tier::Free => FREE,
        Tier::Plus => PLUS,
        Tier::Pro => PRO,
    }
}

/// Lowest tier whose entitlement satisfies `predicate`, used for upgrade hints.
pub fn minimum_tier(predicate: impl Fn(&Entitlement) -> bool) -> Option<Tier> {
    [Tier::Free, Tier::Plus, Tier::Pro]
        .into_iter()
        .find(|tier| predicate(&entitlement_for(*tier)))
}
