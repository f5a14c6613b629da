//! # Usage Ledger
//!
//! Allow/deny and record operations against per-user usage counters,
//! compared to the caller's subscription-tier quotas.
//!
//! ## Failure Semantics:
//! Store errors on a pre-flight *check* are hard failures: the caller
//! must not start work it could not verify. Store errors while *recording*
//! consumption that already happened are the caller's problem to swallow
//! (log and continue); the ledger just reports them.

use crate::usage::quota::{Tier, TierQuotas, UsageCategory, UNLIMITED_MINUTES, UNLIMITED_POINTS};
use crate::usage::store::{StoreError, UsageStore};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Outcome of a minute-quota check.
#[derive(Debug, Clone, Serialize)]
pub struct UsageDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Minutes left today; `-1` for unlimited tiers
    pub remaining_minutes: f64,
    pub tier: Tier,
    /// When the daily counter next resets (UTC midnight)
    pub reset_time: DateTime<Utc>,
}

/// Outcome of a points check or spend.
#[derive(Debug, Clone, Serialize)]
pub struct PointsDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Points left; `-1` for unlimited tiers
    pub remaining_points: i64,
    pub tier: Tier,
}

#[derive(Debug)]
pub enum LedgerError {
    Store(StoreError),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Store(err) => write!(f, "usage ledger store error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Store(err)
    }
}

/// The ledger itself: a thin policy layer over the atomic store primitives.
pub struct UsageLedger {
    store: Arc<dyn UsageStore>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Can `user_id` consume `requested_minutes` more in `category` today?
    ///
    /// Performs the lazy daily reset at read time, then compares the
    /// request against the tier's remaining daily quota. Unlimited tiers
    /// always allow.
    pub async fn check_usage(
        &self,
        user_id: &str,
        tier: Tier,
        category: UsageCategory,
        requested_minutes: f64,
    ) -> Result<UsageDecision, LedgerError> {
        let today = Utc::now().date_naive();
        let quotas = TierQuotas::for_tier(tier);

        if quotas.is_unlimited(category) {
            return Ok(UsageDecision {
                allowed: true,
                reason: None,
                remaining_minutes: UNLIMITED_MINUTES,
                tier,
                reset_time: next_daily_reset(today),
            });
        }

        let record = self.store.fetch(user_id, today).await?;
        let used = record.counters(category).daily_minutes;
        let remaining = (quotas.daily_minutes(category) - used).max(0.0);
        let allowed = requested_minutes <= remaining;

        Ok(UsageDecision {
            allowed,
            reason: if allowed {
                None
            } else {
                Some(format!(
                    "daily {} quota exhausted ({:.1} of {:.1} minutes used)",
                    category.as_str(),
                    used,
                    quotas.daily_minutes(category)
                ))
            },
            remaining_minutes: remaining,
            tier,
            reset_time: next_daily_reset(today),
        })
    }

    /// Record consumed minutes. Increments daily and lifetime counters
    /// atomically at the store level; never decrements.
    pub async fn record_usage(
        &self,
        user_id: &str,
        category: UsageCategory,
        minutes: f64,
    ) -> Result<(), LedgerError> {
        let today = Utc::now().date_naive();
        let counters = self
            .store
            .add_minutes(user_id, category, minutes, today)
            .await?;
        tracing::debug!(
            user_id = %user_id,
            category = %category.as_str(),
            minutes = minutes,
            daily_total = counters.daily_minutes,
            "recorded usage"
        );
        Ok(())
    }

    /// Can `user_id` afford a points action costing `cost`?
    pub async fn check_points_action(
        &self,
        user_id: &str,
        tier: Tier,
        cost: i64,
    ) -> Result<PointsDecision, LedgerError> {
        let quotas = TierQuotas::for_tier(tier);
        if quotas.monthly_points == UNLIMITED_POINTS {
            return Ok(PointsDecision {
                allowed: true,
                reason: None,
                remaining_points: UNLIMITED_POINTS,
                tier,
            });
        }

        let today = Utc::now().date_naive();
        let record = self.store.fetch(user_id, today).await?;
        let allowed = record.points_balance >= cost;
        Ok(PointsDecision {
            allowed,
            reason: if allowed {
                None
            } else {
                Some(format!(
                    "insufficient points ({} available, {} required)",
                    record.points_balance, cost
                ))
            },
            remaining_points: record.points_balance,
            tier,
        })
    }

    /// Spend points atomically. Unlimited tiers spend nothing and always
    /// succeed; bounded tiers go through the store's check-and-decrement.
    pub async fn spend_points(
        &self,
        user_id: &str,
        tier: Tier,
        cost: i64,
    ) -> Result<PointsDecision, LedgerError> {
        let quotas = TierQuotas::for_tier(tier);
        if quotas.monthly_points == UNLIMITED_POINTS {
            return Ok(PointsDecision {
                allowed: true,
                reason: None,
                remaining_points: UNLIMITED_POINTS,
                tier,
            });
        }

        let spent = self.store.try_spend_points(user_id, cost).await?;
        let today = Utc::now().date_naive();
        let record = self.store.fetch(user_id, today).await?;
        Ok(PointsDecision {
            allowed: spent,
            reason: if spent {
                None
            } else {
                Some(format!(
                    "insufficient points ({} available, {} required)",
                    record.points_balance, cost
                ))
            },
            remaining_points: record.points_balance,
            tier,
        })
    }
}

/// Next UTC midnight after `today`, when daily counters read as zero again.
fn next_daily_reset(today: NaiveDate) -> DateTime<Utc> {
    let tomorrow = today.succ_opt().unwrap_or(today);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::store::{CategoryCounters, InMemoryUsageStore, UsageRecord};
    use async_trait::async_trait;

    fn ledger() -> (Arc<InMemoryUsageStore>, UsageLedger) {
        let store = Arc::new(InMemoryUsageStore::new());
        (store.clone(), UsageLedger::new(store))
    }

    #[tokio::test]
    async fn record_then_check_reflects_the_increment() {
        let (_, ledger) = ledger();
        let before = ledger
            .check_usage("u1", Tier::Free, UsageCategory::RealTimeStreaming, 1.0)
            .await
            .unwrap();
        assert!(before.allowed);

        ledger
            .record_usage("u1", UsageCategory::RealTimeStreaming, 4.0)
            .await
            .unwrap();

        let after = ledger
            .check_usage("u1", Tier::Free, UsageCategory::RealTimeStreaming, 1.0)
            .await
            .unwrap();
        assert_eq!(
            after.remaining_minutes,
            before.remaining_minutes - 4.0
        );
    }

    #[tokio::test]
    async fn exhausted_quota_is_denied_with_details() {
        let (_, ledger) = ledger();
        // Free tier streaming quota is 10 minutes/day
        ledger
            .record_usage("u1", UsageCategory::RealTimeStreaming, 10.0)
            .await
            .unwrap();

        let decision = ledger
            .check_usage("u1", Tier::Free, UsageCategory::RealTimeStreaming, 1.0)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining_minutes, 0.0);
        assert_eq!(decision.tier, Tier::Free);
        assert!(decision.reason.unwrap().contains("quota exhausted"));
        assert!(decision.reset_time > Utc::now());
    }

    #[tokio::test]
    async fn unlimited_tier_always_allows() {
        let (_, ledger) = ledger();
        ledger
            .record_usage("u1", UsageCategory::RealTimeStreaming, 10_000.0)
            .await
            .unwrap();

        let decision = ledger
            .check_usage("u1", Tier::Premium, UsageCategory::RealTimeStreaming, 10_000.0)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining_minutes, UNLIMITED_MINUTES);
    }

    #[tokio::test]
    async fn points_check_and_spend() {
        let (store, ledger) = ledger();
        store.grant_points("u1", 20).await.unwrap();

        let check = ledger
            .check_points_action("u1", Tier::Free, 15)
            .await
            .unwrap();
        assert!(check.allowed);

        let spend = ledger.spend_points("u1", Tier::Free, 15).await.unwrap();
        assert!(spend.allowed);
        assert_eq!(spend.remaining_points, 5);

        let denied = ledger.spend_points("u1", Tier::Free, 15).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_points, 5);
    }

    #[tokio::test]
    async fn premium_points_are_not_decremented() {
        let (store, ledger) = ledger();
        store.grant_points("u1", 5).await.unwrap();
        let spend = ledger.spend_points("u1", Tier::Premium, 999).await.unwrap();
        assert!(spend.allowed);
        assert_eq!(spend.remaining_points, UNLIMITED_POINTS);
    }

    struct BrokenStore;

    #[async_trait]
    impl UsageStore for BrokenStore {
        async fn fetch(
            &self,
            _user_id: &str,
            _today: chrono::NaiveDate,
        ) -> Result<UsageRecord, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn add_minutes(
            &self,
            _user_id: &str,
            _category: UsageCategory,
            _minutes: f64,
            _today: chrono::NaiveDate,
        ) -> Result<CategoryCounters, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn try_spend_points(&self, _user_id: &str, _cost: i64) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn grant_points(&self, _user_id: &str, _amount: i64) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Pre-flight checks must hard-fail when the store is down.
    #[tokio::test]
    async fn store_failure_fails_the_check() {
        let ledger = UsageLedger::new(Arc::new(BrokenStore));
        let result = ledger
            .check_usage("u1", Tier::Free, UsageCategory::RealTimeStreaming, 1.0)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn daily_reset_is_the_next_utc_midnight() {
        let today = chrono::NaiveDate::from_ymd_opt(2026, 8, 23).unwrap();
        let reset = next_daily_reset(today);
        assert_eq!(reset.to_rfc3339(), "2026-08-24T00:00:00+00:00");
    }
}
