//! # Usage Store
//!
//! Durable home of per-user usage records. The store owns the atomicity
//! guarantees: minute increments and point spends are single atomic
//! operations at the store level, never read-modify-write in the caller,
//! so concurrent writers for the same user cannot lose updates.
//!
//! ## Lazy Daily Reset:
//! Counters are reset once per calendar day, driven by comparing
//! `last_reset_date` to the current date at access time; there is no
//! background reset job. Reads apply the reset to the returned view
//! without writing; the first write of a new day persists the reset and
//! stamps `last_reset_date`.

use crate::usage::quota::UsageCategory;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Minute counters for one usage category.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CategoryCounters {
    /// Minutes consumed today (reset daily)
    pub daily_minutes: f64,
    /// Minutes consumed this calendar month (reset monthly)
    pub monthly_minutes: f64,
    /// Minutes consumed over the record's lifetime (never reset)
    pub lifetime_minutes: f64,
}

/// Per-user usage record, one per user id.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub user_id: String,
    pub counters: HashMap<UsageCategory, CategoryCounters>,
    pub points_balance: i64,
    pub last_reset_date: NaiveDate,
}

impl UsageRecord {
    pub fn new(user_id: &str, today: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            counters: HashMap::new(),
            points_balance: 0,
            last_reset_date: today,
        }
    }

    pub fn counters(&self, category: UsageCategory) -> CategoryCounters {
        self.counters.get(&category).copied().unwrap_or_default()
    }

    /// Apply the lazy daily/monthly reset for `today` to this record.
    /// Counters never go negative and are only ever zeroed, not decremented.
    fn apply_reset(&mut self, today: NaiveDate) {
        if self.last_reset_date >= today {
            return;
        }
        let month_changed = self.last_reset_date.year() != today.year()
            || self.last_reset_date.month() != today.month();
        for counters in self.counters.values_mut() {
            counters.daily_minutes = 0.0;
            if month_changed {
                counters.monthly_minutes = 0.0;
            }
        }
        self.last_reset_date = today;
    }
}

/// Errors surfaced by a usage store backend.
#[derive(Debug)]
pub enum StoreError {
    /// Backend unreachable or request failed
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "usage store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Atomic usage primitives consumed by the ledger.
///
/// `today` is passed in by the caller so day boundaries are explicit and
/// testable rather than read from ambient wall-clock inside the store.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Fetch the user's record with the lazy reset for `today` applied to
    /// the returned view. Creates a fresh record for unknown users. Does
    /// not write.
    async fn fetch(&self, user_id: &str, today: NaiveDate) -> Result<UsageRecord, StoreError>;

    /// Atomically add minutes to a category's daily/monthly/lifetime
    /// counters, applying (and persisting) the lazy reset first. Negative
    /// amounts are clamped to zero; counters never decrement. Returns the
    /// updated counters.
    async fn add_minutes(
        &self,
        user_id: &str,
        category: UsageCategory,
        minutes: f64,
        today: NaiveDate,
    ) -> Result<CategoryCounters, StoreError>;

    /// Atomic check-and-decrement of the points balance. Returns `true`
    /// when the spend went through; `false` leaves the balance untouched.
    async fn try_spend_points(&self, user_id: &str, cost: i64) -> Result<bool, StoreError>;

    /// Atomically add points to the balance. Returns the new balance.
    async fn grant_points(&self, user_id: &str, amount: i64) -> Result<i64, StoreError>;
}

/// In-memory usage store. One map-wide mutex serializes all mutations,
/// which is what gives `add_minutes` and `try_spend_points` their atomic
/// increment-and-check semantics.
pub struct InMemoryUsageStore {
    records: Mutex<HashMap<String, UsageRecord>>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn fetch(&self, user_id: &str, today: NaiveDate) -> Result<UsageRecord, StoreError> {
        let records = self.records.lock().unwrap();
        let mut record = records
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UsageRecord::new(user_id, today));
        // Reset the view only; the stored record is untouched until the
        // first write of the day.
        record.apply_reset(today);
        Ok(record)
    }

    async fn add_minutes(
        &self,
        user_id: &str,
        category: UsageCategory,
        minutes: f64,
        today: NaiveDate,
    ) -> Result<CategoryCounters, StoreError> {
        let minutes = minutes.max(0.0);
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UsageRecord::new(user_id, today));
        record.apply_reset(today);

        let counters = record.counters.entry(category).or_default();
        counters.daily_minutes += minutes;
        counters.monthly_minutes += minutes;
        counters.lifetime_minutes += minutes;
        Ok(*counters)
    }

    async fn try_spend_points(&self, user_id: &str, cost: i64) -> Result<bool, StoreError> {
        let cost = cost.max(0);
        let mut records = self.records.lock().unwrap();
        let record = match records.get_mut(user_id) {
            Some(record) => record,
            None => return Ok(false),
        };
        if record.points_balance < cost {
            return Ok(false);
        }
        record.points_balance -= cost;
        Ok(true)
    }

    async fn grant_points(&self, user_id: &str, amount: i64) -> Result<i64, StoreError> {
        let mut records = self.records.lock().unwrap();
        let today = chrono::Utc::now().date_naive();
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UsageRecord::new(user_id, today));
        record.points_balance += amount.max(0);
        Ok(record.points_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn increments_are_visible_to_the_next_read() {
        let store = InMemoryUsageStore::new();
        let today = day(2026, 8, 23);

        store
            .add_minutes("u1", UsageCategory::RealTimeStreaming, 2.5, today)
            .await
            .unwrap();
        let record = store.fetch("u1", today).await.unwrap();
        let counters = record.counters(UsageCategory::RealTimeStreaming);
        assert_eq!(counters.daily_minutes, 2.5);
        assert_eq!(counters.lifetime_minutes, 2.5);
    }

    /// A counter written yesterday reads as zero today before any write,
    /// and the first write of the day stamps `last_reset_date`.
    #[tokio::test]
    async fn lazy_daily_reset() {
        let store = InMemoryUsageStore::new();
        let yesterday = day(2026, 8, 22);
        let today = day(2026, 8, 23);

        store
            .add_minutes("u1", UsageCategory::RealTimeStreaming, 9.0, yesterday)
            .await
            .unwrap();

        // Read-time reset: daily counter is zero, lifetime survives, and
        // the stored record has not been rewritten yet.
        let view = store.fetch("u1", today).await.unwrap();
        let counters = view.counters(UsageCategory::RealTimeStreaming);
        assert_eq!(counters.daily_minutes, 0.0);
        assert_eq!(counters.lifetime_minutes, 9.0);
        assert_eq!(view.last_reset_date, today);

        // First write of the day persists the reset.
        let counters = store
            .add_minutes("u1", UsageCategory::RealTimeStreaming, 1.0, today)
            .await
            .unwrap();
        assert_eq!(counters.daily_minutes, 1.0);
        assert_eq!(counters.lifetime_minutes, 10.0);
        let record = store.fetch("u1", today).await.unwrap();
        assert_eq!(record.last_reset_date, today);
    }

    #[tokio::test]
    async fn monthly_counters_reset_on_month_change() {
        let store = InMemoryUsageStore::new();
        store
            .add_minutes("u1", UsageCategory::Translation, 5.0, day(2026, 7, 31))
            .await
            .unwrap();

        let view = store.fetch("u1", day(2026, 8, 1)).await.unwrap();
        let counters = view.counters(UsageCategory::Translation);
        assert_eq!(counters.daily_minutes, 0.0);
        assert_eq!(counters.monthly_minutes, 0.0);
        assert_eq!(counters.lifetime_minutes, 5.0);
    }

    /// N concurrent increments for the same user add up to exactly N.
    #[tokio::test]
    async fn concurrent_increments_do_not_lose_updates() {
        let store = std::sync::Arc::new(InMemoryUsageStore::new());
        let today = day(2026, 8, 23);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .add_minutes("u1", UsageCategory::RealTimeStreaming, 1.0, today)
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let record = store.fetch("u1", today).await.unwrap();
        let counters = record.counters(UsageCategory::RealTimeStreaming);
        assert_eq!(counters.daily_minutes, 50.0);
    }

    #[tokio::test]
    async fn points_spend_is_check_and_decrement() {
        let store = InMemoryUsageStore::new();
        store.grant_points("u1", 10).await.unwrap();

        assert!(store.try_spend_points("u1", 7).await.unwrap());
        // Insufficient balance: denied, balance untouched
        assert!(!store.try_spend_points("u1", 7).await.unwrap());
        assert!(store.try_spend_points("u1", 3).await.unwrap());
        assert!(!store.try_spend_points("u1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn negative_amounts_never_decrement() {
        let store = InMemoryUsageStore::new();
        let today = day(2026, 8, 23);
        store
            .add_minutes("u1", UsageCategory::LiveRecording, 4.0, today)
            .await
            .unwrap();
        let counters = store
            .add_minutes("u1", UsageCategory::LiveRecording, -2.0, today)
            .await
            .unwrap();
        assert_eq!(counters.daily_minutes, 4.0);
    }
}
