//! # Usage Accounting
//!
//! Per-user daily/monthly consumption counters compared against
//! subscription-tier quotas, plus a points balance. The ledger answers
//! allow/deny questions before work starts (pre-flight) and records actual
//! consumption after work finishes; the underlying store provides the
//! atomic increment primitives that make concurrent recording safe.

pub mod ledger;
pub mod quota;
pub mod store;

pub use ledger::{LedgerError, PointsDecision, UsageDecision, UsageLedger};
pub use quota::{Tier, TierQuotas, UsageCategory, UNLIMITED_MINUTES, UNLIMITED_POINTS};
pub use store::{CategoryCounters, InMemoryUsageStore, StoreError, UsageRecord, UsageStore};
