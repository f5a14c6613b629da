//! # Subscription Tiers and Quota Tables
//!
//! Named subscription levels and the per-category quota each grants.
//! Unlimited quotas use a `-1` sentinel so the same comparison code covers
//! bounded and unbounded tiers.

use serde::{Deserialize, Serialize};

/// Sentinel for an unlimited minute quota.
pub const UNLIMITED_MINUTES: f64 = -1.0;

/// Sentinel for an unlimited points grant.
pub const UNLIMITED_POINTS: i64 = -1;

/// Named subscription level bounding usage quotas and feature access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
        }
    }
}

/// Independently tracked usage dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageCategory {
    LiveRecording,
    FileUpload,
    RealTimeStreaming,
    Translation,
}

impl UsageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageCategory::LiveRecording => "live_recording",
            UsageCategory::FileUpload => "file_upload",
            UsageCategory::RealTimeStreaming => "real_time_streaming",
            UsageCategory::Translation => "translation",
        }
    }

    pub const ALL: [UsageCategory; 4] = [
        UsageCategory::LiveRecording,
        UsageCategory::FileUpload,
        UsageCategory::RealTimeStreaming,
        UsageCategory::Translation,
    ];
}

/// Daily minute quotas and monthly points grant for one tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierQuotas {
    pub daily_live_minutes: f64,
    pub daily_file_minutes: f64,
    pub daily_streaming_minutes: f64,
    pub daily_translation_minutes: f64,
    pub monthly_points: i64,
}

impl TierQuotas {
    /// Quota table for a tier.
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                daily_live_minutes: 30.0,
                daily_file_minutes: 15.0,
                daily_streaming_minutes: 10.0,
                daily_translation_minutes: 10.0,
                monthly_points: 100,
            },
            Tier::Basic => Self {
                daily_live_minutes: 180.0,
                daily_file_minutes: 120.0,
                daily_streaming_minutes: 120.0,
                daily_translation_minutes: 120.0,
                monthly_points: 1000,
            },
            Tier::Premium => Self {
                daily_live_minutes: UNLIMITED_MINUTES,
                daily_file_minutes: UNLIMITED_MINUTES,
                daily_streaming_minutes: UNLIMITED_MINUTES,
                daily_translation_minutes: UNLIMITED_MINUTES,
                monthly_points: UNLIMITED_POINTS,
            },
        }
    }

    /// Daily minute quota for a category (`UNLIMITED_MINUTES` = no cap).
    pub fn daily_minutes(&self, category: UsageCategory) -> f64 {
        match category {
            UsageCategory::LiveRecording => self.daily_live_minutes,
            UsageCategory::FileUpload => self.daily_file_minutes,
            UsageCategory::RealTimeStreaming => self.daily_streaming_minutes,
            UsageCategory::Translation => self.daily_translation_minutes,
        }
    }

    pub fn is_unlimited(&self, category: UsageCategory) -> bool {
        self.daily_minutes(category) == UNLIMITED_MINUTES
    }
}
