//! Freshness policy shared by every read path.
//!
//! Every payload that carries snapshot data also carries the policy version and
//! threshold it was judged against, so a stale value describes itself.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::TrustStatus;

pub const REFRESHING_WARNING: &str = "Metrics are being refreshed, please wait a moment.";
pub const DELAYED_WARNING: &str = "Metrics may be slightly delayed.";

const BASE_RETRY_SECONDS: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessPolicy {
    pub policy_version: u32,
    pub stale_threshold_seconds: i64,
}

pub const SNAPSHOT_POLICY: FreshnessPolicy = FreshnessPolicy {
    policy_version: 1,
    stale_threshold_seconds: 300,
};

impl Default for FreshnessPolicy {
    fn default() -> Self {
        SNAPSHOT_POLICY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Live,
    Stale,
    Refreshing,
    Failing,
}

pub fn snapshot_age_seconds(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - updated_at).num_seconds().max(0)
}

impl FreshnessPolicy {
    pub fn is_stale(&self, age_seconds: i64) -> bool {
        age_seconds > self.stale_threshold_seconds
    }

    pub fn classify(&self, age_seconds: i64, trust: TrustStatus) -> Freshness {
        match trust {
            TrustStatus::Failed => Freshness::Failing,
            TrustStatus::Pending => Freshness::Refreshing,
            TrustStatus::Ready if self.is_stale(age_seconds) => Freshness::Stale,
            TrustStatus::Ready => Freshness::Live,
        }
    }

    pub fn needs_refresh(&self, age_seconds: i64, trust: TrustStatus) -> bool {
        self.classify(age_seconds, trust) != Freshness::Live
    }

    pub fn warning(&self, age_seconds: i64, trust: TrustStatus) -> Option<&'static str> {
        match self.classify(age_seconds, trust) {
            Freshness::Live => None,
            Freshness::Stale => Some(DELAYED_WARNING),
            Freshness::Refreshing | Freshness::Failing => Some(REFRESHING_WARNING),
        }
    }

    /// Polling hint for clients waiting on a refresh. Grows with queue depth
    /// and never exceeds the stale threshold.
    pub fn retry_after_seconds(&self, freshness: Freshness, queue_depth: i64) -> Option<i64> {
        if freshness == Freshness::Live {
            return None;
        }
        let scaled = BASE_RETRY_SECONDS * (1 + queue_depth.max(0) / 10);
        Some(scaled.min(self.stale_threshold_seconds.max(BASE_RETRY_SECONDS)))
    }

    pub fn meta(
        &self,
        age_seconds: i64,
        trust: TrustStatus,
        queue_depth: Option<i64>,
    ) -> FreshnessMeta {
        let freshness = self.classify(age_seconds, trust);
        FreshnessMeta {
            policy_version: self.policy_version,
            stale_threshold_seconds: self.stale_threshold_seconds,
            snapshot_age_seconds: age_seconds,
            refresh_status: trust,
            freshness,
            queue_depth,
            warnings: self
                .warning(age_seconds, trust)
                .map(|warning| vec![warning.to_string()]),
            refresh_error: None,
            retry_after_seconds: self.retry_after_seconds(freshness, queue_depth.unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessMeta {
    pub policy_version: u32,
    pub stale_threshold_seconds: i64,
    pub snapshot_age_seconds: i64,
    pub refresh_status: TrustStatus,
    pub freshness: Freshness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}
