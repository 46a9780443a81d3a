//! Lookup results and the bookkeeping types of the request and retry pipelines.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::identity::AvatarId;
use super::name_record::{is_invalid_name, NameRecord};

/// One entry of a batch answer from a lookup connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResult {
    pub avatar_id: AvatarId,
    pub success: bool,
    pub display_name: String,
    pub user_name: String,
    pub legacy_first_name: String,
    pub legacy_last_name: String,
    pub is_default_display_name: bool,
}

impl LookupResult {
    /// A successful answer carrying a custom display name.
    pub fn resolved(avatar_id: AvatarId, display_name: impl Into<String>) -> Self {
        Self {
            avatar_id,
            success: true,
            display_name: display_name.into(),
            user_name: String::new(),
            legacy_first_name: String::new(),
            legacy_last_name: String::new(),
            is_default_display_name: false,
        }
    }

    /// An explicit "no answer" for this id.
    pub fn failed(avatar_id: AvatarId) -> Self {
        Self {
            success: false,
            ..Self::resolved(avatar_id, "")
        }
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = user_name.into();
        self
    }

    pub fn with_legacy_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.legacy_first_name = first.into();
        self.legacy_last_name = last.into();
        self
    }

    pub fn as_default_display_name(mut self) -> Self {
        self.is_default_display_name = true;
        self
    }

    /// Success with a usable display name.
    pub fn is_confirmed(&self) -> bool {
        self.success && !is_invalid_name(&self.display_name)
    }

    /// Convert into a record stamped at `now`, due for refresh after `refresh_after`.
    pub fn into_record(self, now: DateTime<Utc>, refresh_after: Duration) -> NameRecord {
        NameRecord {
            avatar_id: self.avatar_id,
            display_name: self.display_name,
            user_name: self.user_name,
            legacy_first_name: self.legacy_first_name,
            legacy_last_name: self.legacy_last_name,
            is_default_display_name: self.is_default_display_name,
            last_updated: now,
            cached_at: now,
            next_scheduled_refresh: now + refresh_after,
        }
    }
}

/// Why a lookup did not produce a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Upstream had no answer for the id.
    MissingName,
    /// No connection was available, or the call failed or timed out.
    NetworkError,
    /// The response could not be interpreted.
    TransientFailure,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingName => "missing_name",
            Self::NetworkError => "network_error",
            Self::TransientFailure => "transient_failure",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup marker for an id waiting in the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub avatar_id: AvatarId,
    pub enqueued_at: Instant,
}

impl PendingRequest {
    pub fn new(avatar_id: AvatarId, enqueued_at: Instant) -> Self {
        Self { avatar_id, enqueued_at }
    }

    pub fn is_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.enqueued_at) >= timeout
    }
}

/// Retry tracking for one avatar id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub avatar_id: AvatarId,
    pub first_attempt_at: DateTime<Utc>,
    pub next_retry_at: Instant,
    /// Number of the retry this entry is waiting for, 1-based.
    pub attempt_count: u32,
    pub last_failure_reason: String,
    pub failure_category: FailureCategory,
    /// Set while the retry is being dispatched.
    pub in_flight: bool,
}

impl RetryEntry {
    pub fn is_ready(&self, now: Instant) -> bool {
        !self.in_flight && self.next_retry_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_requires_success_and_valid_name() {
        let id = AvatarId::new();
        assert!(LookupResult::resolved(id, "Bob").is_confirmed());
        assert!(!LookupResult::resolved(id, "???").is_confirmed());
        assert!(!LookupResult::failed(id).is_confirmed());
    }

    #[test]
    fn test_into_record_schedules_refresh() {
        let id = AvatarId::new();
        let now = Utc::now();
        let record = LookupResult::resolved(id, "Jara Lowell")
            .with_legacy_name("Jara", "Lowell")
            .as_default_display_name()
            .into_record(now, Duration::hours(2));

        assert_eq!(record.avatar_id, id);
        assert!(record.is_default_display_name);
        assert_eq!(record.last_updated, now);
        assert_eq!(record.next_scheduled_refresh, now + Duration::hours(2));
    }

    #[test]
    fn test_pending_request_expiry() {
        let start = Instant::now();
        let pending = PendingRequest::new(AvatarId::new(), start);
        let timeout = std::time::Duration::from_secs(300);
        assert!(!pending.is_expired(start, timeout));
        assert!(pending.is_expired(start + timeout, timeout));
    }
}
