//! Cached name record and the update acceptance policy.
//!
//! Every write into a cache tier goes through [`evaluate_update`]. The policy
//! guarantees that a net loss of information never happens: a bad value never
//! replaces anything, and a user-chosen display name is never replaced by a
//! default (legacy-derived) one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::identity::AvatarId;

/// Placeholder returned to callers while a name is being resolved.
pub const LOADING_PLACEHOLDER: &str = "Loading...";

/// Values that never count as a real name.
///
/// Compared case-insensitively after trimming.
pub const INVALID_NAME_PLACEHOLDERS: [&str; 4] = ["Loading...", "???", "Unknown User", "Resolving..."];

/// Last name assigned to accounts created without a chosen surname.
pub const LEGACY_PLACEHOLDER_LAST_NAME: &str = "Resident";

/// Returns true when `value` cannot be shown as a name.
pub fn is_invalid_name(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || INVALID_NAME_PLACEHOLDERS
            .iter()
            .any(|placeholder| placeholder.eq_ignore_ascii_case(trimmed))
}

/// One cached name per avatar id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub avatar_id: AvatarId,
    pub display_name: String,
    pub user_name: String,
    pub legacy_first_name: String,
    pub legacy_last_name: String,
    /// True when the user never picked a custom display name.
    pub is_default_display_name: bool,
    /// Last accepted content change.
    pub last_updated: DateTime<Utc>,
    /// Last write to the tier holding this copy.
    pub cached_at: DateTime<Utc>,
    /// Earliest time the record is eligible for a proactive refresh.
    pub next_scheduled_refresh: DateTime<Utc>,
}

impl NameRecord {
    /// Create a record carrying a custom display name, stamped now.
    pub fn new(avatar_id: AvatarId, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            avatar_id,
            display_name: display_name.into(),
            user_name: String::new(),
            legacy_first_name: String::new(),
            legacy_last_name: String::new(),
            is_default_display_name: false,
            last_updated: now,
            cached_at: now,
            next_scheduled_refresh: now,
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

    /// Mark the display name as the default one derived from the legacy name.
    pub fn as_default_display_name(mut self) -> Self {
        self.is_default_display_name = true;
        self
    }

    pub fn with_next_refresh(mut self, at: DateTime<Utc>) -> Self {
        self.next_scheduled_refresh = at;
        self
    }

    pub fn has_valid_display_name(&self) -> bool {
        !is_invalid_name(&self.display_name)
    }

    /// `"First Last"`, or just `"First"` when the surname is the placeholder.
    pub fn legacy_full_name(&self) -> Option<String> {
        let first = self.legacy_first_name.trim();
        if is_invalid_name(first) {
            return None;
        }
        let last = self.legacy_last_name.trim();
        if last.is_empty() || last.eq_ignore_ascii_case(LEGACY_PLACEHOLDER_LAST_NAME) {
            Some(first.to_string())
        } else {
            Some(format!("{first} {last}"))
        }
    }

    /// The account user name, derived from the legacy name when upstream sent none.
    pub fn effective_user_name(&self) -> Option<String> {
        let user_name = self.user_name.trim();
        if !is_invalid_name(user_name) {
            return Some(user_name.to_string());
        }
        let first = self.legacy_first_name.trim();
        if is_invalid_name(first) {
            return None;
        }
        let last = self.legacy_last_name.trim();
        if last.is_empty() || last.eq_ignore_ascii_case(LEGACY_PLACEHOLDER_LAST_NAME) {
            Some(first.to_lowercase())
        } else {
            Some(format!("{}.{}", first.to_lowercase(), last.to_lowercase()))
        }
    }

    pub fn is_refresh_due(&self, now: DateTime<Utc>) -> bool {
        self.next_scheduled_refresh <= now
    }

    pub fn is_older_than(&self, age: Duration, now: DateTime<Utc>) -> bool {
        self.cached_at < now - age
    }

    /// Stamp the record as freshly written to a tier.
    pub fn touch(&mut self, now: DateTime<Utc>, refresh_after: Duration) {
        self.cached_at = now;
        self.next_scheduled_refresh = now + refresh_after;
    }

    /// Copy blank identity fields from `other`. Never overwrites a non-blank value.
    ///
    /// Returns true if anything changed.
    pub fn fill_missing_identity(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (mine, theirs) in [
            (&mut self.user_name, &other.user_name),
            (&mut self.legacy_first_name, &other.legacy_first_name),
            (&mut self.legacy_last_name, &other.legacy_last_name),
        ] {
            if is_invalid_name(mine) && !is_invalid_name(theirs) {
                mine.clone_from(theirs);
                changed = true;
            }
        }
        changed
    }
}

/// Why a candidate record was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The candidate display name is empty or a placeholder.
    InvalidCandidate,
    /// Both display names are valid and identical.
    Unchanged,
    /// A default display name would replace a custom one.
    CustomToDefault,
    /// A durable copy no newer than the valid record already held.
    Outdated,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidCandidate => "invalid_candidate",
            Self::Unchanged => "unchanged",
            Self::CustomToDefault => "custom_to_default",
            Self::Outdated => "outdated",
        }
    }

    /// Rejections caused by a real upstream answer still count as a completed lookup.
    pub fn confirms_lookup(&self) -> bool {
        !matches!(self, Self::InvalidCandidate | Self::Outdated)
    }
}

/// Outcome of [`evaluate_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    Accept,
    Reject(RejectReason),
}

impl UpdateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Decide whether `candidate` may replace `existing`.
pub fn evaluate_update(existing: Option<&NameRecord>, candidate: &NameRecord) -> UpdateDecision {
    let Some(existing) = existing else {
        return UpdateDecision::Accept;
    };

    if !candidate.has_valid_display_name() {
        return UpdateDecision::Reject(RejectReason::InvalidCandidate);
    }

    if !existing.has_valid_display_name() {
        return UpdateDecision::Accept;
    }

    if existing.display_name == candidate.display_name {
        return UpdateDecision::Reject(RejectReason::Unchanged);
    }

    if candidate.is_default_display_name && !existing.is_default_display_name {
        return UpdateDecision::Reject(RejectReason::CustomToDefault);
    }

    UpdateDecision::Accept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(display: &str) -> NameRecord {
        NameRecord::new(AvatarId::new(), display)
    }

    #[test]
    fn test_invalid_names() {
        assert!(is_invalid_name(""));
        assert!(is_invalid_name("   "));
        assert!(is_invalid_name("Loading..."));
        assert!(is_invalid_name("loading..."));
        assert!(is_invalid_name(" ??? "));
        assert!(is_invalid_name("Unknown User"));
        assert!(is_invalid_name("Resolving..."));
        assert!(!is_invalid_name("Jara"));
        assert!(!is_invalid_name("?"));
    }

    #[test]
    fn test_accepts_when_absent() {
        let candidate = record("Bob");
        assert_eq!(evaluate_update(None, &candidate), UpdateDecision::Accept);

        let placeholder = record("???");
        assert_eq!(evaluate_update(None, &placeholder), UpdateDecision::Accept);
    }

    #[test]
    fn test_rejects_invalid_candidate_even_over_invalid() {
        let existing = record("???");
        let candidate = record("Loading...");
        assert_eq!(
            evaluate_update(Some(&existing), &candidate),
            UpdateDecision::Reject(RejectReason::InvalidCandidate)
        );
    }

    #[test]
    fn test_valid_replaces_invalid() {
        let existing = record("Unknown User");
        let candidate = record("Bob").as_default_display_name();
        assert_eq!(evaluate_update(Some(&existing), &candidate), UpdateDecision::Accept);
    }

    #[test]
    fn test_identical_is_unchanged() {
        let existing = record("Bob");
        let candidate = record("Bob");
        assert_eq!(
            evaluate_update(Some(&existing), &candidate),
            UpdateDecision::Reject(RejectReason::Unchanged)
        );
    }

    #[test]
    fn test_default_never_replaces_custom() {
        let existing = record("Jara");
        let candidate = record("Jara Lowell").as_default_display_name();
        assert_eq!(
            evaluate_update(Some(&existing), &candidate),
            UpdateDecision::Reject(RejectReason::CustomToDefault)
        );
    }

    #[test]
    fn test_custom_replaces_default_and_custom() {
        let default_existing = record("Jara Lowell").as_default_display_name();
        assert!(evaluate_update(Some(&default_existing), &record("Jara")).is_accept());

        let custom_existing = record("Jara");
        assert!(evaluate_update(Some(&custom_existing), &record("Jaraxx")).is_accept());

        let other_default = record("J Lowell").as_default_display_name();
        assert!(evaluate_update(Some(&default_existing), &other_default).is_accept());
    }

    #[test]
    fn test_legacy_full_name_omits_placeholder_surname() {
        let r = record("Bob").with_legacy_name("Bob", "Resident");
        assert_eq!(r.legacy_full_name().as_deref(), Some("Bob"));

        let r = record("Jara").with_legacy_name("Jara", "Lowell");
        assert_eq!(r.legacy_full_name().as_deref(), Some("Jara Lowell"));

        assert_eq!(record("Bob").legacy_full_name(), None);
    }

    #[test]
    fn test_effective_user_name() {
        let r = record("Jara").with_legacy_name("Jara", "Lowell");
        assert_eq!(r.effective_user_name().as_deref(), Some("jara.lowell"));

        let r = record("Bob").with_legacy_name("Bob", "Resident");
        assert_eq!(r.effective_user_name().as_deref(), Some("bob"));

        let r = record("Bob").with_user_name("bobby");
        assert_eq!(r.effective_user_name().as_deref(), Some("bobby"));
    }

    #[test]
    fn test_fill_missing_identity_keeps_existing_values() {
        let mut existing = record("Jara").with_user_name("jara.lowell");
        let other = record("Jara").with_user_name("someone.else").with_legacy_name("Jara", "Lowell");

        assert!(existing.fill_missing_identity(&other));
        assert_eq!(existing.user_name, "jara.lowell");
        assert_eq!(existing.legacy_first_name, "Jara");
        assert_eq!(existing.legacy_last_name, "Lowell");
        assert!(!existing.fill_missing_identity(&other));
    }

    #[test]
    fn test_refresh_schedule() {
        let now = Utc::now();
        let mut r = record("Bob");
        r.touch(now, Duration::hours(2));
        assert!(!r.is_refresh_due(now));
        assert!(r.is_refresh_due(now + Duration::hours(2)));
        assert!(r.is_older_than(Duration::minutes(5), now + Duration::minutes(6)));
    }
}
