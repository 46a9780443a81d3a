//! Scriptable lookup connection for tests and local runs.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::domain::errors::LookupError;
use crate::domain::models::{AvatarId, LookupResult};
use crate::domain::ports::LookupConnection;

/// Answers from a scripted name table.
///
/// Ids without a scripted answer are left out of the response, which the
/// cache treats as a missing name.
pub struct MockLookupConnection {
    available: AtomicBool,
    names: DashMap<AvatarId, LookupResult>,
    error: Mutex<Option<LookupError>>,
    delay: Mutex<Option<Duration>>,
    nearby: Mutex<Vec<AvatarId>>,
    nearby_delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<Vec<AvatarId>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MockLookupConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLookupConnection {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            names: DashMap::new(),
            error: Mutex::new(None),
            delay: Mutex::new(None),
            nearby: Mutex::new(Vec::new()),
            nearby_delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Convenience constructor answering each id with a custom display name.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = (AvatarId, S)>,
        S: Into<String>,
    {
        let mock = Self::new();
        for (id, name) in names {
            mock.set_name(id, LookupResult::resolved(id, name));
        }
        mock
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_name(&self, avatar_id: AvatarId, result: LookupResult) {
        self.names.insert(avatar_id, result);
    }

    pub fn remove_name(&self, avatar_id: AvatarId) {
        self.names.remove(&avatar_id);
    }

    /// Fail every subsequent batch with `error`, or stop failing with `None`.
    pub fn fail_with(&self, error: Option<LookupError>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Delay every answer, e.g. to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn set_nearby(&self, avatar_ids: Vec<AvatarId>) {
        *self.nearby.lock().unwrap_or_else(PoisonError::into_inner) = avatar_ids;
    }

    /// Delay every `nearby_avatars` call.
    pub fn set_nearby_delay(&self, delay: Duration) {
        *self.nearby_delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Number of `request_names` calls received.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `request_names` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every batch received, in arrival order.
    pub fn requested_batches(&self) -> Vec<Vec<AvatarId>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times `avatar_id` appeared in a batch.
    pub fn times_requested(&self, avatar_id: AvatarId) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|batch| batch.contains(&avatar_id))
            .count()
    }
}

/// Decrements the in-flight count even when the call is cancelled by a timeout.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LookupConnection for MockLookupConnection {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn request_names(&self, avatar_ids: &[AvatarId]) -> Result<Vec<LookupResult>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(avatar_ids.to_vec());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let error = self.error.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(error) = error {
            return Err(error);
        }

        Ok(avatar_ids
            .iter()
            .filter_map(|id| self.names.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn nearby_avatars(&self) -> Vec<AvatarId> {
        let delay = *self.nearby_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.nearby
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_answers_only_scripted_ids() {
        let known = AvatarId::new();
        let mock = MockLookupConnection::with_names([(known, "Bob")]);

        let results = mock.request_names(&[known, AvatarId::new()]).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].display_name, "Bob");
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.times_requested(known), 1);
    }

    #[tokio::test]
    async fn test_scripted_error_fails_batch() {
        let mock = MockLookupConnection::new();
        mock.fail_with(Some(LookupError::Transport("reset".into())));
        assert!(mock.request_names(&[AvatarId::new()]).await.is_err());

        mock.fail_with(None);
        assert!(mock.request_names(&[AvatarId::new()]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_releases_in_flight_slot() {
        let mock = MockLookupConnection::new();
        mock.set_delay(Duration::from_secs(5));
        let ids = [AvatarId::new()];

        let mut request = tokio_test::task::spawn(mock.request_names(&ids));
        tokio_test::assert_pending!(request.poll());
        assert_eq!(mock.in_flight(), 1);

        drop(request);
        assert_eq!(mock.in_flight(), 0);
        assert_eq!(mock.peak_in_flight(), 1);
    }
}
