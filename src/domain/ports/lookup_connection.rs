//! Lookup connection port.

use async_trait::async_trait;

use crate::domain::errors::LookupError;
use crate::domain::models::{AvatarId, LookupResult};

/// An active session able to resolve avatar ids upstream.
///
/// The cache never owns the session lifecycle. Connections are registered and
/// unregistered by the session manager and may become unavailable at any time.
#[async_trait]
pub trait LookupConnection: Send + Sync {
    /// Whether the session can currently issue lookups.
    fn is_available(&self) -> bool;

    /// Resolve a batch of ids.
    ///
    /// Ids missing from the returned list are treated as unresolved. An `Err`
    /// fails the whole batch.
    async fn request_names(&self, avatar_ids: &[AvatarId]) -> Result<Vec<LookupResult>, LookupError>;

    /// Ids currently relevant to this session (nearby avatars, chat participants).
    ///
    /// Feeds the periodic refresher. Sessions without such a notion return nothing.
    async fn nearby_avatars(&self) -> Vec<AvatarId> {
        Vec::new()
    }
}
