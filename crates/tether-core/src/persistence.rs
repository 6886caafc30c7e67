use crate::errors::PersistenceError;
use crate::events::Event;
use crate::ids::{OwnerId, SessionId};
use crate::protocol::IdentityMaterial;
use crate::session::{Session, SessionStatus};

/// Durable store for sessions, events and identity material. The store is
/// the system of record; everything held in memory can be rebuilt from it.
///
/// Deleted sessions are never returned by the list queries.
pub trait PersistenceGateway: Send + Sync {
    /// Insert a new session. Fails with `Conflict` when the owner already
    /// has a live session of the same name.
    fn insert_session(&self, session: &Session) -> Result<(), PersistenceError>;
    fn save_session(&self, session: &Session) -> Result<(), PersistenceError>;
    fn load_session(&self, id: &SessionId) -> Result<Option<Session>, PersistenceError>;

    /// Sessions of `owner` that are still active (not logged out, not deleted).
    fn list_active_sessions(&self, owner: &OwnerId) -> Result<Vec<Session>, PersistenceError>;
    /// Every non-deleted session of `owner`, newest first.
    fn list_sessions(&self, owner: &OwnerId) -> Result<Vec<Session>, PersistenceError>;
    /// Active sessions in `status`, across all owners.
    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, PersistenceError>;

    /// Append an event, returning it with its sequence number assigned.
    fn append_event(&self, event: Event) -> Result<Event, PersistenceError>;
    fn list_events(
        &self,
        session_id: &SessionId,
        after_sequence: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Event>, PersistenceError>;

    fn load_identity_material(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<IdentityMaterial>, PersistenceError>;
    fn save_identity_material(
        &self,
        session_id: &SessionId,
        material: &IdentityMaterial,
    ) -> Result<(), PersistenceError>;
    fn delete_identity_material(&self, session_id: &SessionId) -> Result<(), PersistenceError>;

    /// Cheap liveness check.
    fn ping(&self) -> Result<(), PersistenceError>;
}
