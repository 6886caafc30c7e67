use tether_core::errors::PersistenceError;
use tether_core::events::Event;
use tether_core::ids::{OwnerId, SessionId};
use tether_core::persistence::PersistenceGateway;
use tether_core::protocol::IdentityMaterial;
use tether_core::session::{Session, SessionStatus};

use crate::database::Database;
use crate::events::EventRepo;
use crate::identities::IdentityRepo;
use crate::sessions::SessionRepo;
use crate::vault::Vault;

/// SQLite-backed [`PersistenceGateway`].
pub struct SqliteGateway {
    db: Database,
    sessions: SessionRepo,
    events: EventRepo,
    identities: IdentityRepo,
}

impl SqliteGateway {
    pub fn new(db: Database, vault: Vault) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            events: EventRepo::new(db.clone()),
            identities: IdentityRepo::new(db.clone(), vault),
            db,
        }
    }

    /// In-memory database with an ephemeral vault key.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Ok(Self::new(Database::in_memory()?, Vault::ephemeral()))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl PersistenceGateway for SqliteGateway {
    fn insert_session(&self, session: &Session) -> Result<(), PersistenceError> {
        Ok(self.sessions.insert(session)?)
    }

    fn save_session(&self, session: &Session) -> Result<(), PersistenceError> {
        Ok(self.sessions.save(session)?)
    }

    fn load_session(&self, id: &SessionId) -> Result<Option<Session>, PersistenceError> {
        Ok(self.sessions.get(id)?)
    }

    fn list_active_sessions(&self, owner: &OwnerId) -> Result<Vec<Session>, PersistenceError> {
        Ok(self.sessions.list_by_owner(owner, true)?)
    }

    fn list_sessions(&self, owner: &OwnerId) -> Result<Vec<Session>, PersistenceError> {
        Ok(self.sessions.list_by_owner(owner, false)?)
    }

    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, PersistenceError> {
        Ok(self.sessions.list_by_status(status)?)
    }

    fn append_event(&self, event: Event) -> Result<Event, PersistenceError> {
        Ok(self.events.append(event)?)
    }

    fn list_events(
        &self,
        session_id: &SessionId,
        after_sequence: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Event>, PersistenceError> {
        Ok(self.events.list(session_id, after_sequence, limit)?)
    }

    fn load_identity_material(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<IdentityMaterial>, PersistenceError> {
        Ok(self.identities.load(session_id)?)
    }

    fn save_identity_material(
        &self,
        session_id: &SessionId,
        material: &IdentityMaterial,
    ) -> Result<(), PersistenceError> {
        Ok(self.identities.save(session_id, material)?)
    }

    fn delete_identity_material(&self, session_id: &SessionId) -> Result<(), PersistenceError> {
        Ok(self.identities.delete(session_id)?)
    }

    fn ping(&self) -> Result<(), PersistenceError> {
        Ok(self.db.ping()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tether_core::events::EventPayload;

    #[test]
    fn duplicate_name_maps_to_conflict() {
        let gw = SqliteGateway::in_memory().unwrap();
        let owner = OwnerId::from_raw("1");
        gw.insert_session(&Session::new(owner.clone(), "phone-A", Utc::now())).unwrap();
        let err = gw
            .insert_session(&Session::new(owner, "phone-A", Utc::now()))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
    }

    #[test]
    fn corrupt_identity_maps_to_corrupt() {
        let gw = SqliteGateway::in_memory().unwrap();
        let session = Session::new(OwnerId::from_raw("1"), "phone-A", Utc::now());
        gw.insert_session(&session).unwrap();
        gw.save_identity_material(&session.id, &IdentityMaterial::new(vec![7; 16]))
            .unwrap();
        gw.database()
            .with_conn(|conn| {
                conn.execute("UPDATE identity_material SET sealed = 'AAAAAAAAAAAAAAAAAAAAAAAA'", [])?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            gw.load_identity_material(&session.id),
            Err(PersistenceError::Corrupt(_))
        ));
    }

    #[test]
    fn events_flow_through() {
        let gw = SqliteGateway::in_memory().unwrap();
        let session = Session::new(OwnerId::from_raw("1"), "phone-A", Utc::now());
        gw.insert_session(&session).unwrap();
        let stored = gw
            .append_event(Event::for_session(&session, EventPayload::Restored {}, Utc::now()))
            .unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(gw.list_events(&session.id, None, 50).unwrap().len(), 1);
        gw.ping().unwrap();
    }

    #[test]
    fn save_unknown_session_is_not_found() {
        let gw = SqliteGateway::in_memory().unwrap();
        let session = Session::new(OwnerId::from_raw("1"), "ghost", Utc::now());
        assert!(matches!(gw.save_session(&session), Err(PersistenceError::NotFound(_))));
    }
}
