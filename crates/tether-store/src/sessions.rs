use tracing::instrument;

use tether_core::ids::{OwnerId, ProtocolIdentity, SessionId};
use tether_core::session::{PairingMaterial, Session, SessionStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, fmt_time, fmt_time_opt};

const TABLE: &str = "sessions";

const COLUMNS: &str = "id, owner_id, name, status, protocol_identity,
    pairing_code, pairing_image, pairing_issued_at, pairing_expires_at, pairing_retry_count,
    connected_at, disconnected_at, last_seen_at, is_active, deleted_at, created_at, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new session row. A live session with the same
    /// (owner, name) yields `Conflict`.
    #[instrument(skip(self, session), fields(session_id = %session.id, owner_id = %session.owner_id))]
    pub fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let pairing = PairingColumns::from(session.pairing.as_ref());
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sessions ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                rusqlite::params![
                    session.id.as_str(),
                    session.owner_id.as_str(),
                    session.name,
                    session.status.as_str(),
                    session.protocol_identity.as_ref().map(|i| i.as_str()),
                    pairing.code,
                    pairing.image,
                    pairing.issued_at,
                    pairing.expires_at,
                    pairing.retry_count,
                    fmt_time_opt(session.connected_at.as_ref()),
                    fmt_time_opt(session.disconnected_at.as_ref()),
                    fmt_time_opt(session.last_seen_at.as_ref()),
                    session.is_active,
                    fmt_time_opt(session.deleted_at.as_ref()),
                    fmt_time(&session.created_at),
                    fmt_time(&session.updated_at),
                ],
            )
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::Conflict(format!(
                    "owner {} already has a session named {:?}",
                    session.owner_id, session.name
                )),
                other => other,
            })?;
            Ok(())
        })
    }

    /// Overwrite every mutable column of an existing session.
    #[instrument(skip(self, session), fields(session_id = %session.id, status = %session.status))]
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let pairing = PairingColumns::from(session.pairing.as_ref());
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET
                    status = ?2, protocol_identity = ?3,
                    pairing_code = ?4, pairing_image = ?5, pairing_issued_at = ?6,
                    pairing_expires_at = ?7, pairing_retry_count = ?8,
                    connected_at = ?9, disconnected_at = ?10, last_seen_at = ?11,
                    is_active = ?12, deleted_at = ?13, updated_at = ?14
                 WHERE id = ?1",
                rusqlite::params![
                    session.id.as_str(),
                    session.status.as_str(),
                    session.protocol_identity.as_ref().map(|i| i.as_str()),
                    pairing.code,
                    pairing.image,
                    pairing.issued_at,
                    pairing.expires_at,
                    pairing.retry_count,
                    fmt_time_opt(session.connected_at.as_ref()),
                    fmt_time_opt(session.disconnected_at.as_ref()),
                    fmt_time_opt(session.last_seen_at.as_ref()),
                    session.is_active,
                    fmt_time_opt(session.deleted_at.as_ref()),
                    fmt_time(&session.updated_at),
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    /// Get a session by ID, including deleted ones.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Non-deleted sessions of an owner, newest first.
    #[instrument(skip(self), fields(owner_id = %owner_id, active_only))]
    pub fn list_by_owner(&self, owner_id: &OwnerId, active_only: bool) -> Result<Vec<Session>, StoreError> {
        let sql = if active_only {
            format!(
                "SELECT {COLUMNS} FROM sessions
                 WHERE owner_id = ?1 AND deleted_at IS NULL AND is_active = 1
                 ORDER BY created_at DESC, id DESC"
            )
        } else {
            format!(
                "SELECT {COLUMNS} FROM sessions
                 WHERE owner_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC, id DESC"
            )
        };
        self.query(&sql, [owner_id.as_str()])
    }

    /// Active, non-deleted sessions in the given status across all owners.
    #[instrument(skip(self), fields(status = %status))]
    pub fn list_by_status(&self, status: SessionStatus) -> Result<Vec<Session>, StoreError> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM sessions
                 WHERE status = ?1 AND is_active = 1 AND deleted_at IS NULL
                 ORDER BY created_at ASC, id ASC"
            ),
            [status.as_str()],
        )
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

/// Flattened pairing material as stored in the sessions table.
struct PairingColumns {
    code: Option<String>,
    image: Option<String>,
    issued_at: Option<String>,
    expires_at: Option<String>,
    retry_count: u32,
}

impl From<Option<&PairingMaterial>> for PairingColumns {
    fn from(material: Option<&PairingMaterial>) -> Self {
        match material {
            Some(m) => Self {
                code: Some(m.code.clone()),
                image: Some(m.image.clone()),
                issued_at: Some(fmt_time(&m.issued_at)),
                expires_at: Some(fmt_time(&m.expires_at)),
                retry_count: m.retry_count,
            },
            None => Self {
                code: None,
                image: None,
                issued_at: None,
                expires_at: None,
                retry_count: 0,
            },
        }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status_str: String = row_helpers::get(row, 3, TABLE, "status")?;
    let pairing_code: Option<String> = row_helpers::get_opt(row, 5, TABLE, "pairing_code")?;

    let pairing = match pairing_code {
        Some(code) => {
            let image: Option<String> = row_helpers::get_opt(row, 6, TABLE, "pairing_image")?;
            let issued: String = row_helpers::get(row, 7, TABLE, "pairing_issued_at")?;
            let expires: String = row_helpers::get(row, 8, TABLE, "pairing_expires_at")?;
            Some(PairingMaterial {
                code,
                image: image.unwrap_or_default(),
                issued_at: row_helpers::parse_time(&issued, TABLE, "pairing_issued_at")?,
                expires_at: row_helpers::parse_time(&expires, TABLE, "pairing_expires_at")?,
                retry_count: row_helpers::get(row, 9, TABLE, "pairing_retry_count")?,
            })
        }
        None => None,
    };

    let created: String = row_helpers::get(row, 15, TABLE, "created_at")?;
    let updated: String = row_helpers::get(row, 16, TABLE, "updated_at")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, TABLE, "id")?),
        owner_id: OwnerId::from_raw(row_helpers::get::<String>(row, 1, TABLE, "owner_id")?),
        name: row_helpers::get(row, 2, TABLE, "name")?,
        status: row_helpers::parse_enum(&status_str, TABLE, "status")?,
        protocol_identity: row_helpers::get_opt::<String>(row, 4, TABLE, "protocol_identity")?
            .map(ProtocolIdentity::new),
        pairing,
        connected_at: row_helpers::parse_time_opt(
            row_helpers::get_opt(row, 10, TABLE, "connected_at")?,
            TABLE,
            "connected_at",
        )?,
        disconnected_at: row_helpers::parse_time_opt(
            row_helpers::get_opt(row, 11, TABLE, "disconnected_at")?,
            TABLE,
            "disconnected_at",
        )?,
        last_seen_at: row_helpers::parse_time_opt(
            row_helpers::get_opt(row, 12, TABLE, "last_seen_at")?,
            TABLE,
            "last_seen_at",
        )?,
        is_active: row_helpers::get(row, 13, TABLE, "is_active")?,
        deleted_at: row_helpers::parse_time_opt(
            row_helpers::get_opt(row, 14, TABLE, "deleted_at")?,
            TABLE,
            "deleted_at",
        )?,
        created_at: row_helpers::parse_time(&created, TABLE, "created_at")?,
        updated_at: row_helpers::parse_time(&updated, TABLE, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, SubsecRound, Utc};
    use tether_core::state::{self, Transition};

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn material(retry_count: u32) -> PairingMaterial {
        let issued_at = now();
        PairingMaterial {
            code: "2@Zm9vYmFy".into(),
            image: "data:image/svg+xml;base64,PHN2Zy8+".into(),
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(30),
            retry_count,
        }
    }

    #[test]
    fn insert_and_get() {
        let repo = setup();
        let session = Session::new(OwnerId::from_raw("1"), "phone-A", now());
        repo.insert(&session).unwrap();

        let loaded = repo.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn get_missing_returns_none() {
        let repo = setup();
        assert!(repo.get(&SessionId::new()).unwrap().is_none());
    }

    #[test]
    fn duplicate_name_conflicts_per_owner() {
        let repo = setup();
        repo.insert(&Session::new(OwnerId::from_raw("1"), "phone-A", now())).unwrap();

        let err = repo
            .insert(&Session::new(OwnerId::from_raw("1"), "phone-A", now()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");

        // Same name under another owner is fine.
        repo.insert(&Session::new(OwnerId::from_raw("2"), "phone-A", now())).unwrap();
    }

    #[test]
    fn deleted_session_frees_its_name() {
        let repo = setup();
        let mut session = Session::new(OwnerId::from_raw("1"), "phone-A", now());
        repo.insert(&session).unwrap();
        state::mark_deleted(&mut session, now()).unwrap();
        repo.save(&session).unwrap();

        repo.insert(&Session::new(OwnerId::from_raw("1"), "phone-A", now())).unwrap();
    }

    #[test]
    fn save_roundtrips_pairing_material() {
        let repo = setup();
        let mut session = Session::new(OwnerId::from_raw("1"), "phone-A", now());
        repo.insert(&session).unwrap();

        state::apply(
            &mut session,
            &Transition::IssuePairingCode { material: material(1) },
            now(),
        )
        .unwrap();
        repo.save(&session).unwrap();

        let loaded = repo.get(&session.id).unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::PairingReady);
        assert_eq!(loaded.pairing, session.pairing);
    }

    #[test]
    fn save_missing_session_is_not_found() {
        let repo = setup();
        let session = Session::new(OwnerId::from_raw("1"), "ghost", now());
        assert!(matches!(repo.save(&session), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_by_owner_filters_inactive_and_deleted() {
        let repo = setup();
        let owner = OwnerId::from_raw("1");
        let live = Session::new(owner.clone(), "live", now());
        let mut logged_out = Session::new(owner.clone(), "logged-out", now());
        let mut deleted = Session::new(owner.clone(), "deleted", now());
        for s in [&live, &logged_out, &deleted] {
            repo.insert(s).unwrap();
        }
        logged_out.is_active = false;
        repo.save(&logged_out).unwrap();
        state::mark_deleted(&mut deleted, now()).unwrap();
        repo.save(&deleted).unwrap();

        let active = repo.list_by_owner(&owner, true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);

        let all = repo.list_by_owner(&owner, false).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.id != deleted.id));
    }

    #[test]
    fn list_by_status_spans_owners() {
        let repo = setup();
        let mut a = Session::new(OwnerId::from_raw("1"), "a", now());
        let b = Session::new(OwnerId::from_raw("2"), "b", now());
        repo.insert(&a).unwrap();
        repo.insert(&b).unwrap();
        state::apply(&mut a, &Transition::IssuePairingCode { material: material(1) }, now()).unwrap();
        repo.save(&a).unwrap();

        let pending = repo.list_by_status(SessionStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        let ready = repo.list_by_status(SessionStatus::PairingReady).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, a.id);
    }

    #[test]
    fn corrupt_status_is_reported() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let session = Session::new(OwnerId::from_raw("1"), "phone", now());
        repo.insert(&session).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE sessions SET status = 'zombie'", [])?;
            Ok(())
        })
        .unwrap();

        let err = repo.get(&session.id).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptRow { table: "sessions", column: "status", .. }
        ));
    }
}
