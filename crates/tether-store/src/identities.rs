use chrono::Utc;
use tracing::{instrument, warn};

use tether_core::ids::SessionId;
use tether_core::protocol::IdentityMaterial;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, fmt_time};
use crate::vault::{self, Vault};

const TABLE: &str = "identity_material";

/// Sealed per-session protocol key material.
pub struct IdentityRepo {
    db: Database,
    vault: Vault,
}

impl IdentityRepo {
    pub fn new(db: Database, vault: Vault) -> Self {
        Self { db, vault }
    }

    #[instrument(skip(self, material), fields(session_id = %session_id, len = material.len()))]
    pub fn save(&self, session_id: &SessionId, material: &IdentityMaterial) -> Result<(), StoreError> {
        let sealed = self.vault.seal(material.expose())?;
        let fingerprint = vault::fingerprint(material.expose());
        let now = fmt_time(&Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identity_material (session_id, sealed, fingerprint, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    sealed = excluded.sealed,
                    fingerprint = excluded.fingerprint,
                    updated_at = excluded.updated_at",
                rusqlite::params![session_id.as_str(), sealed, fingerprint, now],
            )?;
            Ok(())
        })
    }

    /// Open the stored material. A row that fails to decrypt or whose
    /// fingerprint does not match is reported as corrupt.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn load(&self, session_id: &SessionId) -> Result<Option<IdentityMaterial>, StoreError> {
        let row: Option<(String, String)> = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT sealed, fingerprint FROM identity_material WHERE session_id = ?1")?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some((
                    row_helpers::get(row, 0, TABLE, "sealed")?,
                    row_helpers::get(row, 1, TABLE, "fingerprint")?,
                ))),
                None => Ok(None),
            }
        })?;

        let Some((sealed, expected)) = row else {
            return Ok(None);
        };
        let plaintext = self.vault.open(&sealed).map_err(|e| {
            warn!(session_id = %session_id, error = %e, "identity material failed to open");
            e
        })?;
        if vault::fingerprint(&plaintext) != expected {
            return Err(StoreError::CorruptRow {
                table: TABLE,
                column: "fingerprint",
                detail: format!("fingerprint mismatch for session {session_id}"),
            });
        }
        Ok(Some(IdentityMaterial::new(plaintext)))
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM identity_material WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(())
        })
    }
}
