use tracing::instrument;

use tether_core::events::{Event, EventPayload};
use tether_core::ids::{EventId, OwnerId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, fmt_time};

const TABLE: &str = "events";

/// Upper bound for a single `list` call.
pub const MAX_PAGE: u32 = 1000;

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event to its session's log. The sequence number is assigned
    /// here (max + 1, starting at 1) inside one transaction.
    #[instrument(skip(self, event), fields(session_id = %event.session_id, event_type = event.event_type()))]
    pub fn append(&self, mut event: Event) -> Result<Event, StoreError> {
        let data = serde_json::to_string(&event.payload.data())?;
        self.db.with_tx(|tx| {
            let max_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE session_id = ?1",
                [event.session_id.as_str()],
                |row| row.get(0),
            )?;
            event.sequence = max_seq + 1;

            tx.execute(
                "INSERT INTO events (id, session_id, owner_id, sequence, type, status, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    event.id.as_str(),
                    event.session_id.as_str(),
                    event.owner_id.as_str(),
                    event.sequence,
                    event.event_type(),
                    event.status.as_str(),
                    data,
                    fmt_time(&event.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(event)
    }

    /// Events of a session in sequence order, optionally only those after
    /// `after_sequence`.
    #[instrument(skip(self), fields(session_id = %session_id, after_sequence, limit))]
    pub fn list(
        &self,
        session_id: &SessionId,
        after_sequence: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Event>, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, owner_id, sequence, type, status, data, created_at
                 FROM events WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                session_id.as_str(),
                after_sequence.unwrap_or(0),
                limit
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Count events for a session.
    pub fn count(&self, session_id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    let event_type: String = row_helpers::get(row, 4, TABLE, "type")?;
    let status: String = row_helpers::get(row, 5, TABLE, "status")?;
    let data: String = row_helpers::get(row, 6, TABLE, "data")?;
    let created: String = row_helpers::get(row, 7, TABLE, "created_at")?;

    let payload = EventPayload::from_parts(&event_type, row_helpers::parse_json(&data, TABLE, "data")?)
        .map_err(|e| StoreError::CorruptRow {
            table: TABLE,
            column: "data",
            detail: format!("{event_type}: {e}"),
        })?;

    Ok(Event {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, TABLE, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, TABLE, "session_id")?),
        owner_id: OwnerId::from_raw(row_helpers::get::<String>(row, 2, TABLE, "owner_id")?),
        sequence: row_helpers::get(row, 3, TABLE, "sequence")?,
        status: row_helpers::parse_enum(&status, TABLE, "status")?,
        payload,
        created_at: row_helpers::parse_time(&created, TABLE, "created_at")?,
    })
}
