use super::Metastore;
use crate::error::{AsherahError, AsherahResult};
use crate::types::EnvelopeKeyRecord;
use duckdb::{params, Connection};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Relational metastore on DuckDB.
///
/// Schema mirrors the conventional Asherah `encryption_key` table: one row per
/// `(id, created)` with the record stored as JSON.
#[derive(Clone)]
pub struct SqlMetastore {
    conn: Arc<Mutex<Connection>>,
    location: String,
}

fn storage_error(e: impl fmt::Display) -> AsherahError {
    AsherahError::MetastoreUnavailable(e.to_string())
}

impl SqlMetastore {
    /// Opens (creating if needed) the metastore named by a connection string:
    /// a database file path, or `:memory:`.
    pub fn open(connection_string: &str) -> AsherahResult<Self> {
        let conn = if connection_string == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(Path::new(connection_string))
        }
        .map_err(storage_error)?;

        initialize_schema(&conn)?;
        debug!("opened SQL metastore at {connection_string}");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location: connection_string.to_string(),
        })
    }

    pub fn open_in_memory() -> AsherahResult<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> AsherahResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(storage_error)
    }
}

impl fmt::Debug for SqlMetastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlMetastore")
            .field("location", &self.location)
            .finish()
    }
}

fn initialize_schema(conn: &Connection) -> AsherahResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS encryption_key (
            id VARCHAR NOT NULL,
            created BIGINT NOT NULL,
            key_record VARCHAR NOT NULL,
            PRIMARY KEY (id, created)
        );",
    )
    .map_err(storage_error)
}

fn parse_record(json: &str) -> AsherahResult<EnvelopeKeyRecord> {
    serde_json::from_str(json)
        .map_err(|e| AsherahError::MetastoreUnavailable(format!("corrupt key record: {e}")))
}

fn query_record(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> AsherahResult<Option<EnvelopeKeyRecord>> {
    match conn.query_row(sql, params, |row| row.get::<_, String>(0)) {
        Ok(json) => parse_record(&json).map(Some),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage_error(e)),
    }
}

impl Metastore for SqlMetastore {
    fn load(&self, id: &str, created: i64) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        let conn = self.conn()?;
        query_record(
            &conn,
            "SELECT key_record FROM encryption_key WHERE id = ? AND created = ?",
            params![id, created],
        )
    }

    fn load_latest(&self, id: &str) -> AsherahResult<Option<EnvelopeKeyRecord>> {
        let conn = self.conn()?;
        query_record(
            &conn,
            "SELECT key_record FROM encryption_key WHERE id = ? ORDER BY created DESC LIMIT 1",
            params![id],
        )
    }

    fn store(&self, id: &str, created: i64, record: &EnvelopeKeyRecord) -> AsherahResult<()> {
        let json = serde_json::to_string(record).map_err(storage_error)?;
        let conn = self.conn()?;

        // The connection mutex makes check-then-insert atomic for this process;
        // the primary key covers other writers sharing the database.
        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM encryption_key WHERE id = ? AND created = ?",
                params![id, created],
                |row| row.get(0),
            )
            .map_err(storage_error)?;
        if exists > 0 {
            return Err(AsherahError::AlreadyExists {
                id: id.to_string(),
                created,
            });
        }

        conn.execute(
            "INSERT INTO encryption_key (id, created, key_record) VALUES (?, ?, ?)",
            params![id, created, json],
        )
        .map_err(|e| {
            if e.to_string().to_lowercase().contains("constraint") {
                AsherahError::AlreadyExists {
                    id: id.to_string(),
                    created,
                }
            } else {
                storage_error(e)
            }
        })?;
        Ok(())
    }

    fn mark_revoked(&self, id: &str, created: i64) -> AsherahResult<bool> {
        let conn = self.conn()?;
        let Some(mut record) = query_record(
            &conn,
            "SELECT key_record FROM encryption_key WHERE id = ? AND created = ?",
            params![id, created],
        )?
        else {
            return Ok(false);
        };

        record.revoked = Some(true);
        let json = serde_json::to_string(&record).map_err(storage_error)?;
        let affected = conn
            .execute(
                "UPDATE encryption_key SET key_record = ? WHERE id = ? AND created = ?",
                params![json, id, created],
            )
            .map_err(storage_error)?;
        Ok(affected > 0)
    }
}
