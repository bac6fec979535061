//! Persisted client metadata (`clients.db`)
//!
//! Client records survive server restarts for the duration of the
//! keep-lost-clients window, so operators still see recently disconnected
//! machines after a restart.

use crate::StoreError;
use chrono::{DateTime, Duration, Utc};
use portgate_proto::ClientInfo;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The persisted shape of a client record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredClient {
    pub id: String,
    pub client_auth_id: String,
    /// Source address of the last session, `ip:port`
    pub address: String,
    pub info: ClientInfo,
    pub allowed_user_groups: Vec<String>,
    /// `None` while connected
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Store for [`StoredClient`] rows
#[derive(Clone)]
pub struct ClientStore {
    conn: Arc<Mutex<Connection>>,
}

impl ClientStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                client_auth_id TEXT NOT NULL,
                address TEXT NOT NULL,
                info_json TEXT NOT NULL,
                allowed_user_groups TEXT NOT NULL,
                disconnected_at TEXT
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create or update a client row
    pub fn save(&self, client: &StoredClient) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO clients (
                id, client_auth_id, address, info_json, allowed_user_groups, disconnected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                client.id,
                client.client_auth_id,
                client.address,
                serde_json::to_string(&client.info)?,
                serde_json::to_string(&client.allowed_user_groups)?,
                client.disconnected_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM clients WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_all(&self) -> Result<Vec<StoredClient>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, client_auth_id, address, info_json, allowed_user_groups, disconnected_at
             FROM clients ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], stored_client_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows that are still within the keep-lost window: connected ones and
    /// those whose `disconnected_at + keep_lost` lies in the future.
    pub fn get_non_obsolete(&self, keep_lost: Duration) -> Result<Vec<StoredClient>, StoreError> {
        let cutoff = Utc::now() - keep_lost;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, client_auth_id, address, info_json, allowed_user_groups, disconnected_at
             FROM clients WHERE disconnected_at IS NULL OR disconnected_at > ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![cutoff], stored_client_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete rows whose keep-lost window has passed. Returns the number of
    /// removed rows.
    pub fn delete_obsolete(&self, keep_lost: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - keep_lost;
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM clients WHERE disconnected_at IS NOT NULL AND disconnected_at <= ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn stored_client_from_row(row: &Row<'_>) -> rusqlite::Result<StoredClient> {
    let info_json: String = row.get(3)?;
    let groups_json: String = row.get(4)?;
    Ok(StoredClient {
        id: row.get(0)?,
        client_auth_id: row.get(1)?,
        address: row.get(2)?,
        info: serde_json::from_str(&info_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        allowed_user_groups: serde_json::from_str(&groups_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        disconnected_at: row.get(5)?,
    })
}
