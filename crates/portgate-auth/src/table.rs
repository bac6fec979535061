//! Database-table credential source

use crate::{AuthError, ClientAuth, CredentialStore};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

/// Credential source backed by a SQLite table. Always writable.
pub struct TableCredentials {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl TableCredentials {
    /// Open the source over an existing connection. The table name comes
    /// from config and is restricted to identifier characters, everything
    /// else is rejected before it can reach a statement.
    pub fn new(conn: Arc<Mutex<Connection>>, table: impl Into<String>) -> Result<Self, AuthError> {
        let table = table.into();
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(AuthError::Db(rusqlite::Error::InvalidParameterName(table)));
        }

        let store = Self { conn, table };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), AuthError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    password TEXT NOT NULL
                )",
                self.table
            ),
            [],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for TableCredentials {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>, AuthError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT id, password FROM {} WHERE id = ?1", self.table),
                params![id],
                |row| {
                    Ok(ClientAuth {
                        id: row.get(0)?,
                        password: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    async fn all(&self) -> Result<Vec<ClientAuth>, AuthError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, password FROM {} ORDER BY id",
            self.table
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ClientAuth {
                    id: row.get(0)?,
                    password: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn add(&self, auth: ClientAuth) -> Result<(), AuthError> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, password) VALUES (?1, ?2)",
                self.table
            ),
            params![auth.id, auth.password],
        )?;
        if inserted == 0 {
            return Err(AuthError::AlreadyExists(auth.id));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AuthError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            params![id],
        )?;
        if deleted == 0 {
            return Err(AuthError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn is_writable(&self) -> bool {
        true
    }
}
