//! Client groups (`client_groups.db`)
//!
//! A group selects clients by glob patterns over their attributes. A client
//! belongs to the group when every non-empty param set has at least one
//! matching pattern.

use crate::StoreError;
use portgate_proto::ClientInfo;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Glob patterns selecting clients; `*` matches any run of characters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupParams {
    #[serde(default)]
    pub client_id: Vec<String>,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub os: Vec<String>,
    #[serde(default)]
    pub hostname: Vec<String>,
    #[serde(default)]
    pub version: Vec<String>,
    #[serde(default)]
    pub tag: Vec<String>,
    #[serde(default)]
    pub label: Vec<String>,
}

/// A named selection of clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientGroup {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: GroupParams,
}

impl ClientGroup {
    /// Group ids are restricted to `[A-Za-z0-9_\-*]{1,30}`
    pub fn validate_id(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 30
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '*')
    }

    /// Whether the given client satisfies all of this group's params
    pub fn matches(&self, client_id: &str, info: &ClientInfo) -> bool {
        let p = &self.params;

        matches_one(&p.client_id, &[client_id.to_string()])
            && matches_one(&p.name, &[info.name.clone()])
            && matches_one(&p.os, &[info.os.clone()])
            && matches_one(&p.hostname, &[info.hostname.clone()])
            && matches_one(&p.version, &[info.version.clone()])
            && matches_one(&p.tag, &info.tags)
            && matches_one(
                &p.label,
                &info
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<_>>(),
            )
    }
}

/// Empty patterns accept everything; otherwise any pattern matching any
/// value is enough.
fn matches_one(patterns: &[String], values: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns
        .iter()
        .any(|pattern| values.iter().any(|value| wildcard_match(pattern, value)))
}

/// Case-insensitive glob match where `*` matches any run of characters
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();

    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == value;
    }

    let mut rest = value.as_str();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }

    // pattern ended with `*`
    true
}

/// Store for [`ClientGroup`] rows
#[derive(Clone)]
pub struct GroupStore {
    conn: Arc<Mutex<Connection>>,
}

impl GroupStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS client_groups (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                params_json TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create or update a group
    pub fn save(&self, group: &ClientGroup) -> Result<(), StoreError> {
        if !ClientGroup::validate_id(&group.id) {
            return Err(StoreError::InvalidGroupId(group.id.clone()));
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO client_groups (id, description, params_json)
             VALUES (?1, ?2, ?3)",
            params![
                group.id,
                group.description,
                serde_json::to_string(&group.params)?
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<ClientGroup>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let group = conn
            .query_row(
                "SELECT id, description, params_json FROM client_groups WHERE id = ?1",
                params![id],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    pub fn get_all(&self) -> Result<Vec<ClientGroup>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, description, params_json FROM client_groups ORDER BY id")?;
        let rows = stmt
            .query_map([], group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM client_groups WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<ClientGroup> {
    let params_json: String = row.get(2)?;
    Ok(ClientGroup {
        id: row.get(0)?,
        description: row.get(1)?,
        params: serde_json::from_str(&params_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
    })
}
