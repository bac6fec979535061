//! Client credential sources
//!
//! Clients authenticate their sessions with an `(id, password)` pair. The
//! pair can come from a single static value, a JSON file, or a database
//! table; all three are exposed through the [`CredentialStore`] capability
//! trait. Mutations are only available on sources that declare themselves
//! writable.

mod file;
mod single;
mod table;

pub use file::FileCredentials;
pub use single::SingleCredential;
pub use table::TableCredentials;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An `(id, password)` pair a client presents during the handshake.
///
/// Several client records may bind to the same credential id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuth {
    pub id: String,
    pub password: String,
}

impl ClientAuth {
    pub fn new(id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            password: password.into(),
        }
    }
}

/// Credential source errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("client auth with id {0:?} not found")]
    NotFound(String),

    #[error("client auth with id {0:?} already exists")]
    AlreadyExists(String),

    #[error("credential source is read-only")]
    NotWritable,

    #[error("failed to read credential file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse credential file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("credential database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Capability trait over the configured credential source
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a credential by id
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>, AuthError>;

    /// List every credential the source knows
    async fn all(&self) -> Result<Vec<ClientAuth>, AuthError>;

    /// Add a new credential. Fails with [`AuthError::NotWritable`] on
    /// read-only sources and [`AuthError::AlreadyExists`] on duplicates.
    async fn add(&self, auth: ClientAuth) -> Result<(), AuthError>;

    /// Remove a credential by id
    async fn delete(&self, id: &str) -> Result<(), AuthError>;

    /// Whether this source accepts `add`/`delete`
    fn is_writable(&self) -> bool;

    /// Check a presented pair against the source
    async fn validate(&self, id: &str, password: &str) -> Result<bool, AuthError> {
        Ok(self
            .get(id)
            .await?
            .map(|auth| auth.password == password)
            .unwrap_or(false))
    }
}
