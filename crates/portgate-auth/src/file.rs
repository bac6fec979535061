//! JSON-file credential source
//!
//! The file is a flat JSON object mapping credential id to password:
//! `{"depot-1": "secret", "depot-2": "other"}`. The map is cached in memory
//! and rewritten atomically-ish (write then rename is left to the operator's
//! filesystem; we truncate in place like the file was created).

use crate::{AuthError, ClientAuth, CredentialStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Credential source backed by a JSON file on disk
#[derive(Debug)]
pub struct FileCredentials {
    path: PathBuf,
    writable: bool,
    cache: RwLock<BTreeMap<String, String>>,
}

impl FileCredentials {
    /// Load the file into memory. `writable` is the config-level gate; the
    /// source refuses mutations when it is false.
    pub fn load(path: impl AsRef<Path>, writable: bool) -> Result<Self, AuthError> {
        let path = path.as_ref().to_path_buf();
        let json = fs::read_to_string(&path)?;
        let cache: BTreeMap<String, String> = serde_json::from_str(&json)?;

        tracing::debug!(
            path = %path.display(),
            count = cache.len(),
            "loaded client credentials file"
        );

        Ok(Self {
            path,
            writable,
            cache: RwLock::new(cache),
        })
    }

    fn persist(&self, cache: &BTreeMap<String, String>) -> Result<(), AuthError> {
        let json = serde_json::to_string_pretty(cache)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentials {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>, AuthError> {
        let cache = self.cache.read().unwrap();
        Ok(cache
            .get(id)
            .map(|password| ClientAuth::new(id, password.clone())))
    }

    async fn all(&self) -> Result<Vec<ClientAuth>, AuthError> {
        let cache = self.cache.read().unwrap();
        Ok(cache
            .iter()
            .map(|(id, password)| ClientAuth::new(id.clone(), password.clone()))
            .collect())
    }

    async fn add(&self, auth: ClientAuth) -> Result<(), AuthError> {
        if !self.writable {
            return Err(AuthError::NotWritable);
        }

        let mut cache = self.cache.write().unwrap();
        if cache.contains_key(&auth.id) {
            return Err(AuthError::AlreadyExists(auth.id));
        }
        cache.insert(auth.id.clone(), auth.password);
        self.persist(&cache)?;

        tracing::info!(auth_id = %auth.id, "added client credential");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AuthError> {
        if !self.writable {
            return Err(AuthError::NotWritable);
        }

        let mut cache = self.cache.write().unwrap();
        if cache.remove(id).is_none() {
            return Err(AuthError::NotFound(id.to_string()));
        }
        self.persist(&cache)?;

        tracing::info!(auth_id = %id, "deleted client credential");
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_load_and_get() {
        let file = write_file(r#"{"depot-1": "pw1", "depot-2": "pw2"}"#);
        let store = FileCredentials::load(file.path(), false).unwrap();

        assert_eq!(
            store.get("depot-1").await.unwrap(),
            Some(ClientAuth::new("depot-1", "pw1"))
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(store.all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_delete_roundtrip_through_disk() {
        let file = write_file(r#"{"depot-1": "pw1"}"#);
        let store = FileCredentials::load(file.path(), true).unwrap();

        store.add(ClientAuth::new("depot-2", "pw2")).await.unwrap();
        assert!(matches!(
            store.add(ClientAuth::new("depot-2", "pw2")).await.unwrap_err(),
            AuthError::AlreadyExists(_)
        ));

        // a fresh load sees the addition
        let reloaded = FileCredentials::load(file.path(), true).unwrap();
        assert!(reloaded.get("depot-2").await.unwrap().is_some());

        store.delete("depot-1").await.unwrap();
        assert!(matches!(
            store.delete("depot-1").await.unwrap_err(),
            AuthError::NotFound(_)
        ));
        let reloaded = FileCredentials::load(file.path(), true).unwrap();
        assert!(reloaded.get("depot-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_gate() {
        let file = write_file(r#"{"depot-1": "pw1"}"#);
        let store = FileCredentials::load(file.path(), false).unwrap();

        assert!(!store.is_writable());
        assert!(matches!(
            store.add(ClientAuth::new("x", "y")).await.unwrap_err(),
            AuthError::NotWritable
        ));
    }

    #[test]
    fn test_malformed_file() {
        let file = write_file("not json");
        assert!(matches!(
            FileCredentials::load(file.path(), false).unwrap_err(),
            AuthError::Parse(_)
        ));
    }
}
