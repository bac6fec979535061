//! Static single-pair credential source

use crate::{AuthError, ClientAuth, CredentialStore};
use async_trait::async_trait;

/// The one pair configured inline in the server config. Read-only.
#[derive(Debug, Clone)]
pub struct SingleCredential {
    auth: ClientAuth,
}

impl SingleCredential {
    pub fn new(id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            auth: ClientAuth::new(id, password),
        }
    }
}

#[async_trait]
impl CredentialStore for SingleCredential {
    async fn get(&self, id: &str) -> Result<Option<ClientAuth>, AuthError> {
        if self.auth.id == id {
            Ok(Some(self.auth.clone()))
        } else {
            Ok(None)
        }
    }

    async fn all(&self) -> Result<Vec<ClientAuth>, AuthError> {
        Ok(vec![self.auth.clone()])
    }

    async fn add(&self, _auth: ClientAuth) -> Result<(), AuthError> {
        Err(AuthError::NotWritable)
    }

    async fn delete(&self, _id: &str) -> Result<(), AuthError> {
        Err(AuthError::NotWritable)
    }

    fn is_writable(&self) -> bool {
        false
    }
}
