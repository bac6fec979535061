//! Long-term server identity
//!
//! The server authenticates itself with a self-signed certificate over an
//! Ed25519 key. The key is derived deterministically from the configured
//! seed, or generated once and persisted in the data directory. Clients pin
//! the published fingerprint (SHA-256 over the certificate DER) to detect
//! MITM.

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

const KEY_FILE: &str = "portgated-key";

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key handling failed: {0}")]
    Key(String),

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("TLS configuration failed: {0}")]
    Tls(#[from] rustls::Error),
}

/// The server key, certificate and fingerprint
pub struct Identity {
    cert_der: Vec<u8>,
    key_pkcs8_der: Vec<u8>,
    fingerprint: String,
}

impl Identity {
    /// Build the identity from the seed, or from (and into) the persisted
    /// key file when no seed is configured.
    pub fn load_or_generate(data_dir: &Path, key_seed: &str) -> Result<Self, IdentityError> {
        let signing_key = if key_seed.is_empty() {
            load_or_create_key(data_dir)?
        } else {
            let digest: [u8; 32] = Sha256::digest(key_seed.as_bytes()).into();
            SigningKey::from_bytes(&digest)
        };

        Self::from_signing_key(&signing_key)
    }

    fn from_signing_key(signing_key: &SigningKey) -> Result<Self, IdentityError> {
        let key_pkcs8 = signing_key
            .to_pkcs8_der()
            .map_err(|e| IdentityError::Key(e.to_string()))?;
        let key_pkcs8_der = key_pkcs8.as_bytes().to_vec();

        let key_pair = rcgen::KeyPair::try_from(key_pkcs8_der.as_slice())?;
        let params = rcgen::CertificateParams::new(vec!["portgate".to_string()])?;
        let cert = params.self_signed(&key_pair)?;
        let cert_der = cert.der().to_vec();

        let fingerprint = fingerprint(&cert_der);

        Ok(Self {
            cert_der,
            key_pkcs8_der,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// TLS acceptor configuration for the client listener
    pub fn tls_server_config(&self) -> Result<rustls::ServerConfig, IdentityError> {
        let cert = CertificateDer::from(self.cert_der.clone());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_pkcs8_der.clone()));
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;
        Ok(config)
    }
}

fn fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    digest
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Read the persisted key, or generate and persist one
fn load_or_create_key(data_dir: &Path) -> Result<SigningKey, IdentityError> {
    let path = data_dir.join(KEY_FILE);
    if path.exists() {
        let hex = std::fs::read_to_string(&path)?;
        let bytes = decode_hex(hex.trim())
            .ok_or_else(|| IdentityError::Key(format!("malformed key file {:?}", path)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::Key(format!("wrong key length in {:?}", path)))?;
        return Ok(SigningKey::from_bytes(&bytes));
    }

    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let hex: String = signing_key
        .to_bytes()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect();
    std::fs::write(&path, hex)?;
    tracing::info!(path = %path.display(), "generated new server key");
    Ok(signing_key)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = Identity::load_or_generate(dir.path(), "my-seed").unwrap();
        let b = Identity::load_or_generate(dir.path(), "my-seed").unwrap();
        let c = Identity::load_or_generate(dir.path(), "other-seed").unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_generated_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let a = Identity::load_or_generate(dir.path(), "").unwrap();
        let b = Identity::load_or_generate(dir.path(), "").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(dir.path().join(KEY_FILE).exists());
    }

    #[test]
    fn test_fingerprint_format() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(dir.path(), "seed").unwrap();
        let parts: Vec<&str> = identity.fingerprint().split(':').collect();
        assert_eq!(parts.len(), 32);
        assert!(parts.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn test_tls_config_builds() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::load_or_generate(dir.path(), "seed").unwrap();
        assert!(identity.tls_server_config().is_ok());
    }
}
