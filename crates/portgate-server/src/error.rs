//! Server-wide error taxonomy
//!
//! Components return their own typed errors; at the service boundary they
//! collapse into [`ServerError`], whose [`ErrorKind`] is what the API layer
//! maps onto status codes.

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::session::SessionError;
use portgate_auth::AuthError;
use portgate_proto::AclError;
use portgate_store::StoreError;
use thiserror::Error;

/// Domain error kinds, independent of the transport the API layer speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Forbidden,
    Unauthorized,
    TooManyRequests,
    InvalidArgument,
    Conflict,
    /// A failure the client itself reported over the transport
    ClientError,
    InfraError,
    Timeout,
}

/// Top-level server error
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    TooManyRequests(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("{0}")]
    Timeout(String),

    #[error("invalid ACL: {0}")]
    Acl(#[from] AclError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential source error: {0}")]
    AuthSource(#[from] AuthError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Session(SessionError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::NotFound(_) => ErrorKind::NotFound,
            ServerError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServerError::Forbidden(_) => ErrorKind::Forbidden,
            ServerError::Unauthorized(_) => ErrorKind::Unauthorized,
            ServerError::TooManyRequests(_) => ErrorKind::TooManyRequests,
            ServerError::InvalidArgument(_) | ServerError::Acl(_) | ServerError::Config(_) => {
                ErrorKind::InvalidArgument
            }
            ServerError::Conflict(_) => ErrorKind::Conflict,
            ServerError::Client(_) => ErrorKind::ClientError,
            ServerError::Timeout(_) => ErrorKind::Timeout,
            ServerError::Store(_)
            | ServerError::AuthSource(_)
            | ServerError::Io(_)
            | ServerError::Identity(_)
            | ServerError::Session(_) => ErrorKind::InfraError,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServerError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServerError::Conflict(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ServerError::InvalidArgument(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServerError::Forbidden(msg.into())
    }
}

impl From<SessionError> for ServerError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Client(msg) => ServerError::Client(msg),
            other => ServerError::Session(other),
        }
    }
}
