//! Control messages and request payloads
//!
//! All control traffic rides on stream 0 as bincode-encoded [`ControlMessage`]
//! frames. Requests carry a string `request_type` and an opaque payload; the
//! receiver rejects unknown request types.

use crate::models::{ClientInfo, Remote};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Server -> client: execute a command or script (payload = full [`Job`])
pub const REQUEST_RUN_CMD: &str = "run_cmd";
/// Server -> client: probe whether a client-side port is open
pub const REQUEST_CHECK_PORT: &str = "check_port";
/// Server -> client: push a script body, reply with the stored path
pub const REQUEST_CREATE_FILE: &str = "create_file";
/// Server -> client: re-run the pending-updates collector, no reply expected
pub const REQUEST_REFRESH_UPDATES_STATUS: &str = "refresh_updates_status";
/// Client -> server unsolicited: a job reached a terminal state (payload = [`Job`])
pub const PUSH_CMD_RESULT: &str = "cmd_result";

/// Control envelope exchanged on stream 0
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Synchronous request; the peer must answer with a `Response` of the same id
    Request {
        id: u64,
        request_type: String,
        payload: Vec<u8>,
    },
    /// Reply to a request. `Err` carries a failure the remote peer reported
    /// itself, as opposed to a transport breakdown.
    Response {
        id: u64,
        payload: Result<Vec<u8>, String>,
    },
    /// One-way message, no reply expected
    Push {
        request_type: String,
        payload: Vec<u8>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Encode a request payload
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// Decode a request payload
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

/// First message a client writes after the transport is up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    /// Protocol version; sessions with a mismatch are rejected
    pub protocol_version: u32,
    /// Client software version, gates feature availability (e.g. scripts)
    pub client_version: String,
    /// Credential id presented for authentication
    pub auth_id: String,
    pub password: String,
    /// Stable device-derived client identity (64 hex chars)
    pub client_id: String,
    pub info: ClientInfo,
    /// Tunnels the client wants re-established on (re)connect
    pub remotes: Vec<Remote>,
}

/// Server capabilities advertised to the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capabilities {
    pub server_version: String,
}

/// Server's answer to a [`Handshake`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HandshakeReply {
    Ok {
        session_id: String,
        /// SHA-256 fingerprint of the server certificate, lets clients detect MITM
        fingerprint: String,
        capabilities: Capabilities,
    },
    Err {
        reason: String,
    },
}

impl HandshakeReply {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandshakeReply::Err {
            reason: reason.into(),
        }
    }
}

/// `run_cmd` reply: the client accepted the job and started the process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCmdResponse {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// `check_port` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckPortRequest {
    /// Target as `host:port` on the client side
    pub host_port: String,
    pub timeout_secs: u64,
}

/// `check_port` reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckPortResponse {
    pub open: bool,
    pub err_msg: String,
}

/// `create_file` request: push a script body to the client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateFileRequest {
    pub content: Vec<u8>,
    pub interpreter: String,
}

/// `create_file` reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateFileResponse {
    /// Absolute path of the stored script on the client
    pub path: String,
}

/// Payload of an `Open` frame: where the accepted connection should go
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenStream {
    /// Target as `host:port` on the client side
    pub target: String,
}
