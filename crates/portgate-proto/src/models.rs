//! Shared models exchanged between server, clients and the stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Transport protocols a tunnel can forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    /// Synthetic protocol: the port must be free for both TCP and UDP
    #[serde(rename = "tcp+udp")]
    TcpUdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::TcpUdp => "tcp+udp",
        }
    }

    /// Concrete sub-protocols backing this protocol
    pub fn sub_protocols(&self) -> &'static [Protocol] {
        match self {
            Protocol::Tcp => &[Protocol::Tcp],
            Protocol::Udp => &[Protocol::Udp],
            Protocol::TcpUdp => &[Protocol::Tcp, Protocol::Udp],
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tcp+udp" => Ok(Protocol::TcpUdp),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// A requested port forward: server-side `local` endpoint to client-side
/// `remote` endpoint. `local_port == 0` asks the server to allocate one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub scheme: Option<String>,
    /// Raw ACL string as supplied by the operator, comma-separated IPv4 CIDRs
    pub acl: Option<String>,
    pub idle_timeout_minutes: u64,
    /// Optional hard auto-close duration, takes precedence over the idle timeout
    pub auto_close_secs: Option<u64>,
}

impl Remote {
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_host: "0.0.0.0".to_string(),
            local_port: 0,
            remote_host: remote_host.into(),
            remote_port,
            protocol: Protocol::Tcp,
            scheme: None,
            acl: None,
            idle_timeout_minutes: 0,
            auto_close_secs: None,
        }
    }

    /// Client-side endpoint as `host:port`
    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Server-side endpoint as `host:port`
    pub fn local(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Whether the caller pinned a specific local port
    pub fn is_local_specified(&self) -> bool {
        self.local_port != 0
    }

    /// True when both endpoints match, ignoring ACL and metadata
    pub fn same_endpoints(&self, other: &Remote) -> bool {
        self.remote() == other.remote() && self.local() == other.local()
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local(), self.remote())
    }
}

/// Metadata a client reports about itself during the handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub version: String,
}

/// Terminal and non-terminal job states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Successful,
    Failed,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "unknown" => Ok(JobStatus::Unknown),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Captured output of a finished job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub stdout: String,
    pub stderr: String,
}

/// A single command or script execution on one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub status: JobStatus,
    pub client_id: String,
    pub client_name: String,
    /// Parent multi-job, when this job is a fan-out child
    pub multi_job_id: Option<String>,
    pub schedule_id: Option<String>,
    pub command: String,
    pub interpreter: String,
    pub cwd: String,
    pub is_sudo: bool,
    pub is_script: bool,
    pub has_shebang: bool,
    pub created_by: String,
    pub timeout_sec: i64,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<JobResult>,
}

impl Job {
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            jid: self.jid.clone(),
            status: self.status,
            finished_at: self.finished_at,
        }
    }
}

/// Compact job view for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub jid: String,
    pub status: JobStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Parent record of a fan-out against many clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiJob {
    pub jid: String,
    pub started_at: DateTime<Utc>,
    pub created_by: String,
    pub client_ids: Vec<String>,
    pub group_ids: Vec<String>,
    pub command: String,
    pub interpreter: String,
    pub cwd: String,
    pub is_sudo: bool,
    pub is_script: bool,
    pub has_shebang: bool,
    pub timeout_sec: i64,
    pub concurrent: bool,
    pub abort_on_error: bool,
    /// Filled on read, never persisted with the parent row
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl MultiJob {
    pub fn summary(&self) -> MultiJobSummary {
        MultiJobSummary {
            jid: self.jid.clone(),
            started_at: self.started_at,
            created_by: self.created_by.clone(),
        }
    }
}

/// Compact multi-job view for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiJobSummary {
    pub jid: String,
    pub started_at: DateTime<Utc>,
    pub created_by: String,
}
