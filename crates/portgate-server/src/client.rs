//! Client records
//!
//! One [`Client`] per known machine, connected or within the keep-lost
//! window. The registry hands out `Arc<Mutex<Client>>`; tunnel creation,
//! teardown and the reconnect-resume sequence all run under that mutex.

use crate::error::ServerError;
use crate::ports::{PortDistributor, PortError};
use crate::session::{Session, SessionError};
use crate::tunnel::{Tunnel, TunnelError, TunnelInfo};
use chrono::{DateTime, Utc};
use portgate_proto::{
    CheckPortRequest, CheckPortResponse, ClientInfo, Remote, TunnelAcl, REQUEST_CHECK_PORT,
};
use portgate_store::StoredClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Longest accepted tunnel scheme label
const URI_SCHEME_MAX_LENGTH: usize = 15;

/// Options of one tunnel-creation call
#[derive(Debug, Clone)]
pub struct StartTunnelOptions {
    /// Probe the remote port over the session before starting
    pub check_remote_port: bool,
    /// Reject a caller-specified local port that is already busy
    pub check_local_port: bool,
    /// Return the existing tunnel instead of failing on an identical remote
    /// (the client-initiated handshake path)
    pub reuse_existing: bool,
    pub check_port_timeout: Duration,
}

impl Default for StartTunnelOptions {
    fn default() -> Self {
        Self {
            check_remote_port: true,
            check_local_port: true,
            reuse_existing: false,
            check_port_timeout: Duration::from_secs(2),
        }
    }
}

/// Connection state surfaced to listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Serializable client view for the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientView {
    pub id: String,
    pub name: String,
    pub os: String,
    pub os_version: String,
    pub hostname: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub tags: Vec<String>,
    pub version: String,
    pub address: String,
    pub client_auth_id: String,
    pub allowed_user_groups: Vec<String>,
    pub connection_state: ConnectionState,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub tunnels: Vec<TunnelInfo>,
}

/// A managed machine known to the registry
pub struct Client {
    pub id: String,
    pub client_auth_id: String,
    /// Source address of the current (or last) session
    pub address: String,
    pub info: ClientInfo,
    pub allowed_user_groups: Vec<String>,
    pub session: Option<Arc<Session>>,
    pub tunnels: Vec<Arc<Tunnel>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    next_tunnel_id: u64,
}

impl Client {
    pub fn new(
        id: String,
        client_auth_id: String,
        address: String,
        info: ClientInfo,
        session: Arc<Session>,
    ) -> Self {
        Self {
            id,
            client_auth_id,
            address,
            info,
            allowed_user_groups: Vec::new(),
            session: Some(session),
            tunnels: Vec::new(),
            disconnected_at: None,
            next_tunnel_id: 0,
        }
    }

    /// Rebuild a disconnected record from its persisted shape
    pub fn from_stored(stored: StoredClient) -> Self {
        Self {
            id: stored.id,
            client_auth_id: stored.client_auth_id,
            address: stored.address,
            info: stored.info,
            allowed_user_groups: stored.allowed_user_groups,
            session: None,
            tunnels: Vec::new(),
            disconnected_at: Some(stored.disconnected_at.unwrap_or_else(Utc::now)),
            next_tunnel_id: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Tunnel ids are unique per client and strictly increasing
    fn new_tunnel_id(&mut self) -> String {
        self.next_tunnel_id += 1;
        self.next_tunnel_id.to_string()
    }

    pub fn find_tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels
            .iter()
            .find(|t| t.id == tunnel_id && !t.is_terminated())
            .cloned()
    }

    /// Drop tunnels the idle watchdog closed on its own
    fn prune_tunnels(&mut self) {
        self.tunnels.retain(|t| !t.is_terminated());
    }

    fn find_tunnel_by_remote(&self, remote: &Remote, acl: &TunnelAcl) -> Option<Arc<Tunnel>> {
        self.tunnels.iter().find(|t| t.equals(remote, acl)).cloned()
    }

    /// Whether a user with these groups may see and use this client. An
    /// empty allow-list means visible to all.
    pub fn allows_user_groups(&self, groups: &[String]) -> bool {
        self.allowed_user_groups.is_empty()
            || self
                .allowed_user_groups
                .iter()
                .any(|allowed| groups.contains(allowed))
    }

    /// Start tunnels for the given remotes, serialized under the client
    /// mutex by the caller.
    pub async fn start_tunnels(
        &mut self,
        distributor: &PortDistributor,
        remotes: Vec<Remote>,
        options: &StartTunnelOptions,
    ) -> Result<Vec<Arc<Tunnel>>, ServerError> {
        let mut started = Vec::with_capacity(remotes.len());
        for remote in remotes {
            started.push(self.start_tunnel(distributor, remote, options).await?);
        }
        Ok(started)
    }

    async fn start_tunnel(
        &mut self,
        distributor: &PortDistributor,
        mut remote: Remote,
        options: &StartTunnelOptions,
    ) -> Result<Arc<Tunnel>, ServerError> {
        self.prune_tunnels();
        let session = self
            .session
            .clone()
            .ok_or_else(|| ServerError::conflict("client is disconnected"))?;

        if let Some(scheme) = &remote.scheme {
            if scheme.len() > URI_SCHEME_MAX_LENGTH {
                return Err(ServerError::invalid("invalid URI scheme: exceeds the max length"));
            }
        }

        let acl = match &remote.acl {
            Some(acl_str) => TunnelAcl::parse(acl_str)?,
            None => TunnelAcl::allow_all(),
        };

        if let Some(existing) = self.find_tunnel_by_remote(&remote, &acl) {
            if options.reuse_existing {
                return Ok(existing);
            }
            return Err(ServerError::conflict("tunnel already exists"));
        }
        // same remote endpoint and ACL under a different local port
        if self
            .tunnels
            .iter()
            .any(|t| t.remote.remote() == remote.remote() && t.acl == acl)
        {
            return Err(ServerError::conflict(format!(
                "tunnel to port {} already exists",
                remote.remote_port
            )));
        }

        if remote.is_local_specified() {
            if options.check_local_port
                && map_port_err(distributor.is_port_busy(remote.protocol, remote.local_port))?
            {
                return Err(ServerError::conflict(format!(
                    "port {} already in use",
                    remote.local_port
                )));
            }
        } else {
            remote.local_port =
                distributor
                    .get_random_port(remote.protocol)
                    .map_err(|e| match e {
                        PortError::NoPorts => {
                            ServerError::conflict("no tunnel ports available")
                        }
                        PortError::Probe(io) => ServerError::Io(io),
                    })?;
        }

        if options.check_remote_port {
            self.check_remote_port(&session, &remote, options.check_port_timeout)
                .await?;
        }

        let tunnel_id = self.new_tunnel_id();
        let tunnel = Tunnel::start(session, tunnel_id, remote, acl)
            .await
            .map_err(map_tunnel_err)?;
        self.tunnels.push(tunnel.clone());
        Ok(tunnel)
    }

    async fn check_remote_port(
        &self,
        session: &Arc<Session>,
        remote: &Remote,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        let request = CheckPortRequest {
            host_port: remote.remote(),
            timeout_secs: timeout.as_secs(),
        };
        let response: CheckPortResponse = session
            .request(REQUEST_CHECK_PORT, &request)
            .await
            .map_err(|e| match e {
                SessionError::Client(reason) => ServerError::Client(reason),
                other => ServerError::from(other),
            })?;

        if !response.open {
            return Err(ServerError::conflict(format!(
                "port {} is not in listening state: {}",
                remote.remote_port, response.err_msg
            )));
        }
        Ok(())
    }

    /// Tear down one tunnel. Non-forced teardown is refused while the
    /// tunnel has open connections.
    pub fn terminate_tunnel(&mut self, tunnel_id: &str, force: bool) -> Result<(), ServerError> {
        self.prune_tunnels();
        let tunnel = self
            .find_tunnel(tunnel_id)
            .ok_or_else(|| ServerError::not_found("tunnel not found"))?;

        tracing::info!(client_id = %self.id, tunnel_id = %tunnel.id, force, "terminating tunnel");
        tunnel.terminate(force).map_err(map_tunnel_err)?;
        self.tunnels.retain(|t| t.id != tunnel_id);
        Ok(())
    }

    /// Force-close every tunnel; used on disconnect and session replacement
    pub fn close_all_tunnels(&mut self) {
        for tunnel in &self.tunnels {
            let _ = tunnel.terminate(true);
        }
        self.tunnels.clear();
    }

    pub fn to_stored(&self) -> StoredClient {
        StoredClient {
            id: self.id.clone(),
            client_auth_id: self.client_auth_id.clone(),
            address: self.address.clone(),
            info: self.info.clone(),
            allowed_user_groups: self.allowed_user_groups.clone(),
            disconnected_at: self.disconnected_at,
        }
    }

    pub fn view(&self) -> ClientView {
        ClientView {
            id: self.id.clone(),
            name: self.info.name.clone(),
            os: self.info.os.clone(),
            os_version: self.info.os_version.clone(),
            hostname: self.info.hostname.clone(),
            ipv4: self.info.ipv4.clone(),
            ipv6: self.info.ipv6.clone(),
            tags: self.info.tags.clone(),
            version: self.info.version.clone(),
            address: self.address.clone(),
            client_auth_id: self.client_auth_id.clone(),
            allowed_user_groups: self.allowed_user_groups.clone(),
            connection_state: self.connection_state(),
            disconnected_at: self.disconnected_at,
            tunnels: self
                .tunnels
                .iter()
                .filter(|t| !t.is_terminated())
                .map(|t| t.info())
                .collect(),
        }
    }
}

fn map_port_err(result: Result<bool, PortError>) -> Result<bool, ServerError> {
    result.map_err(|e| match e {
        PortError::NoPorts => ServerError::conflict("no tunnel ports available"),
        PortError::Probe(io) => ServerError::Io(io),
    })
}

fn map_tunnel_err(err: TunnelError) -> ServerError {
    match err {
        TunnelError::UnsupportedProtocol(p) => {
            ServerError::invalid(format!("unsupported tunnel protocol {}", p))
        }
        TunnelError::Bind(addr, e) => {
            ServerError::conflict(format!("failed to bind {}: {}", addr, e))
        }
        TunnelError::StillActive => ServerError::conflict("tunnel has active connections"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> Client {
        Client::from_stored(StoredClient {
            id: "c1".to_string(),
            client_auth_id: "auth-1".to_string(),
            address: "203.0.113.9:50000".to_string(),
            info: ClientInfo::default(),
            allowed_user_groups: vec![],
            disconnected_at: Some(Utc::now()),
        })
    }

    #[test]
    fn test_allows_user_groups() {
        let mut client = offline_client();
        // empty allow-list is visible to everyone
        assert!(client.allows_user_groups(&["devs".to_string()]));
        assert!(client.allows_user_groups(&[]));

        client.allowed_user_groups = vec!["ops".to_string()];
        assert!(client.allows_user_groups(&["ops".to_string(), "devs".to_string()]));
        assert!(!client.allows_user_groups(&["devs".to_string()]));
        assert!(!client.allows_user_groups(&[]));
    }

    #[test]
    fn test_tunnel_ids_strictly_increase() {
        let mut client = offline_client();
        assert_eq!(client.new_tunnel_id(), "1");
        assert_eq!(client.new_tunnel_id(), "2");
        assert_eq!(client.new_tunnel_id(), "3");
    }

    #[tokio::test]
    async fn test_start_tunnel_requires_session() {
        let mut client = offline_client();
        let distributor = PortDistributor::with_pools(
            std::collections::BTreeSet::from([20000]),
            std::collections::HashSet::from([20000]),
            std::collections::HashSet::new(),
        );

        let err = client
            .start_tunnels(
                &distributor,
                vec![Remote::new("127.0.0.1", 22)],
                &StartTunnelOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn test_connection_state() {
        let client = offline_client();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
    }
}
