//! Ephemeral tunnels
//!
//! A tunnel binds a server-side TCP listener and forwards every accepted
//! connection over the owning client's session to a remote endpoint on the
//! client side. Accepts are gated by the tunnel ACL; an idle watchdog tears
//! the tunnel down after a period with no connections and no traffic.

use crate::session::Session;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use portgate_proto::{Protocol, Remote, TunnelAcl};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("unsupported tunnel protocol {0}")]
    UnsupportedProtocol(Protocol),

    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("tunnel has active connections")]
    StillActive,
}

/// Serializable tunnel view for listings and API responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub scheme: Option<String>,
    pub acl: Option<String>,
    pub idle_timeout_minutes: u64,
    pub created_at: DateTime<Utc>,
}

/// A running tunnel, owned by exactly one client
#[derive(Debug)]
pub struct Tunnel {
    pub id: String,
    pub remote: Remote,
    pub acl: TunnelAcl,
    pub created_at: DateTime<Utc>,
    active_conns: Arc<AtomicUsize>,
    last_activity: Arc<Mutex<Instant>>,
    shutdown: watch::Sender<bool>,
}

impl Tunnel {
    /// Bind the listener and start the accept loop. The `remote` must carry
    /// a concrete local port; allocation happens in the caller.
    pub async fn start(
        session: Arc<Session>,
        id: String,
        remote: Remote,
        acl: TunnelAcl,
    ) -> Result<Arc<Self>, TunnelError> {
        if remote.protocol != Protocol::Tcp {
            return Err(TunnelError::UnsupportedProtocol(remote.protocol));
        }

        let bind_addr = remote.local();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| TunnelError::Bind(bind_addr.clone(), e))?;

        let (shutdown, _) = watch::channel(false);
        let tunnel = Arc::new(Self {
            id,
            remote,
            acl,
            created_at: Utc::now(),
            active_conns: Arc::new(AtomicUsize::new(0)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            shutdown,
        });

        tracing::info!(
            tunnel_id = %tunnel.id,
            client_id = %session.client_id(),
            local = %tunnel.remote.local(),
            remote = %tunnel.remote.remote(),
            "tunnel started"
        );

        tokio::spawn(accept_loop(tunnel.clone(), listener, session));

        Ok(tunnel)
    }

    /// How long the watchdog tolerates inactivity. `auto_close` wins over
    /// the idle timeout when both are set; zero disables the watchdog.
    fn idle_timeout(&self) -> Option<Duration> {
        if let Some(secs) = self.remote.auto_close_secs {
            if secs > 0 {
                return Some(Duration::from_secs(secs));
            }
        }
        if self.remote.idle_timeout_minutes > 0 {
            return Some(Duration::from_secs(self.remote.idle_timeout_minutes * 60));
        }
        None
    }

    /// Stop the tunnel. Non-forced termination is refused while connections
    /// are open; `force` closes the listener and every in-flight connection.
    pub fn terminate(&self, force: bool) -> Result<(), TunnelError> {
        if !force && self.active_conns.load(Ordering::SeqCst) > 0 {
            return Err(TunnelError::StillActive);
        }
        self.shutdown.send_replace(true);
        Ok(())
    }

    pub fn active_connections(&self) -> usize {
        self.active_conns.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Whether this tunnel serves the same forward with the same ACL
    pub fn equals(&self, remote: &Remote, acl: &TunnelAcl) -> bool {
        self.remote.same_endpoints(remote) && self.acl == *acl
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            local_host: self.remote.local_host.clone(),
            local_port: self.remote.local_port,
            remote_host: self.remote.remote_host.clone(),
            remote_port: self.remote.remote_port,
            protocol: self.remote.protocol,
            scheme: self.remote.scheme.clone(),
            acl: self.remote.acl.clone(),
            idle_timeout_minutes: self.remote.idle_timeout_minutes,
            created_at: self.created_at,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

async fn accept_loop(tunnel: Arc<Tunnel>, listener: TcpListener, session: Arc<Session>) {
    let mut shutdown = tunnel.shutdown.subscribe();
    // a teardown racing the task startup is only visible in the value
    if *shutdown.borrow() {
        return;
    }
    let idle_timeout = tunnel.idle_timeout();
    // the watchdog only needs coarse ticks
    let check_every = idle_timeout
        .map(|t| (t / 4).max(Duration::from_millis(50)))
        .unwrap_or(Duration::from_secs(3600));

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    if !tunnel.acl.check(peer_addr.ip()) {
                        tracing::debug!(
                            tunnel_id = %tunnel.id,
                            peer = %peer_addr,
                            "connection denied by ACL"
                        );
                        continue;
                    }
                    tunnel.touch();
                    tokio::spawn(handle_connection(
                        tunnel.clone(),
                        session.clone(),
                        socket,
                        peer_addr.to_string(),
                    ));
                }
                Err(e) => {
                    tracing::error!(tunnel_id = %tunnel.id, error = %e, "accept failed");
                }
            },
            _ = tokio::time::sleep(check_every) => {
                if let Some(timeout) = idle_timeout {
                    if tunnel.active_connections() == 0 && tunnel.idle_for() >= timeout {
                        tracing::info!(tunnel_id = %tunnel.id, "tunnel idle, closing");
                        let _ = tunnel.terminate(true);
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!(tunnel_id = %tunnel.id, "tunnel stopped");
}

async fn handle_connection(
    tunnel: Arc<Tunnel>,
    session: Arc<Session>,
    socket: TcpStream,
    peer_addr: String,
) {
    tunnel.active_conns.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(tunnel_id = %tunnel.id, peer = %peer_addr, "connection accepted");

    if let Err(e) = splice(&tunnel, &session, socket).await {
        tracing::debug!(tunnel_id = %tunnel.id, peer = %peer_addr, error = %e, "connection ended");
    }

    tunnel.active_conns.fetch_sub(1, Ordering::SeqCst);
    tunnel.touch();
}

/// Pump bytes between the accepted socket and a fresh session stream until
/// either side closes or the tunnel is torn down.
async fn splice(
    tunnel: &Arc<Tunnel>,
    session: &Arc<Session>,
    socket: TcpStream,
) -> Result<(), crate::session::SessionError> {
    let mut shutdown = tunnel.shutdown.subscribe();
    if *shutdown.borrow() {
        return Ok(());
    }
    let mut stream = session.open_stream(&tunnel.remote.remote()).await?;
    let (mut socket_rd, mut socket_wr) = socket.into_split();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = socket_rd.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tunnel.touch();
                    stream.send(Bytes::copy_from_slice(&buf[..n])).await?;
                }
            },
            chunk = stream.recv() => match chunk {
                Some(chunk) => {
                    tunnel.touch();
                    if socket_wr.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = socket_wr.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_with(idle_minutes: u64, auto_close_secs: Option<u64>) -> Remote {
        let mut remote = Remote::new("127.0.0.1", 80);
        remote.idle_timeout_minutes = idle_minutes;
        remote.auto_close_secs = auto_close_secs;
        remote
    }

    fn bare_tunnel(remote: Remote) -> Tunnel {
        let (shutdown, _) = watch::channel(false);
        Tunnel {
            id: "1".to_string(),
            remote,
            acl: TunnelAcl::allow_all(),
            created_at: Utc::now(),
            active_conns: Arc::new(AtomicUsize::new(0)),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            shutdown,
        }
    }

    #[test]
    fn test_idle_timeout_precedence() {
        assert_eq!(bare_tunnel(remote_with(0, None)).idle_timeout(), None);
        assert_eq!(
            bare_tunnel(remote_with(5, None)).idle_timeout(),
            Some(Duration::from_secs(300))
        );
        // auto_close wins over the idle timeout
        assert_eq!(
            bare_tunnel(remote_with(5, Some(30))).idle_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            bare_tunnel(remote_with(5, Some(0))).idle_timeout(),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_terminate_without_force_requires_no_conns() {
        let tunnel = bare_tunnel(remote_with(0, None));
        tunnel.active_conns.store(1, Ordering::SeqCst);
        assert!(matches!(
            tunnel.terminate(false),
            Err(TunnelError::StillActive)
        ));
        assert!(!tunnel.is_terminated());

        tunnel.terminate(true).unwrap();
        assert!(tunnel.is_terminated());
    }

    #[test]
    fn test_equals_compares_endpoints_and_acl() {
        let mut remote = Remote::new("127.0.0.1", 80);
        remote.local_port = 20000;
        let tunnel = bare_tunnel(remote.clone());

        assert!(tunnel.equals(&remote, &TunnelAcl::allow_all()));

        let acl = TunnelAcl::parse("10.0.0.0/8").unwrap();
        assert!(!tunnel.equals(&remote, &acl));

        let mut other = remote.clone();
        other.remote_port = 81;
        assert!(!tunnel.equals(&other, &TunnelAcl::allow_all()));
    }
}
