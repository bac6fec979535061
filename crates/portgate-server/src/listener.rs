//! Client listener and handshake
//!
//! Accepts inbound client transports, terminates TLS, verifies the
//! handshake (protocol version, client id shape, credentials, banlist) and
//! hands the authenticated connection to a [`Session`]. Remotes the client
//! asks for in the handshake are re-established right after registration.

use crate::banlist::BanList;
use crate::client::StartTunnelOptions;
use crate::error::ServerError;
use crate::ports::PortDistributor;
use crate::registry::ClientRegistry;
use crate::session::{Session, SessionEvent};
use portgate_auth::CredentialStore;
use portgate_proto::{
    read_message, write_message, Capabilities, Handshake, HandshakeReply, PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// Accepts and authenticates client transports
pub struct ClientListener {
    registry: Arc<ClientRegistry>,
    auth: Arc<dyn CredentialStore>,
    distributor: Arc<PortDistributor>,
    banned_ips: Arc<BanList>,
    events: mpsc::Sender<SessionEvent>,
    fingerprint: String,
    keepalive: Duration,
    check_port_timeout: Duration,
}

impl ClientListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ClientRegistry>,
        auth: Arc<dyn CredentialStore>,
        distributor: Arc<PortDistributor>,
        banned_ips: Arc<BanList>,
        events: mpsc::Sender<SessionEvent>,
        fingerprint: String,
        keepalive: Duration,
        check_port_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            auth,
            distributor,
            banned_ips,
            events,
            fingerprint,
            keepalive,
            check_port_timeout,
        }
    }

    /// Bind and accept until shutdown. Each accepted socket is handled on
    /// its own task; a failed handshake only ends that task.
    pub async fn run(
        self: Arc<Self>,
        listen_address: &str,
        tls: TlsAcceptor,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(listen_address).await?;
        tracing::info!(address = %listen_address, "client listener started");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let ip = peer_addr.ip().to_string();
                        if self.banned_ips.is_banned(&ip) {
                            tracing::debug!(peer = %peer_addr, "connection from banned address dropped");
                            continue;
                        }
                        let listener = self.clone();
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            match tls.accept(socket).await {
                                Ok(stream) => {
                                    listener.handle_connection(stream, peer_addr.to_string()).await;
                                }
                                Err(e) => {
                                    tracing::debug!(peer = %peer_addr, error = %e, "TLS accept failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("client listener stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Drive the handshake on an established transport and register the
    /// session. Generic over the IO so tests can connect through in-memory
    /// pipes.
    pub async fn handle_connection<IO>(&self, mut io: IO, peer_addr: String)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handshake: Handshake = match read_message(&mut io).await {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::debug!(peer = %peer_addr, error = %e, "malformed handshake");
                return;
            }
        };

        let ip = peer_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| peer_addr.clone());

        if let Err(reason) = self.verify_handshake(&handshake).await {
            tracing::info!(
                peer = %peer_addr,
                client_id = %handshake.client_id,
                reason = %reason,
                "handshake rejected"
            );
            self.banned_ips.add(&ip);
            let _ = write_message(&mut io, &HandshakeReply::rejected(reason)).await;
            return;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let reply = HandshakeReply::Ok {
            session_id: session_id.clone(),
            fingerprint: self.fingerprint.clone(),
            capabilities: Capabilities {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        if let Err(e) = write_message(&mut io, &reply).await {
            tracing::debug!(peer = %peer_addr, error = %e, "failed to send handshake reply");
            return;
        }

        let session = Session::start(
            io,
            session_id,
            handshake.client_id.clone(),
            peer_addr.clone(),
            self.keepalive,
            self.events.clone(),
        );

        let entry = match self
            .registry
            .register_session(
                &handshake.client_id,
                &handshake.auth_id,
                &peer_addr,
                handshake.info,
                session.clone(),
            )
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(client_id = %handshake.client_id, error = %e, "registration failed");
                session.close();
                return;
            }
        };

        // re-establish the tunnels the client asked for; a failing remote
        // must not take the fresh session down
        if !handshake.remotes.is_empty() {
            let options = StartTunnelOptions {
                check_remote_port: false,
                check_local_port: true,
                reuse_existing: true,
                check_port_timeout: self.check_port_timeout,
            };
            let mut client = entry.lock().await;
            for remote in handshake.remotes {
                if let Err(e) = client
                    .start_tunnels(&self.distributor, vec![remote.clone()], &options)
                    .await
                {
                    tracing::warn!(
                        client_id = %client.id,
                        remote = %remote,
                        error = %e,
                        "failed to restore tunnel from handshake"
                    );
                }
            }
        }

        tracing::info!(
            client_id = %handshake.client_id,
            peer = %peer_addr,
            "client connected"
        );
    }

    async fn verify_handshake(&self, handshake: &Handshake) -> Result<(), String> {
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version {} (server speaks {})",
                handshake.protocol_version, PROTOCOL_VERSION
            ));
        }

        if !is_valid_client_id(&handshake.client_id) {
            return Err("invalid client id".to_string());
        }

        match self
            .auth
            .validate(&handshake.auth_id, &handshake.password)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err("authentication failed".to_string()),
            Err(e) => {
                tracing::error!(error = %e, "credential source failure");
                Err("authentication failed".to_string())
            }
        }
    }
}

/// Client ids are device-derived, 64 hex characters
fn is_valid_client_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())
}
