//! Server assembly
//!
//! Builds every component out of the configuration, wires the session event
//! router and the scheduled sweepers, and exposes the operations the
//! external HTTP API layer calls into.

use crate::banlist::{BanList, MaxBadAttemptsBanList};
use crate::client::StartTunnelOptions;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::identity::Identity;
use crate::listener::ClientListener;
use crate::ports::PortDistributor;
use crate::registry::{CleanupClientsTask, ClientRegistry, User};
use crate::scheduler::{self, Task};
use crate::session::SessionEvent;
use crate::tunnel::TunnelInfo;
use portgate_auth::{
    AuthError, ClientAuth, CredentialStore, FileCredentials, SingleCredential, TableCredentials,
};
use portgate_proto::{decode_payload, Job, Remote, PUSH_CMD_RESULT};
use portgate_store::{ClientStore, GroupStore, JobStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// API auth attempts tolerated before a visitor is locked out
const MAX_API_BAD_ATTEMPTS: usize = 5;

/// The assembled portgate server core
pub struct Server {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
    listener: Arc<ClientListener>,
    auth: Arc<dyn CredentialStore>,
    distributor: Arc<PortDistributor>,
    /// Fed by the client listener on failed handshakes
    banned_client_ips: Arc<BanList>,
    /// Handed to the HTTP layer for IP- and username-scoped throttling
    banned_api_ips: Arc<MaxBadAttemptsBanList>,
    banned_api_users: Arc<MaxBadAttemptsBanList>,
    fingerprint: String,
    tls: TlsAcceptor,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let identity = Identity::load_or_generate(&config.data_dir, &config.key_seed)?;
        let fingerprint = identity.fingerprint().to_string();
        tracing::info!(fingerprint = %fingerprint, "server identity ready");

        let fingerprint_file = config.data_dir.join("portgated-fingerprint.txt");
        if let Err(e) = std::fs::write(&fingerprint_file, &fingerprint) {
            tracing::error!(
                path = %fingerprint_file.display(),
                error = %e,
                "failed to store fingerprint file"
            );
        }

        let job_store = JobStore::open(config.data_dir.join("jobs.db"))?;
        let client_store = ClientStore::open(config.data_dir.join("clients.db"))?;
        let group_store = GroupStore::open(config.data_dir.join("client_groups.db"))?;

        let auth = build_credential_store(&config)?;

        let registry = Arc::new(ClientRegistry::new(
            Some(client_store),
            config.keep_lost_clients(),
        ));
        registry.load_persisted()?;

        let distributor = Arc::new(PortDistributor::new(config.allowed_ports()?));
        let banned_client_ips = Arc::new(BanList::new(config.client_ban_time()));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            job_store,
            group_store,
            config.run_remote_cmd_timeout_secs,
        ));

        let (events_tx, events_rx) = mpsc::channel(256);
        let listener = Arc::new(ClientListener::new(
            registry.clone(),
            auth.clone(),
            distributor.clone(),
            banned_client_ips.clone(),
            events_tx,
            fingerprint.clone(),
            config.keepalive(),
            config.check_port_timeout(),
        ));

        let tls = TlsAcceptor::from(Arc::new(identity.tls_server_config()?));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            dispatcher,
            listener,
            auth,
            distributor,
            banned_client_ips,
            banned_api_ips: Arc::new(MaxBadAttemptsBanList::new(
                MAX_API_BAD_ATTEMPTS,
                Duration::from_secs(60 * 60),
            )),
            banned_api_users: Arc::new(MaxBadAttemptsBanList::new(
                MAX_API_BAD_ATTEMPTS,
                Duration::from_secs(60 * 60),
            )),
            fingerprint,
            tls,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        })
    }

    /// Start the listener, the event router and the sweepers; returns when
    /// [`Server::close`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("server already running");

        tokio::spawn(route_session_events(
            events_rx,
            self.registry.clone(),
            self.dispatcher.clone(),
        ));

        self.spawn_task(
            "cleanup-clients",
            Arc::new(CleanupClientsTask::new(self.registry.clone())),
            self.config.cleanup_clients_interval(),
        );

        let listener = self.listener.clone();
        let listen_address = self.config.listen_address.clone();
        let tls = self.tls.clone();
        let shutdown_rx = self.shutdown.subscribe();
        let accept = tokio::spawn(async move {
            if let Err(e) = listener.run(&listen_address, tls, shutdown_rx).await {
                tracing::error!(error = %e, "client listener failed");
            }
        });

        let mut shutdown_rx = self.shutdown.subscribe();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        accept.await.ok();
        Ok(())
    }

    /// Register an additional periodic sweeper (expired API sessions, aged
    /// measurements) owned by an external collaborator.
    pub fn spawn_task(&self, name: &'static str, task: Arc<dyn Task>, interval: Duration) {
        tokio::spawn(scheduler::run(
            name,
            task,
            interval,
            self.shutdown.subscribe(),
        ));
    }

    /// Signal shutdown and close every client session
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        for entry in self.registry.get_all() {
            let client = entry.lock().await;
            if let Some(session) = &client.session {
                session.close();
            }
        }
        tracing::info!("server shut down");
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn port_distributor(&self) -> &Arc<PortDistributor> {
        &self.distributor
    }

    pub fn client_auth(&self) -> &Arc<dyn CredentialStore> {
        &self.auth
    }

    pub fn banned_client_ips(&self) -> &Arc<BanList> {
        &self.banned_client_ips
    }

    pub fn banned_api_ips(&self) -> &Arc<MaxBadAttemptsBanList> {
        &self.banned_api_ips
    }

    pub fn banned_api_users(&self) -> &Arc<MaxBadAttemptsBanList> {
        &self.banned_api_users
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Open a tunnel on an active client (the operator path: an identical
    /// existing tunnel is a conflict, the remote port is probed unless
    /// `check_port` is false).
    pub async fn start_client_tunnel(
        &self,
        client_id: &str,
        remote: Remote,
        check_port: bool,
        user: &User,
    ) -> Result<TunnelInfo, ServerError> {
        self.registry.check_client_access(client_id, user).await?;

        let entry = self
            .registry
            .get_active_by_id(client_id)
            .await
            .ok_or_else(|| {
                ServerError::not_found(format!("active client with id {:?} not found", client_id))
            })?;

        let options = StartTunnelOptions {
            check_remote_port: check_port,
            check_local_port: true,
            reuse_existing: false,
            check_port_timeout: self.config.check_port_timeout(),
        };

        let mut client = entry.lock().await;
        let tunnels = client
            .start_tunnels(&self.distributor, vec![remote], &options)
            .await?;
        Ok(tunnels[0].info())
    }

    /// Tear down a tunnel; non-forced teardown fails while connections are open
    pub async fn delete_client_tunnel(
        &self,
        client_id: &str,
        tunnel_id: &str,
        force: bool,
        user: &User,
    ) -> Result<(), ServerError> {
        self.registry.check_client_access(client_id, user).await?;

        let entry = self
            .registry
            .get_active_by_id(client_id)
            .await
            .ok_or_else(|| {
                ServerError::not_found(format!("active client with id {:?} not found", client_id))
            })?;

        let mut client = entry.lock().await;
        client.terminate_tunnel(tunnel_id, force)
    }

    /// Add a credential, subject to the writable-source gate
    pub async fn create_client_auth(&self, auth: ClientAuth) -> Result<(), ServerError> {
        self.auth.add(auth).await.map_err(map_auth_err)
    }

    /// Delete a credential. Refused while client records are still bound to it.
    pub async fn delete_client_auth(&self, client_auth_id: &str) -> Result<(), ServerError> {
        let bound = self.registry.get_all_by_client_auth_id(client_auth_id).await;
        if !bound.is_empty() {
            return Err(ServerError::conflict(format!(
                "client auth {:?} still has {} bound client(s)",
                client_auth_id,
                bound.len()
            )));
        }
        self.auth.delete(client_auth_id).await.map_err(map_auth_err)
    }
}

fn map_auth_err(err: AuthError) -> ServerError {
    match err {
        AuthError::NotFound(id) => ServerError::not_found(format!("client auth {:?} not found", id)),
        AuthError::AlreadyExists(id) => {
            ServerError::AlreadyExists(format!("client auth {:?} already exists", id))
        }
        AuthError::NotWritable => {
            ServerError::conflict("client auth source is read-only")
        }
        other => ServerError::AuthSource(other),
    }
}

fn build_credential_store(config: &ServerConfig) -> Result<Arc<dyn CredentialStore>, ServerError> {
    if let Some(table) = &config.auth.auth_table {
        let conn = rusqlite::Connection::open(config.data_dir.join("auth.db"))
            .map_err(portgate_store::StoreError::Db)?;
        let store = TableCredentials::new(Arc::new(Mutex::new(conn)), table.clone())?;
        return Ok(Arc::new(store));
    }

    if let Some(path) = &config.auth.auth_file {
        let store = FileCredentials::load(path, config.auth.auth_write)?;
        return Ok(Arc::new(store));
    }

    if let Some(pair) = &config.auth.auth {
        let (id, password) = pair.split_once(':').ok_or_else(|| {
            ServerError::invalid("auth must be formatted as <client-auth-id>:<password>")
        })?;
        return Ok(Arc::new(SingleCredential::new(id, password)));
    }

    Err(ServerError::invalid(
        "client authentication must be enabled: set auth, auth_file or auth_table",
    ))
}

/// Consume session events: `cmd_result` pushes feed the dispatcher, closed
/// sessions move their client to disconnected.
pub async fn route_session_events(
    mut events: mpsc::Receiver<SessionEvent>,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Push {
                client_id,
                request_type,
                payload,
                ..
            } => {
                if request_type == PUSH_CMD_RESULT {
                    match decode_payload::<Job>(&payload) {
                        Ok(job) => {
                            if let Err(e) = dispatcher.handle_result(job) {
                                tracing::error!(
                                    client_id = %client_id,
                                    error = %e,
                                    "failed to store job result"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                client_id = %client_id,
                                error = %e,
                                "malformed cmd_result payload"
                            );
                        }
                    }
                } else {
                    tracing::warn!(
                        client_id = %client_id,
                        request_type = %request_type,
                        "unknown push rejected"
                    );
                }
            }
            SessionEvent::Closed {
                session_id,
                client_id,
            } => {
                registry.unregister_session(&client_id, &session_id).await;
            }
        }
    }
}
