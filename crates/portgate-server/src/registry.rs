//! Client session registry
//!
//! In-memory inventory of every known client, connected or within the
//! keep-lost window, optionally mirrored to `clients.db`. Look-ups take the
//! map read lock; each client carries its own mutex for everything that
//! mutates it.

use crate::client::{Client, ClientView, ConnectionState};
use crate::error::ServerError;
use crate::scheduler::Task;
use crate::session::Session;
use async_trait::async_trait;
use chrono::Utc;
use portgate_proto::ClientInfo;
use portgate_store::{ClientGroup, ClientStore};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// The authenticated operator on whose behalf an API call runs
#[derive(Debug, Clone, Default)]
pub struct User {
    pub username: String,
    pub groups: Vec<String>,
}

/// Sort key for client listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientSortField {
    #[default]
    Id,
    Name,
    Os,
    Hostname,
    Version,
}

/// Filter and sort options for client listings
#[derive(Debug, Clone, Default)]
pub struct ClientListOptions {
    pub sort: ClientSortField,
    pub desc: bool,
    pub connection_state: Option<ConnectionState>,
    pub tag: Option<String>,
}

/// Registry of known clients
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Mutex<Client>>>>,
    store: Option<ClientStore>,
    keep_lost: Option<chrono::Duration>,
}

impl ClientRegistry {
    pub fn new(store: Option<ClientStore>, keep_lost: Option<chrono::Duration>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            store,
            keep_lost,
        }
    }

    /// Load persisted rows that are still within the keep-lost window and
    /// register them as disconnected. Returns how many were loaded.
    pub fn load_persisted(&self) -> Result<usize, ServerError> {
        let (Some(store), Some(keep_lost)) = (&self.store, self.keep_lost) else {
            return Ok(0);
        };

        let rows = store.get_non_obsolete(keep_lost)?;
        let count = rows.len();
        let mut clients = self.clients.write().unwrap();
        for row in rows {
            let client = Client::from_stored(row);
            clients.insert(client.id.clone(), Arc::new(Mutex::new(client)));
        }
        tracing::info!(count, "loaded persisted clients");
        Ok(count)
    }

    /// Bind a freshly authenticated session to its client record. A known
    /// client id replaces the previous session in place, preserving the
    /// record's identity; the prior session and its tunnels are closed.
    pub async fn register_session(
        &self,
        client_id: &str,
        client_auth_id: &str,
        address: &str,
        info: ClientInfo,
        session: Arc<Session>,
    ) -> Result<Arc<Mutex<Client>>, ServerError> {
        let (entry, is_new) = {
            let mut clients = self.clients.write().unwrap();
            match clients.entry(client_id.to_string()) {
                Entry::Occupied(occupied) => (occupied.get().clone(), false),
                Entry::Vacant(vacant) => {
                    let client = Client::new(
                        client_id.to_string(),
                        client_auth_id.to_string(),
                        address.to_string(),
                        info.clone(),
                        session.clone(),
                    );
                    let arc = Arc::new(Mutex::new(client));
                    vacant.insert(arc.clone());
                    (arc, true)
                }
            }
        };

        {
            let mut client = entry.lock().await;
            if !is_new {
                if let Some(old_session) = client.session.take() {
                    if old_session.id() != session.id() {
                        tracing::info!(
                            client_id = %client_id,
                            old_session = %old_session.id(),
                            "closing replaced session"
                        );
                        old_session.close();
                    }
                }
                client.close_all_tunnels();
                client.client_auth_id = client_auth_id.to_string();
                client.address = address.to_string();
                client.info = info;
                client.session = Some(session);
                client.disconnected_at = None;
            }
            self.persist(&client)?;
        }

        tracing::info!(client_id = %client_id, new = is_new, "client session registered");
        Ok(entry)
    }

    /// Move the client to disconnected when the given session is still the
    /// current one. A session replaced by a reconnect is ignored here.
    pub async fn unregister_session(&self, client_id: &str, session_id: &str) {
        let Some(entry) = self.get_by_id(client_id) else {
            return;
        };

        let remove = {
            let mut client = entry.lock().await;
            let is_current = client
                .session
                .as_ref()
                .map(|s| s.id() == session_id)
                .unwrap_or(false);
            if !is_current {
                return;
            }

            if let Some(session) = client.session.take() {
                session.close();
            }
            client.close_all_tunnels();
            client.disconnected_at = Some(Utc::now());
            if let Err(e) = self.persist(&client) {
                tracing::error!(client_id = %client_id, error = %e, "failed to persist client");
            }
            tracing::info!(client_id = %client_id, "client disconnected");

            self.keep_lost.is_none()
        };

        // without a keep-lost window disconnected clients vanish at once
        if remove {
            self.clients.write().unwrap().remove(client_id);
            if let Some(store) = &self.store {
                if let Err(e) = store.delete(client_id) {
                    tracing::error!(client_id = %client_id, error = %e, "failed to delete client row");
                }
            }
        }
    }

    pub fn get_by_id(&self, client_id: &str) -> Option<Arc<Mutex<Client>>> {
        self.clients.read().unwrap().get(client_id).cloned()
    }

    /// Like [`Self::get_by_id`] but only for currently connected clients
    pub async fn get_active_by_id(&self, client_id: &str) -> Option<Arc<Mutex<Client>>> {
        let entry = self.get_by_id(client_id)?;
        let connected = entry.lock().await.is_connected();
        connected.then_some(entry)
    }

    pub fn get_all(&self) -> Vec<Arc<Mutex<Client>>> {
        self.clients.read().unwrap().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub async fn get_all_by_client_auth_id(&self, client_auth_id: &str) -> Vec<Arc<Mutex<Client>>> {
        let mut matching = Vec::new();
        for entry in self.get_all() {
            if entry.lock().await.client_auth_id == client_auth_id {
                matching.push(entry);
            }
        }
        matching
    }

    /// Connected clients matching any of the given groups
    pub async fn get_active_by_groups(&self, groups: &[ClientGroup]) -> Vec<Arc<Mutex<Client>>> {
        let mut matching = Vec::new();
        for entry in self.get_all() {
            let client = entry.lock().await;
            if !client.is_connected() {
                continue;
            }
            if groups.iter().any(|g| g.matches(&client.id, &client.info)) {
                drop(client);
                matching.push(entry);
            }
        }
        matching
    }

    /// Clients visible to the user, filtered and sorted. A client with an
    /// empty `allowed_user_groups` list is visible to everyone.
    pub async fn get_user_clients(
        &self,
        user: &User,
        options: &ClientListOptions,
    ) -> Vec<ClientView> {
        let mut views = Vec::new();
        for entry in self.get_all() {
            let client = entry.lock().await;
            if !client.allows_user_groups(&user.groups) {
                continue;
            }
            if let Some(state) = options.connection_state {
                if client.connection_state() != state {
                    continue;
                }
            }
            if let Some(tag) = &options.tag {
                if !client.info.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            views.push(client.view());
        }

        views.sort_by(|a, b| {
            let ordering = match options.sort {
                ClientSortField::Id => a.id.cmp(&b.id),
                ClientSortField::Name => a.name.cmp(&b.name),
                ClientSortField::Os => a.os.cmp(&b.os),
                ClientSortField::Hostname => a.hostname.cmp(&b.hostname),
                ClientSortField::Version => a.version.cmp(&b.version),
            };
            if options.desc {
                ordering.reverse()
            } else {
                ordering
            }
        });
        views
    }

    /// Replace the client's user-group allow-list
    pub async fn set_acl(&self, client_id: &str, groups: Vec<String>) -> Result<(), ServerError> {
        let entry = self
            .get_by_id(client_id)
            .ok_or_else(|| ServerError::not_found(format!("client {:?} not found", client_id)))?;
        let mut client = entry.lock().await;
        client.allowed_user_groups = groups;
        self.persist(&client)
    }

    /// `Ok` when the user may act on the client
    pub async fn check_client_access(&self, client_id: &str, user: &User) -> Result<(), ServerError> {
        let entry = self
            .get_by_id(client_id)
            .ok_or_else(|| ServerError::not_found(format!("client {:?} not found", client_id)))?;
        let client = entry.lock().await;
        if client.allows_user_groups(&user.groups) {
            Ok(())
        } else {
            Err(ServerError::forbidden(format!(
                "user {:?} has no access to client {:?}",
                user.username, client_id
            )))
        }
    }

    /// Remove a disconnected client entirely
    pub async fn delete_offline(&self, client_id: &str) -> Result<(), ServerError> {
        let entry = self
            .get_by_id(client_id)
            .ok_or_else(|| ServerError::not_found(format!("client {:?} not found", client_id)))?;

        {
            let client = entry.lock().await;
            if client.is_connected() {
                return Err(ServerError::conflict(
                    "client is still connected, disconnect it first",
                ));
            }
        }

        self.clients.write().unwrap().remove(client_id);
        if let Some(store) = &self.store {
            store.delete(client_id)?;
        }
        tracing::info!(client_id = %client_id, "offline client deleted");
        Ok(())
    }

    /// Drop disconnected clients whose keep-lost window has passed.
    /// Returns how many were removed.
    pub async fn cleanup_obsolete(&self) -> Result<usize, ServerError> {
        let Some(keep_lost) = self.keep_lost else {
            return Ok(0);
        };
        let cutoff = Utc::now() - keep_lost;

        let mut obsolete = Vec::new();
        for entry in self.get_all() {
            let client = entry.lock().await;
            if let Some(disconnected_at) = client.disconnected_at {
                if disconnected_at <= cutoff {
                    obsolete.push(client.id.clone());
                }
            }
        }

        {
            let mut clients = self.clients.write().unwrap();
            for id in &obsolete {
                clients.remove(id);
            }
        }
        if let Some(store) = &self.store {
            store.delete_obsolete(keep_lost)?;
        }

        if !obsolete.is_empty() {
            tracing::debug!(count = obsolete.len(), "removed obsolete clients");
        }
        Ok(obsolete.len())
    }

    fn persist(&self, client: &Client) -> Result<(), ServerError> {
        if let Some(store) = &self.store {
            store.save(&client.to_stored())?;
        }
        Ok(())
    }
}

/// Scheduled sweeper dropping clients whose keep-lost window has passed
pub struct CleanupClientsTask {
    registry: Arc<ClientRegistry>,
}

impl CleanupClientsTask {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Task for CleanupClientsTask {
    async fn run(&self) -> anyhow::Result<()> {
        let removed = self.registry.cleanup_obsolete().await?;
        if removed > 0 {
            tracing::info!(removed, "cleanup task removed obsolete clients");
        }
        Ok(())
    }
}
