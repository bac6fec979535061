//! Command and script dispatch
//!
//! Turns operator requests into job records and `run_cmd` requests over
//! client sessions. Multi-client requests fan out either concurrently (one
//! task per target) or sequentially with an optional abort on the first
//! failed child; terminal results stream back as `cmd_result` pushes and
//! are routed to the sequential waiter and any subscribed observers.

use crate::error::ServerError;
use crate::registry::{ClientRegistry, User};
use crate::session::{Session, SessionError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use portgate_proto::{
    CreateFileRequest, CreateFileResponse, Job, JobStatus, MultiJob, RunCmdResponse,
    REQUEST_CREATE_FILE, REQUEST_REFRESH_UPDATES_STATUS, REQUEST_RUN_CMD,
};
use portgate_store::{GroupStore, JobStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Clients older than this cannot receive script jobs
const MIN_SCRIPT_VERSION: &str = "0.1.35";

/// At least this many explicit targets are required when no group matches
const MIN_MULTI_CLIENTS: usize = 2;

/// One command or script execution request
#[derive(Debug, Clone, Default)]
pub struct ExecuteInput {
    pub command: String,
    /// Base64-encoded script body; when set the command is derived from the
    /// pushed script path
    pub script: Option<String>,
    pub interpreter: String,
    pub cwd: String,
    pub is_sudo: bool,
    pub timeout_sec: i64,
}

/// A fan-out request against many clients and/or groups
#[derive(Debug, Clone, Default)]
pub struct MultiDispatchRequest {
    pub client_ids: Vec<String>,
    pub group_ids: Vec<String>,
    pub execute: ExecuteInput,
    pub execute_concurrently: bool,
    /// Defaults to true when absent
    pub abort_on_error: Option<bool>,
}

/// Snapshot of a dispatch target taken while resolving the request
#[derive(Clone)]
struct TargetClient {
    id: String,
    name: String,
    version: String,
    session: Arc<Session>,
}

/// Dispatches jobs and routes their results
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    jobs: JobStore,
    groups: GroupStore,
    /// Sequential multi-jobs waiting for their in-flight child
    done_channels: Mutex<HashMap<String, mpsc::Sender<Job>>>,
    /// UI observers keyed by parent jid (or the job's own jid for singles)
    observers: Mutex<HashMap<String, broadcast::Sender<Job>>>,
    default_timeout_sec: i64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ClientRegistry>,
        jobs: JobStore,
        groups: GroupStore,
        default_timeout_sec: i64,
    ) -> Self {
        Self {
            registry,
            jobs,
            groups,
            done_channels: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            default_timeout_sec,
        }
    }

    pub fn job_store(&self) -> &JobStore {
        &self.jobs
    }

    pub fn group_store(&self) -> &GroupStore {
        &self.groups
    }

    /// Observe job updates under the given parent jid
    pub fn subscribe(&self, jid: &str) -> broadcast::Receiver<Job> {
        let mut observers = self.observers.lock().unwrap();
        observers
            .entry(jid.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .subscribe()
    }

    /// Execute a single command on one client. Returns the new jid once the
    /// client accepted the job.
    pub async fn execute_command(
        &self,
        client_id: &str,
        input: ExecuteInput,
        user: &User,
    ) -> Result<String, ServerError> {
        self.registry.check_client_access(client_id, user).await?;

        let mut input = input;
        if input.timeout_sec <= 0 {
            input.timeout_sec = self.default_timeout_sec;
        }

        let target = self.active_target(client_id).await?;
        let is_script = input.script.is_some();
        let mut has_shebang = false;
        if let Some(script) = input.script.take() {
            let script = decode_script(&script)?;
            check_script_support(&target)?;
            has_shebang = script.starts_with(b"#!");
            input.command = self
                .push_script(&target, &script, &input.interpreter)
                .await?;
        }
        if input.command.is_empty() {
            return Err(ServerError::invalid("command cannot be empty"));
        }

        let mut job = build_job(
            uuid::Uuid::new_v4().to_string(),
            None,
            &input,
            is_script,
            has_shebang,
            &target,
            &user.username,
        );

        let response: RunCmdResponse = target
            .session
            .request(REQUEST_RUN_CMD, &job)
            .await
            .map_err(ServerError::from)?;

        job.pid = Some(response.pid);
        job.started_at = response.started_at;
        job.status = JobStatus::Running;
        self.jobs.create_job(&job)?;

        tracing::debug!(
            jid = %job.jid,
            client_id = %target.id,
            command = %job.command,
            "job created"
        );
        Ok(job.jid)
    }

    /// Execute a command or script against many clients. The multi-job is
    /// persisted and its jid returned before any child is dispatched.
    pub async fn execute_multi(
        self: &Arc<Self>,
        request: MultiDispatchRequest,
        user: &User,
    ) -> Result<String, ServerError> {
        let mut input = request.execute;
        if input.command.is_empty() && input.script.is_none() {
            return Err(ServerError::invalid("command cannot be empty"));
        }
        if input.timeout_sec <= 0 {
            input.timeout_sec = self.default_timeout_sec;
        }
        let abort_on_error = request.abort_on_error.unwrap_or(true);

        let (targets, group_clients_count) = self
            .resolve_ordered_targets(&request.client_ids, &request.group_ids)
            .await?;

        if !request.group_ids.is_empty()
            && group_clients_count == 0
            && request.client_ids.is_empty()
        {
            return Err(ServerError::invalid(
                "no active clients belong to the selected group(s)",
            ));
        }
        if request.client_ids.len() < MIN_MULTI_CLIENTS && group_clients_count == 0 {
            return Err(ServerError::invalid(format!(
                "at least {} clients should be specified",
                MIN_MULTI_CLIENTS
            )));
        }

        for target in &targets {
            self.registry.check_client_access(&target.id, user).await?;
        }

        // scripts are pushed up front so every child runs the same artifact
        let mut has_shebang = false;
        let mut command_map = HashMap::new();
        if let Some(script) = input.script.take() {
            let script = decode_script(&script)?;
            has_shebang = script.starts_with(b"#!");
            for target in &targets {
                check_script_support(target)?;
            }
            for target in &targets {
                let path = self
                    .push_script(target, &script, &input.interpreter)
                    .await?;
                command_map.insert(target.id.clone(), path);
            }
        }

        let multi_job = MultiJob {
            jid: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            created_by: user.username.clone(),
            client_ids: request.client_ids.clone(),
            group_ids: request.group_ids.clone(),
            command: input.command.clone(),
            interpreter: input.interpreter.clone(),
            cwd: input.cwd.clone(),
            is_sudo: input.is_sudo,
            is_script: !command_map.is_empty(),
            has_shebang,
            timeout_sec: input.timeout_sec,
            concurrent: request.execute_concurrently,
            abort_on_error,
            jobs: Vec::new(),
        };
        self.jobs.save_multi_job(&multi_job)?;

        tracing::debug!(
            jid = %multi_job.jid,
            clients = ?request.client_ids,
            groups = ?request.group_ids,
            concurrent = multi_job.concurrent,
            "multi-client job created"
        );

        let jid = multi_job.jid.clone();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher
                .execute_multi_job(multi_job, targets, command_map)
                .await;
        });

        Ok(jid)
    }

    /// Ask a client to refresh its pending-updates report
    pub async fn refresh_updates_status(&self, client_id: &str) -> Result<(), ServerError> {
        let target = self.active_target(client_id).await?;
        target
            .session
            .notify(REQUEST_REFRESH_UPDATES_STATUS, &())
            .await
            .map_err(ServerError::from)
    }

    /// Route a terminal `cmd_result` frame into the store, the sequential
    /// waiter (if any) and observers.
    pub fn handle_result(&self, job: Job) -> Result<(), ServerError> {
        tracing::debug!(jid = %job.jid, status = %job.status.as_str(), "job result received");
        self.jobs.save_job(&job)?;

        if let Some(parent) = &job.multi_job_id {
            let waiter = self.done_channels.lock().unwrap().get(parent).cloned();
            if let Some(waiter) = waiter {
                let _ = waiter.try_send(job.clone());
            }
        }
        self.notify_observers(&job);
        Ok(())
    }

    fn notify_observers(&self, job: &Job) {
        let key = job.multi_job_id.clone().unwrap_or_else(|| job.jid.clone());
        let observers = self.observers.lock().unwrap();
        if let Some(sender) = observers.get(&key) {
            let _ = sender.send(job.clone());
        }
    }

    async fn execute_multi_job(
        self: Arc<Self>,
        job: MultiJob,
        targets: Vec<TargetClient>,
        command_map: HashMap<String, String>,
    ) {
        let mut done_rx = if job.concurrent {
            None
        } else {
            let (tx, rx) = mpsc::channel(1);
            self.done_channels
                .lock()
                .unwrap()
                .insert(job.jid.clone(), tx);
            Some(rx)
        };

        for target in targets {
            let command = command_map
                .get(&target.id)
                .cloned()
                .unwrap_or_else(|| job.command.clone());

            if job.concurrent {
                let dispatcher = self.clone();
                let job = job.clone();
                tokio::spawn(async move {
                    dispatcher.create_and_run_job(&job, command, target).await;
                });
            } else {
                let success = self.create_and_run_job(&job, command, target).await;
                if !success {
                    if job.abort_on_error {
                        break;
                    }
                    continue;
                }

                // wait until the in-flight child reaches a terminal state
                match done_rx.as_mut().unwrap().recv().await {
                    Some(child) => {
                        if job.abort_on_error && child.status == JobStatus::Failed {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        if !job.concurrent {
            self.done_channels.lock().unwrap().remove(&job.jid);
        }
    }

    /// Dispatch one child job. Returns false when the send failed and the
    /// child was persisted as failed.
    async fn create_and_run_job(
        &self,
        multi_job: &MultiJob,
        command: String,
        target: TargetClient,
    ) -> bool {
        let input = ExecuteInput {
            command,
            script: None,
            interpreter: multi_job.interpreter.clone(),
            cwd: multi_job.cwd.clone(),
            is_sudo: multi_job.is_sudo,
            timeout_sec: multi_job.timeout_sec,
        };
        let mut job = build_job(
            uuid::Uuid::new_v4().to_string(),
            Some(multi_job.jid.clone()),
            &input,
            multi_job.is_script,
            multi_job.has_shebang,
            &target,
            &multi_job.created_by,
        );

        let result: Result<RunCmdResponse, SessionError> =
            target.session.request(REQUEST_RUN_CMD, &job).await;

        let success = match result {
            Ok(response) => {
                job.pid = Some(response.pid);
                job.started_at = response.started_at;
                job.status = JobStatus::Running;
                true
            }
            Err(e) => {
                tracing::error!(
                    multi_job_id = %multi_job.jid,
                    client_id = %target.id,
                    error = %e,
                    "failed to dispatch child job"
                );
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
                job.error = Some(e.to_string());
                false
            }
        };

        if let Err(e) = self.jobs.create_job(&job) {
            tracing::error!(
                multi_job_id = %multi_job.jid,
                client_id = %target.id,
                error = %e,
                "failed to persist child job"
            );
        }
        self.notify_observers(&job);
        success
    }

    /// Resolve explicit client ids first (in request order), then clients
    /// derived from groups, deduplicated. Unknown explicit ids are
    /// not-found; disconnected explicit ids are invalid.
    async fn resolve_ordered_targets(
        &self,
        client_ids: &[String],
        group_ids: &[String],
    ) -> Result<(Vec<TargetClient>, usize), ServerError> {
        let mut groups = Vec::with_capacity(group_ids.len());
        for group_id in group_ids {
            let group = self.groups.get(group_id)?.ok_or_else(|| {
                ServerError::invalid(format!("unknown group with id {:?}", group_id))
            })?;
            groups.push(group);
        }

        let mut group_targets = Vec::new();
        for entry in self.registry.get_active_by_groups(&groups).await {
            let client = entry.lock().await;
            if let Some(session) = client.session.clone() {
                group_targets.push(TargetClient {
                    id: client.id.clone(),
                    name: client.info.name.clone(),
                    version: client.info.version.clone(),
                    session,
                });
            }
        }
        let group_clients_count = group_targets.len();

        let mut ordered = Vec::new();
        let mut used: HashSet<String> = HashSet::new();
        for client_id in client_ids {
            let entry = self.registry.get_by_id(client_id).ok_or_else(|| {
                ServerError::not_found(format!("client with id {:?} not found", client_id))
            })?;
            let client = entry.lock().await;
            let session = client.session.clone().ok_or_else(|| {
                ServerError::invalid(format!("client with id {:?} is not active", client_id))
            })?;
            if used.insert(client.id.clone()) {
                ordered.push(TargetClient {
                    id: client.id.clone(),
                    name: client.info.name.clone(),
                    version: client.info.version.clone(),
                    session,
                });
            }
        }

        for target in group_targets {
            if used.insert(target.id.clone()) {
                ordered.push(target);
            }
        }

        Ok((ordered, group_clients_count))
    }

    async fn active_target(&self, client_id: &str) -> Result<TargetClient, ServerError> {
        let entry = self.registry.get_active_by_id(client_id).await.ok_or_else(|| {
            ServerError::not_found(format!("active client with id {:?} not found", client_id))
        })?;
        let client = entry.lock().await;
        let session = client
            .session
            .clone()
            .ok_or_else(|| ServerError::conflict("client is disconnected"))?;
        Ok(TargetClient {
            id: client.id.clone(),
            name: client.info.name.clone(),
            version: client.info.version.clone(),
            session,
        })
    }

    async fn push_script(
        &self,
        target: &TargetClient,
        script: &[u8],
        interpreter: &str,
    ) -> Result<String, ServerError> {
        let response: CreateFileResponse = target
            .session
            .request(
                REQUEST_CREATE_FILE,
                &CreateFileRequest {
                    content: script.to_vec(),
                    interpreter: interpreter.to_string(),
                },
            )
            .await
            .map_err(ServerError::from)?;
        Ok(response.path)
    }
}

fn build_job(
    jid: String,
    multi_job_id: Option<String>,
    input: &ExecuteInput,
    is_script: bool,
    has_shebang: bool,
    target: &TargetClient,
    created_by: &str,
) -> Job {
    Job {
        jid,
        status: JobStatus::Running,
        client_id: target.id.clone(),
        client_name: target.name.clone(),
        multi_job_id,
        schedule_id: None,
        command: input.command.clone(),
        interpreter: input.interpreter.clone(),
        cwd: input.cwd.clone(),
        is_sudo: input.is_sudo,
        is_script,
        has_shebang,
        created_by: created_by.to_string(),
        timeout_sec: input.timeout_sec,
        pid: None,
        started_at: Utc::now(),
        finished_at: None,
        error: None,
        result: None,
    }
}

fn decode_script(encoded: &str) -> Result<Vec<u8>, ServerError> {
    BASE64
        .decode(encoded)
        .map_err(|e| ServerError::invalid(format!("invalid script encoding: {}", e)))
}

fn check_script_support(target: &TargetClient) -> Result<(), ServerError> {
    if version_lt(&target.version, MIN_SCRIPT_VERSION) {
        return Err(ServerError::invalid(format!(
            "script execution is supported starting from version {}, client {} runs {}",
            MIN_SCRIPT_VERSION, target.id, target.version
        )));
    }
    Ok(())
}

/// Numeric dotted-version comparison; missing components count as zero
fn version_lt(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (
            a.get(i).copied().unwrap_or(0),
            b.get(i).copied().unwrap_or(0),
        );
        if x != y {
            return x < y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_lt() {
        assert!(version_lt("0.1.34", "0.1.35"));
        assert!(version_lt("0.1", "0.1.35"));
        assert!(!version_lt("0.1.35", "0.1.35"));
        assert!(!version_lt("0.2.0", "0.1.35"));
        assert!(!version_lt("1.0", "0.9.9"));
    }

    #[test]
    fn test_decode_script() {
        assert_eq!(decode_script("IyEvYmluL3No").unwrap(), b"#!/bin/sh");
        assert!(decode_script("not base64 !!!").is_err());
    }
}
