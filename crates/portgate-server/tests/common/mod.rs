//! Shared harness for end-to-end tests: assembled core components plus a
//! scriptable in-memory client on the other side of a duplex transport.

// each test binary compiles its own copy and uses a different subset
#![allow(dead_code)]

use bytes::Bytes;
use chrono::Utc;
use portgate_auth::SingleCredential;
use portgate_proto::{
    decode_payload, encode_payload, read_message, write_message, ControlMessage, Frame, FrameType,
    Handshake, HandshakeReply, Job, JobResult, JobStatus, Remote, RunCmdResponse,
    CheckPortResponse, CreateFileResponse, PROTOCOL_VERSION, PUSH_CMD_RESULT, REQUEST_CHECK_PORT,
    REQUEST_CREATE_FILE, REQUEST_RUN_CMD,
};
use portgate_server::server::route_session_events;
use portgate_server::{
    BanList, ClientListener, ClientRegistry, Dispatcher, PortDistributor,
};
use portgate_store::{GroupStore, JobStore};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

pub const AUTH_ID: &str = "depot-1";
pub const AUTH_PASSWORD: &str = "test-password";

/// Parallel tests each get their own block of local tunnel ports
static NEXT_PORT_BLOCK: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(49400);

pub struct Harness {
    pub registry: Arc<ClientRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub listener: Arc<ClientListener>,
    pub distributor: Arc<PortDistributor>,
    pub banned_ips: Arc<BanList>,
    pub jobs: JobStore,
    pub groups: GroupStore,
    pub port_range: std::ops::RangeInclusive<u16>,
}

pub fn harness() -> Harness {
    let registry = Arc::new(ClientRegistry::new(None, Some(chrono::Duration::hours(1))));
    let jobs = JobStore::open_in_memory().unwrap();
    let groups = GroupStore::open_in_memory().unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        jobs.clone(),
        groups.clone(),
        60,
    ));

    let base = NEXT_PORT_BLOCK.fetch_add(8, std::sync::atomic::Ordering::SeqCst);
    let port_range = base..=(base + 7);
    let allowed: BTreeSet<u16> = port_range.clone().collect();
    let pool: std::collections::HashSet<u16> = port_range.clone().collect();
    let distributor = Arc::new(PortDistributor::with_pools(
        allowed,
        pool,
        std::collections::HashSet::new(),
    ));

    let banned_ips = Arc::new(BanList::new(Duration::from_secs(600)));
    let (events_tx, events_rx) = mpsc::channel(64);

    let listener = Arc::new(ClientListener::new(
        registry.clone(),
        Arc::new(SingleCredential::new(AUTH_ID, AUTH_PASSWORD)),
        distributor.clone(),
        banned_ips.clone(),
        events_tx,
        "aa:bb:cc".to_string(),
        Duration::ZERO,
        Duration::from_secs(1),
    ));

    tokio::spawn(route_session_events(
        events_rx,
        registry.clone(),
        dispatcher.clone(),
    ));

    Harness {
        registry,
        dispatcher,
        listener,
        distributor,
        banned_ips,
        jobs,
        groups,
        port_range,
    }
}

/// How the fake client answers `run_cmd`
#[derive(Clone, Copy, PartialEq)]
pub enum CommandBehavior {
    /// Accept the job and push a `cmd_result` with the given terminal status
    FinishWith(JobStatus),
    /// Report a client-side failure instead of accepting the job
    RejectDispatch,
}

pub struct FakeClientConfig {
    pub client_id: String,
    pub name: String,
    pub version: String,
    pub password: String,
    pub remotes: Vec<Remote>,
    pub command: CommandBehavior,
}

impl FakeClientConfig {
    pub fn named(seed: u8, name: &str) -> Self {
        Self {
            client_id: format!("{:02x}", seed).repeat(32),
            name: name.to_string(),
            version: "0.3.1".to_string(),
            password: AUTH_PASSWORD.to_string(),
            remotes: Vec::new(),
            command: CommandBehavior::FinishWith(JobStatus::Successful),
        }
    }
}

#[derive(Debug)]
pub struct FakeClient {
    pub client_id: String,
    /// Jobs this client received over `run_cmd`
    pub received_jobs: Arc<Mutex<Vec<Job>>>,
}

impl FakeClient {
    /// Handshake against the listener, wait until the registry sees the
    /// session, and start servicing it. Returns `Err(reason)` when the
    /// handshake is rejected.
    pub async fn connect(
        harness: &Harness,
        peer_addr: &str,
        config: FakeClientConfig,
    ) -> Result<FakeClient, String> {
        let (server_io, mut client_io) = tokio::io::duplex(256 * 1024);
        {
            let listener = harness.listener.clone();
            let peer_addr = peer_addr.to_string();
            tokio::spawn(async move {
                listener.handle_connection(server_io, peer_addr).await;
            });
        }

        let handshake = Handshake {
            protocol_version: PROTOCOL_VERSION,
            client_version: config.version.clone(),
            auth_id: AUTH_ID.to_string(),
            password: config.password.clone(),
            client_id: config.client_id.clone(),
            info: portgate_proto::ClientInfo {
                name: config.name.clone(),
                version: config.version.clone(),
                os: "linux".to_string(),
                ..Default::default()
            },
            remotes: config.remotes.clone(),
        };
        write_message(&mut client_io, &handshake).await.unwrap();

        match read_message::<_, HandshakeReply>(&mut client_io).await {
            Ok(HandshakeReply::Ok { .. }) => {}
            Ok(HandshakeReply::Err { reason }) => return Err(reason),
            Err(e) => return Err(e.to_string()),
        }

        let received_jobs = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(service_loop(
            client_io,
            config.command,
            received_jobs.clone(),
        ));

        // registration runs on the listener task after the reply is written
        for _ in 0..200 {
            if harness
                .registry
                .get_active_by_id(&config.client_id)
                .await
                .is_some()
            {
                return Ok(FakeClient {
                    client_id: config.client_id,
                    received_jobs,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err("client never appeared in the registry".to_string())
    }

    pub fn received_commands(&self) -> Vec<String> {
        self.received_jobs
            .lock()
            .unwrap()
            .iter()
            .map(|j| j.command.clone())
            .collect()
    }
}

/// Service the client end of the session: answer requests, echo tunnel
/// data, push job results.
async fn service_loop(
    mut io: DuplexStream,
    command: CommandBehavior,
    received_jobs: Arc<Mutex<Vec<Job>>>,
) {
    while let Ok(Some(frame)) = Frame::read_from(&mut io).await {
        match frame.frame_type {
            FrameType::Control => {
                let Ok(message) = ControlMessage::decode(&frame.payload) else {
                    return;
                };
                match message {
                    ControlMessage::Request {
                        id,
                        request_type,
                        payload,
                    } => {
                        let reply = match request_type.as_str() {
                            REQUEST_RUN_CMD => {
                                let job: Job = decode_payload(&payload).unwrap();
                                received_jobs.lock().unwrap().push(job.clone());
                                match command {
                                    CommandBehavior::RejectDispatch => {
                                        Err("cannot execute command".to_string())
                                    }
                                    CommandBehavior::FinishWith(status) => {
                                        // queue the terminal result behind the reply
                                        let result = finished_job(&job, status);
                                        let push = ControlMessage::Push {
                                            request_type: PUSH_CMD_RESULT.to_string(),
                                            payload: encode_payload(&result).unwrap(),
                                        };
                                        let reply = ControlMessage::Response {
                                            id,
                                            payload: Ok(encode_payload(&RunCmdResponse {
                                                pid: 4242,
                                                started_at: Utc::now(),
                                            })
                                            .unwrap()),
                                        };
                                        write_control(&mut io, reply).await;
                                        write_control(&mut io, push).await;
                                        continue;
                                    }
                                }
                            }
                            REQUEST_CHECK_PORT => Ok(encode_payload(&CheckPortResponse {
                                open: true,
                                err_msg: String::new(),
                            })
                            .unwrap()),
                            REQUEST_CREATE_FILE => Ok(encode_payload(&CreateFileResponse {
                                path: "/tmp/portgate-script.sh".to_string(),
                            })
                            .unwrap()),
                            other => Err(format!("unknown request type: {}", other)),
                        };
                        write_control(&mut io, ControlMessage::Response { id, payload: reply })
                            .await;
                    }
                    ControlMessage::Ping { timestamp } => {
                        write_control(&mut io, ControlMessage::Pong { timestamp }).await;
                    }
                    _ => {}
                }
            }
            // echo tunneled bytes straight back
            FrameType::Data => {
                let echo = Frame::data(frame.stream_id, frame.payload);
                if echo.write_to(&mut io).await.is_err() {
                    return;
                }
            }
            FrameType::Open | FrameType::Close => {}
        }
    }
}

async fn write_control(io: &mut DuplexStream, message: ControlMessage) {
    let _ = Frame::control(Bytes::from(message.encode().unwrap()))
        .write_to(io)
        .await;
}

fn finished_job(job: &Job, status: JobStatus) -> Job {
    let mut finished = job.clone();
    finished.status = status;
    finished.pid = Some(4242);
    finished.finished_at = Some(Utc::now());
    if status == JobStatus::Failed {
        finished.error = Some("exit status 1".to_string());
        finished.result = Some(JobResult {
            stdout: String::new(),
            stderr: "boom".to_string(),
        });
    } else {
        finished.result = Some(JobResult {
            stdout: "done".to_string(),
            stderr: String::new(),
        });
    }
    finished
}

/// Poll until `predicate` holds or the deadline passes
pub async fn wait_for<F>(mut predicate: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
