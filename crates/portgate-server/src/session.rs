//! Client session transport
//!
//! One [`Session`] wraps the authenticated, multiplexed connection to a
//! single client. Stream 0 carries control envelopes (request/response and
//! unsolicited pushes), data streams carry tunneled connections. The read
//! and write loops run as independent tasks; everything else talks to them
//! through channels.

use bytes::Bytes;
use portgate_proto::{
    decode_payload, encode_payload, ControlMessage, Frame, FrameFlags, FrameType, OpenStream,
    StreamId,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    /// The client handled the request and reported a failure itself
    #[error("client error: {0}")]
    Client(String),

    #[error("codec error: {0}")]
    Codec(#[from] portgate_proto::CodecError),

    #[error("message encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Events a session surfaces to the server
#[derive(Debug)]
pub enum SessionEvent {
    /// Unsolicited message from the client (e.g. `cmd_result`)
    Push {
        session_id: String,
        client_id: String,
        request_type: String,
        payload: Vec<u8>,
    },
    /// The transport ended, cleanly or not
    Closed {
        session_id: String,
        client_id: String,
    },
}

type StreamMap = Arc<Mutex<HashMap<StreamId, mpsc::Sender<Bytes>>>>;

/// An authenticated, multiplexed client connection
pub struct Session {
    id: String,
    client_id: String,
    peer_addr: String,
    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, String>>>>,
    streams: StreamMap,
    next_request_id: AtomicU64,
    next_stream_id: AtomicU32,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Take over an authenticated transport and spawn its IO loops
    pub fn start<IO>(
        io: IO,
        id: String,
        client_id: String,
        peer_addr: String,
        keepalive: Duration,
        events: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (outbound, outbound_rx) = mpsc::channel::<Frame>(64);
        let (closed, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            client_id,
            peer_addr,
            outbound,
            pending: Mutex::new(HashMap::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            next_stream_id: AtomicU32::new(1),
            closed,
        });

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            session.closed.subscribe(),
        ));
        tokio::spawn(read_loop(session.clone(), reader, events));
        tokio::spawn(keepalive_loop(session.clone(), keepalive));

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Force-close the transport; IO loops exit on the signal
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Send a request and wait for the client's reply
    pub async fn request<Req, Resp>(
        &self,
        request_type: &str,
        request: &Req,
    ) -> Result<Resp, SessionError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let message = ControlMessage::Request {
            id,
            request_type: request_type.to_string(),
            payload: encode_payload(request)?,
        };
        if let Err(e) = self.send_control(message).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(bytes)) => Ok(decode_payload(&bytes)?),
            Ok(Err(reason)) => Err(SessionError::Client(reason)),
            Err(_) => Err(SessionError::Closed),
        }
    }

    /// Send a one-way message, no reply expected
    pub async fn notify<Req: Serialize>(
        &self,
        request_type: &str,
        request: &Req,
    ) -> Result<(), SessionError> {
        self.send_control(ControlMessage::Push {
            request_type: request_type.to_string(),
            payload: encode_payload(request)?,
        })
        .await
    }

    /// Open a data stream towards `target` (`host:port` on the client side)
    pub async fn open_stream(&self, target: &str) -> Result<TunnelStream, SessionError> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        self.streams.lock().unwrap().insert(stream_id, tx);

        let payload = encode_payload(&OpenStream {
            target: target.to_string(),
        })?;
        if let Err(e) = self.send_frame(Frame::open(stream_id, Bytes::from(payload))).await {
            self.streams.lock().unwrap().remove(&stream_id);
            return Err(e);
        }

        Ok(TunnelStream {
            stream_id,
            outbound: self.outbound.clone(),
            incoming: rx,
            streams: self.streams.clone(),
        })
    }

    async fn send_control(&self, message: ControlMessage) -> Result<(), SessionError> {
        self.send_frame(Frame::control(Bytes::from(message.encode()?)))
            .await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)
    }

    fn fail_pending(&self) {
        // dropping the oneshot senders wakes every waiter with Closed
        self.pending.lock().unwrap().clear();
        self.streams.lock().unwrap().clear();
    }
}

/// Server end of one tunneled connection
pub struct TunnelStream {
    stream_id: StreamId,
    outbound: mpsc::Sender<Frame>,
    incoming: mpsc::Receiver<Bytes>,
    streams: StreamMap,
}

impl TunnelStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Forward bytes to the client; applies backpressure when the session
    /// write queue is full
    pub async fn send(&self, data: Bytes) -> Result<(), SessionError> {
        self.outbound
            .send(Frame::data(self.stream_id, data))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Next chunk from the client, `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.streams.lock().unwrap().remove(&self.stream_id);
        let _ = self.outbound.try_send(
            Frame::close(self.stream_id).with_flags(FrameFlags::new().with_fin()),
        );
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = frame.write_to(&mut writer).await {
                        tracing::debug!(error = %e, "session write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = closed.changed() => {
                if *closed.borrow() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(session: Arc<Session>, mut reader: R, events: mpsc::Sender<SessionEvent>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut closed = session.closed.subscribe();
    while !*closed.borrow() {
        tokio::select! {
            result = Frame::read_from(&mut reader) => match result {
                Ok(Some(frame)) => {
                    if let Err(e) = handle_frame(&session, frame, &events).await {
                        tracing::debug!(
                            session_id = %session.id,
                            error = %e,
                            "failed to handle session frame"
                        );
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(session_id = %session.id, error = %e, "session read failed");
                    break;
                }
            },
            _ = closed.changed() => {
                if *closed.borrow() {
                    break;
                }
            }
        }
    }

    session.closed.send_replace(true);
    session.fail_pending();
    let _ = events
        .send(SessionEvent::Closed {
            session_id: session.id.clone(),
            client_id: session.client_id.clone(),
        })
        .await;
}

async fn handle_frame(
    session: &Arc<Session>,
    frame: Frame,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    match frame.frame_type {
        FrameType::Control => {
            let message = ControlMessage::decode(&frame.payload)?;
            handle_control(session, message, events).await
        }
        FrameType::Data => {
            let sender = {
                let streams = session.streams.lock().unwrap();
                streams.get(&frame.stream_id).cloned()
            };
            match sender {
                Some(sender) => {
                    // backpressure towards the client rides on the bounded
                    // per-stream channel
                    let _ = sender.send(frame.payload).await;
                }
                None => {
                    let close = Frame::close(frame.stream_id)
                        .with_flags(FrameFlags::new().with_rst());
                    let _ = session.send_frame(close).await;
                }
            }
            Ok(())
        }
        FrameType::Close => {
            session.streams.lock().unwrap().remove(&frame.stream_id);
            Ok(())
        }
        FrameType::Open => {
            // only the server opens streams
            tracing::warn!(
                session_id = %session.id,
                stream_id = frame.stream_id,
                "client attempted to open a stream"
            );
            let close = Frame::close(frame.stream_id).with_flags(FrameFlags::new().with_rst());
            session.send_frame(close).await
        }
    }
}

async fn handle_control(
    session: &Arc<Session>,
    message: ControlMessage,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    match message {
        ControlMessage::Response { id, payload } => {
            let waiter = session.pending.lock().unwrap().remove(&id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(payload);
                }
                None => {
                    tracing::debug!(
                        session_id = %session.id,
                        request_id = id,
                        "response for unknown request"
                    );
                }
            }
            Ok(())
        }
        ControlMessage::Request { id, request_type, .. } => {
            // the core accepts no client-initiated requests
            session
                .send_control(ControlMessage::Response {
                    id,
                    payload: Err(format!("unknown request type: {}", request_type)),
                })
                .await
        }
        ControlMessage::Push {
            request_type,
            payload,
        } => {
            let _ = events
                .send(SessionEvent::Push {
                    session_id: session.id.clone(),
                    client_id: session.client_id.clone(),
                    request_type,
                    payload,
                })
                .await;
            Ok(())
        }
        ControlMessage::Ping { timestamp } => {
            session
                .send_control(ControlMessage::Pong { timestamp })
                .await
        }
        ControlMessage::Pong { .. } => Ok(()),
    }
}

async fn keepalive_loop(session: Arc<Session>, keepalive: Duration) {
    if keepalive.is_zero() {
        return;
    }
    let mut closed = session.closed.subscribe();
    let mut counter: u64 = 0;
    while !*closed.borrow() {
        tokio::select! {
            _ = tokio::time::sleep(keepalive) => {
                counter += 1;
                if session
                    .send_control(ControlMessage::Ping { timestamp: counter })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            _ = closed.changed() => {
                if *closed.borrow() {
                    return;
                }
            }
        }
    }
}
