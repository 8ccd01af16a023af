// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Multiplexed RPC backend.
//!
//! All calls of a client share one connection. A writer task drains an
//! outbound queue; a reader task routes replies to the waiting call by
//! request id. When the connection breaks, every pending call fails with
//! `connection-lost` and the next call dials a new connection.
//!
//! Calls that carry the same transaction id are serialized: a call waits for
//! the previous call of its session to complete before it is sent.
//!
//! A streaming call grants the server a window of `STREAM_WINDOW` chunks and
//! returns one credit per chunk the reader takes, so the chunks buffered for a
//! slow reader stay bounded by the window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, instrument, warn};

use super::frame::{frame_codec, Frame, RpcResult, STREAM_WINDOW};
use super::{Request, Response};
use crate::client::{ClientConfig, RetryPolicy};
use crate::error::{Error, ServiceError, TransportError};
use crate::txn::TransactionId;

type Reply = Result<RpcResult, TransportError>;

#[derive(Debug)]
enum StreamEvent {
    Chunk(Vec<serde_json::Value>),
    End(Option<ServiceError>),
    Failed(TransportError),
}

#[derive(Debug)]
enum Pending {
    Unary(oneshot::Sender<Reply>),
    Stream {
        header: Option<oneshot::Sender<Reply>>,
        events: mpsc::UnboundedSender<StreamEvent>,
    },
}

#[derive(Debug, Default)]
struct PendingCalls {
    calls: HashMap<u64, Pending>,
    closed: Option<TransportError>,
}

impl PendingCalls {
    fn route(&mut self, frame: Frame) {
        let request_id = frame.request_id();
        match frame {
            Frame::Response { result, .. } => match self.calls.remove(&request_id) {
                Some(Pending::Unary(tx)) => {
                    let _ = tx.send(Ok(result));
                }
                Some(Pending::Stream { header, events }) => {
                    let failed = matches!(result, RpcResult::Error(_));
                    if let Some(tx) = header {
                        let _ = tx.send(Ok(result));
                    }
                    if !failed {
                        self.calls.insert(
                            request_id,
                            Pending::Stream {
                                header: None,
                                events,
                            },
                        );
                    }
                }
                None => debug!(request_id, "dropping reply to an abandoned call"),
            },
            Frame::StreamChunk { rows, .. } => {
                if let Some(Pending::Stream { events, .. }) = self.calls.get(&request_id) {
                    if events.send(StreamEvent::Chunk(rows)).is_err() {
                        self.calls.remove(&request_id);
                    }
                }
            }
            Frame::StreamEnd { error, .. } => {
                if let Some(Pending::Stream { events, .. }) = self.calls.remove(&request_id) {
                    let _ = events.send(StreamEvent::End(error));
                }
            }
            Frame::Request { .. } | Frame::Credit { .. } | Frame::Cancel { .. } => {
                debug!(request_id, "ignoring unexpected frame from server");
            }
        }
    }

    fn fail_all(&mut self, reason: TransportError) {
        for (_, pending) in self.calls.drain() {
            match pending {
                Pending::Unary(tx) => {
                    let _ = tx.send(Err(reason.clone()));
                }
                Pending::Stream {
                    header: Some(tx), ..
                } => {
                    let _ = tx.send(Err(reason.clone()));
                }
                Pending::Stream { events, .. } => {
                    let _ = events.send(StreamEvent::Failed(reason.clone()));
                }
            }
        }
        self.closed = Some(reason);
    }
}

/// One established connection with its reader and writer tasks.
#[derive(Debug)]
struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Arc<Mutex<PendingCalls>>,
    tasks: [AbortHandle; 2],
}

impl Connection {
    fn spawn(stream: TcpStream, generation: u64) -> Arc<Self> {
        let (sink, source) = Framed::new(stream, frame_codec()).split::<Bytes>();
        let (outbound, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingCalls::default()));

        let writer = tokio::spawn(write_loop(sink, rx, pending.clone()));
        let reader = tokio::spawn(read_loop(
            source,
            pending.clone(),
            writer.abort_handle(),
            generation,
        ));

        Arc::new(Self {
            generation,
            outbound,
            pending,
            tasks: [reader.abort_handle(), writer.abort_handle()],
        })
    }

    fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    fn register(&self, request_id: u64, pending: Pending) -> Result<(), TransportError> {
        let mut calls = self.pending.lock();
        if let Some(reason) = &calls.closed {
            return Err(reason.clone());
        }
        calls.calls.insert(request_id, pending);
        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::connection_lost("connection writer has stopped"))
    }

    /// Lets the server send one more chunk of a streamed reply.
    fn grant(&self, request_id: u64) {
        let _ = self.outbound.send(Frame::Credit {
            request_id,
            chunks: 1,
        });
    }

    /// Forgets a call and tells the server to stop working on it.
    fn cancel(&self, request_id: u64) {
        let was_pending = self.pending.lock().calls.remove(&request_id).is_some();
        if was_pending {
            debug!(request_id, generation = self.generation, "cancelling call");
            let _ = self.outbound.send(Frame::Cancel { request_id });
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type FrameSink = futures_util::stream::SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameSource = futures_util::stream::SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<Mutex<PendingCalls>>,
) {
    while let Some(frame) = rx.recv().await {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                if let Some(Pending::Unary(tx)) = pending.lock().calls.remove(&frame.request_id()) {
                    let _ = tx.send(Err(err));
                }
                continue;
            }
        };
        if let Err(err) = sink.send(bytes).await {
            pending.lock().fail_all(err.into());
            return;
        }
    }
}

async fn read_loop(
    mut source: FrameSource,
    pending: Arc<Mutex<PendingCalls>>,
    writer: AbortHandle,
    generation: u64,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(buf)) => match Frame::decode(&buf) {
                Ok(frame) => pending.lock().route(frame),
                Err(err) => break err,
            },
            Some(Err(err)) => break TransportError::from(err),
            None => break TransportError::connection_lost("connection closed by server"),
        }
    };
    warn!(generation, error = %reason, "rpc connection lost");
    pending.lock().fail_all(reason);
    writer.abort();
}

/// Streamed rows of one call.
///
/// Dropping an unfinished stream cancels the call on the server.
#[derive(Debug)]
pub struct ChunkStream {
    request_id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    connection: Option<Arc<Connection>>,
    idle_timeout: Duration,
}

impl ChunkStream {
    /// Sets how long to wait for each chunk.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Returns true once the end of the stream was seen or it was cancelled.
    pub fn is_finished(&self) -> bool {
        self.connection.is_none()
    }

    /// Waits for the next chunk of rows; `Ok(None)` marks the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<serde_json::Value>>, Error> {
        if self.connection.is_none() {
            return Ok(None);
        }
        let event = match tokio::time::timeout(self.idle_timeout, self.events.recv()).await {
            Ok(event) => event,
            Err(_) => {
                self.cancel();
                return Err(Error::Timeout(self.idle_timeout));
            }
        };
        match event {
            Some(StreamEvent::Chunk(rows)) => {
                if let Some(connection) = &self.connection {
                    connection.grant(self.request_id);
                }
                Ok(Some(rows))
            }
            Some(StreamEvent::End(None)) => {
                self.connection = None;
                Ok(None)
            }
            Some(StreamEvent::End(Some(err))) => {
                self.connection = None;
                Err(Error::Service(err))
            }
            Some(StreamEvent::Failed(err)) => {
                self.connection = None;
                Err(err.into())
            }
            None => {
                self.connection = None;
                Err(TransportError::connection_lost("stream closed without an end marker").into())
            }
        }
    }

    /// Stops the stream and releases its slot on the connection.
    pub fn cancel(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel(self.request_id);
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Removes a call's pending slot if the caller stops waiting for it.
struct CallGuard {
    connection: Arc<Connection>,
    request_id: u64,
    armed: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.armed {
            self.connection.cancel(self.request_id);
        }
    }
}

/// Backend multiplexing calls over one connection.
#[derive(Debug)]
pub struct RpcTransport {
    address: String,
    retry_policy: RetryPolicy,
    next_request_id: AtomicU64,
    generation: AtomicU64,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    sessions: Mutex<HashMap<TransactionId, Weak<tokio::sync::Mutex<()>>>>,
}

impl RpcTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            address: config.cluster.clone(),
            retry_policy: config.retry_policy.clone(),
            next_request_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            connection: tokio::sync::Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns how many connections have been established so far.
    pub fn connections_opened(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    #[instrument(skip(self, request), fields(command = request.command))]
    pub async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let command = request.command;
        match timeout_at(request.deadline, self.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!(
                "{} did not complete before its deadline",
                command
            ))),
        }
    }

    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let _session = match &request.transaction_id {
            Some(id) => Some(self.session(id).await),
            None => None,
        };
        let connection = self.connection(request.deadline).await?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let remaining = request.deadline.saturating_duration_since(Instant::now());
        let streaming = request.streaming;
        let frame = Frame::Request {
            request_id,
            method: request.command.to_string(),
            params: request.params,
            body: request.body,
            transaction_id: request.transaction_id,
            timeout_ms: remaining.as_millis().min(u128::from(u64::MAX)) as u64,
            streaming,
            window: streaming.then_some(STREAM_WINDOW),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let mut events_rx = None;
        if streaming {
            let (events_tx, rx) = mpsc::unbounded_channel();
            events_rx = Some(rx);
            connection.register(
                request_id,
                Pending::Stream {
                    header: Some(reply_tx),
                    events: events_tx,
                },
            )?;
        } else {
            connection.register(request_id, Pending::Unary(reply_tx))?;
        }

        let mut guard = CallGuard {
            connection: connection.clone(),
            request_id,
            armed: true,
        };
        connection.send(frame)?;
        debug!(request_id, generation = connection.generation, "call sent");

        let reply = reply_rx
            .await
            .map_err(|_| TransportError::connection_lost("connection dropped the call"))?;
        guard.armed = false;

        match reply? {
            RpcResult::Ok(body) => {
                let mut response = Response::ok(body);
                if let Some(events) = events_rx {
                    response.stream = Some(ChunkStream {
                        request_id,
                        events,
                        connection: Some(connection),
                        idle_timeout: remaining.max(Duration::from_millis(1)),
                    });
                }
                Ok(response)
            }
            RpcResult::Error(err) => Ok(Response::failed(err)),
        }
    }

    async fn session(&self, id: &TransactionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, lock| lock.strong_count() > 0);
            match sessions.get(id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    sessions.insert(id.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    async fn connection(&self, deadline: Instant) -> Result<Arc<Connection>, TransportError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
        }

        let stream = super::connect(&self.address, &self.retry_policy, deadline).await?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(address = %self.address, generation, "rpc connection established");
        let connection = Connection::spawn(stream, generation);
        *slot = Some(connection.clone());
        Ok(connection)
    }
}
