//! Channel pair relay
//!
//! Each inbound channel is paired with a backend channel and served by three
//! kinds of task:
//! - the backend reader, which drains the backend channel and resolves
//!   request replies as they arrive
//! - the control task, which feeds data into the copy pumps and handles EOF,
//!   close and the backend's exit requests
//! - one copy task per direction (plus one for backend stderr)
//!
//! Caller data and requests come in through the connection handler's
//! callbacks. A request is forwarded from its callback, which then waits for
//! the backend's reply and answers the caller itself. russh keeps one
//! want_reply flag per channel, so replies cannot be sent from anywhere else.
//!
//! ```text
//!  handler ──mpsc──► control ──► pump ──────────► backend writer
//!  backend ──mpsc──► control ──► pump ─► filter ─► caller writer
//!  reader    │                └─► pump ──────────► caller stderr
//!            └─ success/failure ──► pending replies ──► handler callback
//! ```
//!
//! None of the readers ever waits on a channel window, so heavy traffic in
//! both directions cannot stall either session loop. russh acknowledges
//! window space as data is received, so the pumps buffer without a bound.
//!
//! `exit-status` / `exit-signal` from the backend end the pair: the pumps
//! towards the caller are drained first so no output is lost, then the
//! status is forwarded and both halves are closed.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;
use russh::client::Msg as ClientMsg;
use russh::server::{Handle as ServerHandle, Msg as ServerMsg};
use russh::{Channel, ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::{BoxedReader, StreamFilter};
use super::request::{BackendRequest, CallerRequest};
use crate::ssh::ProxyError;

/// How long a forwarded request may wait for the backend's answer
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long trailing output may take to reach the caller after exit-status
const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// How long copy tasks get to finish once the pair is torn down
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// Standard error stream (RFC 4254 section 5.2)
const EXTENDED_STDERR: u32 = 1;

/// Both halves of one logical channel
pub struct ChannelPair {
    pub conn_id: String,
    /// Creation order on the inbound connection
    pub key: usize,
    pub inbound: Channel<ServerMsg>,
    pub outbound: Channel<ClientMsg>,
    /// Inbound session handle, for the backend's exit requests
    pub caller: ServerHandle,
    /// Applied to backend-to-caller data only
    pub filter: Arc<dyn StreamFilter>,
    pub cancel: CancellationToken,
}

/// What the connection handler passes on for a pair
#[derive(Debug)]
pub enum CallerEvent {
    Data(Bytes),
    Eof,
    Close,
}

/// Reply slots of forwarded requests, oldest first. `None` once the pair is
/// shutting down; requests are then refused without being sent.
#[derive(Clone)]
struct PendingReplies(Arc<Mutex<Option<VecDeque<oneshot::Sender<bool>>>>>);

impl PendingReplies {
    fn open() -> Self {
        Self(Arc::new(Mutex::new(Some(VecDeque::new()))))
    }

    fn push(&self) -> Option<oneshot::Receiver<bool>> {
        let mut guard = self.0.lock();
        let slots = guard.as_mut()?;
        let (tx, rx) = oneshot::channel();
        slots.push_back(tx);
        Some(rx)
    }

    /// Answer the oldest request; `false` if nothing was waiting
    fn resolve(&self, accepted: bool) -> bool {
        let slot = self.0.lock().as_mut().and_then(|slots| slots.pop_front());
        match slot {
            // The callback may have timed out already
            Some(slot) => {
                let _ = slot.send(accepted);
                true
            }
            None => false,
        }
    }

    /// Refuse everything still waiting and everything after
    fn shut(&self) {
        self.0.lock().take();
    }
}

/// The connection handler's end of a running pair
pub struct PairLink {
    pub key: usize,
    events: mpsc::UnboundedSender<CallerEvent>,
    backend: Arc<ChannelWriteHalf<ClientMsg>>,
    pending: PendingReplies,
    task: JoinHandle<()>,
}

impl PairLink {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Hand caller data, EOF or close to the control task; `false` once the
    /// pair has ended
    pub fn send(&self, event: CallerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Replay `request` on the backend. Requests that take a reply wait for
    /// the backend's answer; the result is whether it accepted.
    pub async fn forward(&self, request: CallerRequest) -> Result<bool, ProxyError> {
        if !request.expects_reply() {
            request.forward(false, &self.backend).await?;
            return Ok(true);
        }

        let kind = request.kind();
        let Some(reply) = self.pending.push() else {
            debug!(pair = self.key, "Pair closing, refusing {}", kind);
            return Ok(false);
        };
        request.forward(true, &self.backend).await?;

        match tokio::time::timeout(REPLY_TIMEOUT, reply).await {
            Ok(Ok(accepted)) => Ok(accepted),
            // Pair shut down before the backend answered
            Ok(Err(_)) => Ok(false),
            Err(_) => Err(ProxyError::Timeout(format!(
                "Backend did not answer {} within {:?}",
                kind, REPLY_TIMEOUT
            ))),
        }
    }
}

/// Why the control loop stopped
#[derive(Debug)]
enum PairEnd {
    Completed(BackendRequest),
    CallerClosed,
    BackendClosed,
    Cancelled,
    Failed(ProxyError),
}

/// One direction of data flow: an mpsc feeding a copy task
struct DataPump {
    label: &'static str,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<io::Result<u64>>>,
}

impl DataPump {
    /// Start copying everything pushed into the pump to `writer`, through
    /// `filter` when given
    fn spawn<W>(
        label: &'static str,
        filter: Option<&dyn StreamFilter>,
        writer: W,
        cancel: CancellationToken,
    ) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        let source = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
        }));
        let reader: BoxedReader = Box::new(StreamReader::new(source));
        let mut reader = match filter {
            Some(filter) => filter.wrap(reader),
            None => reader,
        };
        let mut writer = Box::pin(writer);

        let task = tokio::spawn(async move {
            tokio::select! {
                result = async {
                    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
                    writer.flush().await?;
                    Ok::<u64, io::Error>(copied)
                } => result,
                _ = cancel.cancelled() => {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "connection closed"))
                }
            }
        });

        Self {
            label,
            tx: Some(tx),
            task: Some(task),
        }
    }

    fn push(&mut self, data: Bytes) -> Result<(), ProxyError> {
        let Some(tx) = &self.tx else {
            debug!("Dropping {} bytes on {} after EOF", data.len(), self.label);
            return Ok(());
        };
        tx.send(data)
            .map_err(|_| ProxyError::RelayError(format!("{} copy task stopped", self.label)))
    }

    /// No more input; the copy task ends once the queue is drained
    fn finish(&mut self) {
        self.tx = None;
    }

    fn is_draining(&self) -> bool {
        self.tx.is_none() && self.task.is_some()
    }

    fn is_done(&self) -> bool {
        self.task.is_none()
    }

    /// Wait for the copy task; `None` if it already finished or was joined
    async fn join(&mut self) -> Option<io::Result<u64>> {
        let task = self.task.as_mut()?;
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e)),
        };
        self.task = None;
        Some(result)
    }

    /// Finish and wait at most `grace`, aborting the copy task on timeout
    async fn close_within(&mut self, grace: Duration) -> Option<io::Result<u64>> {
        self.finish();
        match tokio::time::timeout(grace, self.join()).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(task) = self.task.take() {
                    warn!("{} copy task did not finish in {:?}, aborting", self.label, grace);
                    task.abort();
                }
                None
            }
        }
    }
}

impl Drop for DataPump {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start relaying a pair; the returned link is how the connection handler
/// feeds it
pub fn spawn_pair(pair: ChannelPair) -> PairLink {
    let key = pair.key;
    let pending = PendingReplies::open();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    // Caller input arrives through the handler callbacks, not the channel
    let (_, inbound) = pair.inbound.split();
    let (outbound_rx, outbound) = pair.outbound.split();
    let outbound = Arc::new(outbound);

    let (backend_tx, backend_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_backend(
        pair.conn_id.clone(),
        key,
        outbound_rx,
        pending.clone(),
        backend_tx,
    ));

    let control = Control {
        conn_id: pair.conn_id,
        key,
        inbound,
        outbound: outbound.clone(),
        caller: pair.caller,
        filter: pair.filter,
        cancel: pair.cancel,
        pending: pending.clone(),
        reader,
    };
    let task = tokio::spawn(control.run(events_rx, backend_rx));

    PairLink {
        key,
        events: events_tx,
        backend: outbound,
        pending,
        task,
    }
}

/// Drain the backend channel. Replies go straight to the waiting callbacks;
/// everything else goes to the control task.
async fn read_backend(
    conn_id: String,
    key: usize,
    mut channel: ChannelReadHalf,
    pending: PendingReplies,
    control: mpsc::UnboundedSender<ChannelMsg>,
) {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Success | ChannelMsg::Failure => {
                let accepted = matches!(msg, ChannelMsg::Success);
                if !pending.resolve(accepted) {
                    debug!(conn_id = %conn_id, pair = key, "Unsolicited reply from backend");
                }
            }
            msg => {
                if control.send(msg).is_err() {
                    break;
                }
            }
        }
    }
    pending.shut();
}

struct Control {
    conn_id: String,
    key: usize,
    inbound: ChannelWriteHalf<ServerMsg>,
    outbound: Arc<ChannelWriteHalf<ClientMsg>>,
    caller: ServerHandle,
    filter: Arc<dyn StreamFilter>,
    cancel: CancellationToken,
    pending: PendingReplies,
    reader: JoinHandle<()>,
}

impl Control {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<CallerEvent>,
        mut backend: mpsc::UnboundedReceiver<ChannelMsg>,
    ) {
        let Control {
            conn_id,
            key,
            inbound,
            outbound,
            caller,
            filter,
            cancel,
            pending,
            reader,
        } = self;

        let id = inbound.id();
        debug!(conn_id = %conn_id, pair = key, "Channel pair started ({:?})", id);

        let mut to_backend = DataPump::spawn(
            "caller->backend",
            None,
            outbound.make_writer(),
            cancel.clone(),
        );
        let mut to_caller = DataPump::spawn(
            "backend->caller",
            Some(filter.as_ref()),
            inbound.make_writer(),
            cancel.clone(),
        );
        let mut stderr_to_caller = DataPump::spawn(
            "backend->caller stderr",
            None,
            inbound.make_writer_ext(Some(EXTENDED_STDERR)),
            cancel.clone(),
        );
        let mut caller_eof_sent = false;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break PairEnd::Cancelled,

                event = events.recv() => match event {
                    Some(CallerEvent::Data(data)) => {
                        if let Err(e) = to_backend.push(data) {
                            break PairEnd::Failed(e);
                        }
                    }
                    Some(CallerEvent::Eof) => {
                        debug!(conn_id = %conn_id, pair = key, "Caller sent EOF");
                        to_backend.finish();
                    }
                    Some(CallerEvent::Close) | None => break PairEnd::CallerClosed,
                },

                msg = backend.recv() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if let Err(e) = to_caller.push(Bytes::copy_from_slice(&data)) {
                            break PairEnd::Failed(e);
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) if ext == EXTENDED_STDERR => {
                        if let Err(e) = stderr_to_caller.push(Bytes::copy_from_slice(&data)) {
                            break PairEnd::Failed(e);
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        debug!(
                            conn_id = %conn_id,
                            pair = key,
                            "Dropping {} bytes of extended data type {}",
                            data.len(),
                            ext
                        );
                    }
                    Some(ChannelMsg::Eof) => {
                        debug!(conn_id = %conn_id, pair = key, "Backend sent EOF");
                        to_caller.finish();
                        stderr_to_caller.finish();
                    }
                    Some(ChannelMsg::Close) | None => break PairEnd::BackendClosed,
                    Some(msg) => {
                        let Some(request) = BackendRequest::from_msg(&msg) else {
                            continue;
                        };
                        if request.is_completion() {
                            break PairEnd::Completed(request);
                        }
                        debug!(
                            conn_id = %conn_id,
                            pair = key,
                            "Forwarding {} to caller",
                            request.kind()
                        );
                        if let Err(e) = request.forward(&caller, id).await {
                            break PairEnd::Failed(e);
                        }
                    }
                },

                result = to_backend.join(), if to_backend.is_draining() => {
                    log_pump(&conn_id, key, "caller->backend", result);
                    let _ = outbound.eof().await;
                }

                result = to_caller.join(), if to_caller.is_draining() => {
                    log_pump(&conn_id, key, "backend->caller", result);
                    if stderr_to_caller.is_done() && !caller_eof_sent {
                        caller_eof_sent = true;
                        let _ = inbound.eof().await;
                    }
                }

                result = stderr_to_caller.join(), if stderr_to_caller.is_draining() => {
                    log_pump(&conn_id, key, "backend->caller stderr", result);
                    if to_caller.is_done() && !caller_eof_sent {
                        caller_eof_sent = true;
                        let _ = inbound.eof().await;
                    }
                }
            }
        };

        // Requests still waiting are refused from here on
        pending.shut();

        match end {
            PairEnd::Completed(request) => {
                let (out, err) = tokio::join!(
                    to_caller.close_within(DRAIN_GRACE),
                    stderr_to_caller.close_within(DRAIN_GRACE)
                );
                log_pump(&conn_id, key, "backend->caller", out);
                log_pump(&conn_id, key, "backend->caller stderr", err);
                if !caller_eof_sent {
                    let _ = inbound.eof().await;
                }
                info!(
                    conn_id = %conn_id,
                    pair = key,
                    "Backend sent {}, closing pair",
                    request.kind()
                );
                if let Err(e) = request.forward(&caller, id).await {
                    warn!(conn_id = %conn_id, pair = key, "{}", e);
                }
            }
            PairEnd::CallerClosed => {
                debug!(conn_id = %conn_id, pair = key, "Caller closed channel");
            }
            PairEnd::BackendClosed => {
                debug!(conn_id = %conn_id, pair = key, "Backend closed channel");
            }
            PairEnd::Cancelled => {
                debug!(conn_id = %conn_id, pair = key, "Connection closed, cancelling pair");
            }
            PairEnd::Failed(e) => {
                warn!(conn_id = %conn_id, pair = key, "Relay failed: {}", e);
            }
        }

        let (to_backend_result, to_caller_result, stderr_result) = tokio::join!(
            to_backend.close_within(JOIN_GRACE),
            to_caller.close_within(JOIN_GRACE),
            stderr_to_caller.close_within(JOIN_GRACE)
        );
        log_pump(&conn_id, key, "caller->backend", to_backend_result);
        log_pump(&conn_id, key, "backend->caller", to_caller_result);
        log_pump(&conn_id, key, "backend->caller stderr", stderr_result);

        let _ = outbound.close().await;
        let _ = inbound.close().await;
        reader.abort();
        debug!(conn_id = %conn_id, pair = key, "Channel pair closed");
    }
}

fn log_pump(conn_id: &str, key: usize, label: &str, result: Option<io::Result<u64>>) {
    match result {
        Some(Ok(bytes)) => debug!(conn_id = %conn_id, pair = key, "{} copied {} bytes", label, bytes),
        Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
        Some(Err(e)) => warn!(conn_id = %conn_id, pair = key, "{} copy failed: {}", label, e),
        None => {}
    }
}
