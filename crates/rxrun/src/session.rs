//! # Session State
//!
//! The active-stream table of one transport, shared by the dispatcher (frames
//! arriving from the peer) and the host invoker (exchanges opened locally).
//!
//! Every exchange moves through `Idle → Active → Terminal`. Idle ids have no
//! entry; Active ids own an `Exchange` in the table; the Terminal transition
//! removes the entry, records the id in a bounded history of recently closed ids
//! and releases whatever the exchange still holds.
//!
//! ## Invariants
//! - **Emission Requires Presence**: frames for an exchange are queued while
//!   holding that id's table entry, so once Terminal is reached (for example by an
//!   inbound Cancel) no further frame for the id leaves this side.
//! - **Atomic Terminal**: `finish` queues the final frames and removes the entry
//!   under the same shard lock. Whoever gets the entry settles the exchange;
//!   everyone else sees `None`.
//! - **Single Writer**: all outbound frames pass through one unbounded queue,
//!   drained in order by one writer task.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use rxrpc::Error;
use rxrpc::Frame;
use rxrpc::Payload;
use rxrpc::Result;
use rxrpc::StreamId;

use crate::config::Config;
use crate::flux::Demand;
use crate::flux::FluxSink;
use crate::flux::MAX_CREDIT;
use crate::mono::MonoSink;
use crate::registry::OperationDescriptor;
use crate::registry::Shape;
use crate::transport;
use crate::transport::Transport;

/// This side is serving an Open that arrived from the peer.
pub(crate) struct Responder {
    pub descriptor: Arc<OperationDescriptor>,
    /// Feeds the handler's input proxy; channel shapes only.
    pub input: Option<FluxSink<Payload>>,
    /// Credit and cancellation for a streaming reply.
    pub output: Option<Demand>,
    pub task: Option<AbortHandle>,
}

/// Where the peer's reply to a local request goes.
pub(crate) enum ReplySink {
    Empty(MonoSink<()>),
    Single(MonoSink<Payload>),
    Stream(FluxSink<Payload>),
}

impl ReplySink {
    /// Delivers one value. `Ok(true)` means the reply is now complete.
    pub fn next(&self, value: Payload) -> Result<bool> {
        match self {
            Self::Empty(_) => Err(Error::protocol_violation("value on a void exchange")),
            Self::Single(sink) => sink.resolve(value).map(|()| true),
            Self::Stream(sink) => sink.try_next(value).map(|()| false),
        }
    }

    pub fn complete(&self) -> Result<()> {
        match self {
            Self::Empty(sink) => sink.resolve(()),
            Self::Single(sink) => sink.fail(Error::protocol_violation("completed without a value")),
            Self::Stream(sink) => sink.complete(),
        }
    }

    pub fn fail(&self, error: Error) -> Result<()> {
        match self {
            Self::Empty(sink) => sink.fail(error),
            Self::Single(sink) => sink.fail(error),
            Self::Stream(sink) => sink.error(error),
        }
    }
}

impl Clone for ReplySink {
    fn clone(&self) -> Self {
        match self {
            Self::Empty(sink) => Self::Empty(sink.clone()),
            Self::Single(sink) => Self::Single(sink.clone()),
            Self::Stream(sink) => Self::Stream(sink.clone()),
        }
    }
}

/// This side opened the exchange through the host invoker.
pub(crate) struct Requester {
    pub operation: String,
    pub shape: Shape,
    pub reply: ReplySink,
    /// Credit and cancellation for the local input stream; channel shapes only.
    pub input: Option<Demand>,
    pub task: Option<AbortHandle>,
}

pub(crate) enum Exchange {
    Responder(Responder),
    Requester(Requester),
}

impl Exchange {
    fn set_task(&mut self, task: AbortHandle) {
        match self {
            Self::Responder(r) => r.task = Some(task),
            Self::Requester(r) => r.task = Some(task),
        }
    }

    /// Tears down what the exchange still holds. `reason` reaches any local
    /// consumer that has not yet seen a terminal.
    pub fn release(self, reason: Error) {
        match self {
            Self::Responder(r) => {
                trace!(operation = %r.descriptor.name, %reason, "release responder");
                if let Some(input) = &r.input {
                    let _ = input.error(reason);
                }
                if let Some(output) = &r.output {
                    output.cancel();
                }
                if let Some(task) = &r.task {
                    task.abort();
                }
            }
            Self::Requester(r) => {
                trace!(operation = %r.operation, shape = %r.shape, %reason, "release requester");
                let _ = r.reply.fail(reason);
                if let Some(input) = &r.input {
                    input.cancel();
                }
                if let Some(task) = &r.task {
                    task.abort();
                }
            }
        }
    }
}

/// Bounded memory of terminated ids, so late frames can be told apart from
/// frames for ids that never existed.
struct ClosedIds {
    order: VecDeque<StreamId>,
    ids: HashSet<StreamId>,
    capacity: usize,
}

impl ClosedIds {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::new(), ids: HashSet::new(), capacity }
    }

    fn record(&mut self, id: StreamId) {
        if self.capacity == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: StreamId) -> bool {
        self.ids.contains(&id)
    }
}

pub(crate) struct Session {
    config: Config,
    table: DashMap<StreamId, Exchange>,
    closed: Mutex<ClosedIds>,
    outbound: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU32,
    failed: AtomicBool,
}

impl Session {
    /// Creates the session and the receiving end of its outbound queue.
    pub fn new(config: Config) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let session = Self {
            next_id: AtomicU32::new(config.role.first_id()),
            closed: Mutex::new(ClosedIds::new(config.closed_history)),
            config,
            table: DashMap::new(),
            outbound,
            failed: AtomicBool::new(false),
        };
        (session, rx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn active(&self) -> usize {
        self.table.len()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.table.contains_key(&id)
    }

    /// Next free id of this side's parity.
    pub fn allocate_id(&self) -> StreamId {
        loop {
            let raw = self.next_id.fetch_add(2, Ordering::Relaxed);
            let id = StreamId(raw);
            if raw != 0 && !self.table.contains_key(&id) {
                return id;
            }
        }
    }

    /// Adds an Active exchange. Fails if the id already has one.
    pub fn insert(&self, id: StreamId, exchange: Exchange) -> bool {
        match self.table.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(exchange);
                true
            }
        }
    }

    /// Attaches the task driving an exchange. If the exchange already ended, the
    /// task is stopped instead.
    pub fn set_task(&self, id: StreamId, task: AbortHandle) {
        match self.table.get_mut(&id) {
            Some(mut exchange) => exchange.set_task(task),
            None => task.abort(),
        }
    }

    /// Runs `f` against an active exchange without removing it.
    ///
    /// `f` runs under the entry's shard lock; it must not touch the table.
    pub fn with_exchange<R>(&self, id: StreamId, f: impl FnOnce(&Exchange) -> R) -> Option<R> {
        self.table.get(&id).map(|exchange| f(exchange.value()))
    }

    /// Queues `frame` if the exchange is still active. Returns false once it is not.
    pub fn emit(&self, id: StreamId, frame: Frame) -> bool {
        match self.table.get(&id) {
            Some(_entry) => {
                self.push(frame);
                true
            }
            None => false,
        }
    }

    /// Emits RequestN frames granting `n` credit, split at the per-frame maximum.
    pub fn emit_credit(&self, id: StreamId, n: u64) -> bool {
        let mut left = n;
        while left > 0 {
            let chunk = left.min(MAX_CREDIT);
            if !self.emit(id, Frame::request_n(id, chunk as u32)) {
                return false;
            }
            left -= chunk;
        }
        true
    }

    /// Queues a frame for an id that has no exchange (rejections and replies to
    /// stray frames).
    pub fn send(&self, frame: Frame) {
        self.push(frame);
    }

    fn push(&self, frame: Frame) {
        trace!(stream_id = %frame.stream_id, kind = ?frame.kind, "queue frame");
        if self.outbound.send(frame).is_err() {
            debug!("outbound queue closed, dropping frame");
        }
    }

    /// Moves an exchange to Terminal: queues `frames`, removes the entry and
    /// records the id as closed. Returns the exchange so the caller can settle
    /// its primitives; `None` if it had already ended.
    pub fn finish(&self, id: StreamId, frames: impl IntoIterator<Item = Frame>) -> Option<Exchange> {
        let exchange = match self.table.entry(id) {
            Entry::Occupied(entry) => {
                for frame in frames {
                    self.push(frame);
                }
                entry.remove()
            }
            Entry::Vacant(_) => return None,
        };
        self.close(id);
        debug!(stream_id = %id, active = self.table.len(), "exchange terminated");
        Some(exchange)
    }

    /// `finish` followed by `release`.
    pub fn terminate(&self, id: StreamId, frames: impl IntoIterator<Item = Frame>, reason: Error) {
        if let Some(exchange) = self.finish(id, frames) {
            exchange.release(reason);
        }
    }

    /// Records an id as closed. Also used for ids that were rejected at Open
    /// and never became Active.
    pub fn close(&self, id: StreamId) {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner).record(id);
    }

    pub fn recently_closed(&self, id: StreamId) -> bool {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner).contains(id)
    }

    /// Terminates every exchange with `error` and refuses new ones.
    pub fn fail_all(&self, error: Error) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(%error, active = self.table.len(), "session failed");
        let ids: Vec<StreamId> = self.table.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, exchange)) = self.table.remove(&id) {
                exchange.release(error.clone());
            }
        }
    }
}

/// Single writer: encodes queued frames in order and hands them to the transport.
///
/// A frame the transport refuses as too large fails only its exchange. The
/// Error frame goes out immediately, and the frames already queued behind the
/// refused one for that id are skipped so the peer never sees them after it.
pub(crate) async fn write_loop(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    // (id, last sequence number queued when the id was refused)
    let mut refused: Vec<(StreamId, u64)> = Vec::new();
    let mut seq: u64 = 0;
    while let Some(frame) = outbound.recv().await {
        seq += 1;
        let id = frame.stream_id;
        refused.retain(|&(_, last)| last >= seq);
        if refused.iter().any(|&(skipped, _)| skipped == id) {
            trace!(stream_id = %id, kind = ?frame.kind, "skipping frame after refusal");
            continue;
        }
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(stream_id = %id, error = %e, "dropping unencodable frame");
                continue;
            }
        };
        let sent = match transport.send(&bytes).await {
            Err(e @ transport::Error::PayloadTooLarge(_)) => {
                warn!(stream_id = %id, error = %e, "frame refused by transport");
                let error = Error::from(e);
                // Replies settled at Open never had an entry.
                if let Some(exchange) = session.finish(id, []) {
                    exchange.release(error.clone());
                }
                refused.push((id, seq + outbound.len() as u64));
                match Frame::error(id, &error).encode() {
                    Ok(bytes) => transport.send(&bytes).await,
                    Err(_) => Ok(()),
                }
            }
            sent => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "transport error in writer");
            session.fail_all(e.into());
            break;
        }
    }
}
