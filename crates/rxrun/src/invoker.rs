//! # Host Invoker
//!
//! Opens exchanges toward the other side of the transport and hands back the
//! local `Mono`/`Flux` for the reply.
//!
//! Ids come from this side's parity class (see `Role`), so the invoker and the
//! dispatcher share one table without colliding with ids the peer opens.
//!
//! ## Flow Control
//! - A streaming reply starts with no credit. Every `request(n)` on the returned
//!   Flux becomes a RequestN frame.
//! - A channel's input may send `handshake_credit` values before the first
//!   RequestN. After that the input is pulled only as the peer grants credit.
//!
//! ## Cancellation
//! Dropping or cancelling the returned primitive sends Cancel and terminates the
//! exchange. A Cancel from the peer stops the input stream only; the reply keeps
//! flowing until the peer completes it.

use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use rxrpc::Error;
use rxrpc::Frame;
use rxrpc::MAX_OPERATION_NAME;
use rxrpc::OpenRequest;
use rxrpc::Payload;
use rxrpc::StreamId;
use rxrpc::Wire;

use crate::flux::Flux;
use crate::mono::Mono;
use crate::registry::Reply;
use crate::registry::Shape;
use crate::session::Exchange;
use crate::session::ReplySink;
use crate::session::Requester;
use crate::session::Session;

/// Calls operations served by the peer. Cheap to clone.
///
/// Must be used from within a tokio runtime: each exchange spawns a task that
/// forwards credit, cancellation and input values.
#[derive(Clone)]
pub struct HostInvoker {
    session: Arc<Session>,
}

impl HostInvoker {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// False once the transport has failed; every later call fails with `Transport`.
    pub fn is_connected(&self) -> bool {
        !self.session.is_failed()
    }

    /// Opens an exchange with raw payloads.
    ///
    /// `input` must be present exactly when `shape` is a channel. Failures to
    /// start the exchange are reported through the returned reply.
    pub fn invoke(&self, operation: &str, shape: Shape, args: Payload, input: Option<Flux<Payload>>) -> Reply {
        if self.session.is_failed() {
            return Reply::failed(shape, Error::transport("session closed"));
        }
        if shape.has_input() != input.is_some() {
            let message = format!("input stream does not match {} operation", shape);
            return Reply::failed(shape, Error::protocol_violation(message));
        }
        if operation.is_empty() || operation.len() > MAX_OPERATION_NAME {
            let message = format!("operation name must be 1 to {} bytes", MAX_OPERATION_NAME);
            return Reply::failed(shape, Error::protocol_violation(message));
        }

        let id = self.session.allocate_id();
        let (sink, reply) = match shape {
            Shape::Void => {
                let (sink, mono) = Mono::pending();
                (ReplySink::Empty(sink), Reply::Empty(mono))
            }
            Shape::Unary | Shape::ClientChannel => {
                let (sink, mono) = Mono::pending();
                (ReplySink::Single(sink), Reply::Single(mono))
            }
            Shape::ServerStream | Shape::BidiChannel => {
                let (sink, flux) = Flux::channel();
                (ReplySink::Stream(sink), Reply::Stream(flux))
            }
        };

        let requester = Requester {
            operation: operation.to_string(),
            shape,
            reply: sink.clone(),
            input: input.as_ref().map(Flux::demand_handle),
            task: None,
        };
        if !self.session.insert(id, Exchange::Requester(requester)) {
            return Reply::failed(shape, Error::protocol_violation(format!("{} already active", id)));
        }

        debug!(stream_id = %id, %operation, %shape, "open exchange");
        self.session.emit(id, Frame::open(id, &OpenRequest::new(operation, 0, args)));

        let task = tokio::spawn(request(self.session.clone(), id, sink, input));
        self.session.set_task(id, task.abort_handle());

        // The session may have failed between the check above and the insert.
        if self.session.is_failed() {
            self.session.terminate(id, [], Error::transport("session closed"));
        }
        reply
    }

    pub fn request_void<A: Wire>(&self, operation: &str, args: &A) -> Mono<()> {
        self.invoke(operation, Shape::Void, args.encode(), None).into_empty()
    }

    pub fn request_response<A: Wire, R: Wire>(&self, operation: &str, args: &A) -> Mono<R> {
        self.invoke(operation, Shape::Unary, args.encode(), None)
            .into_single()
            .and_then(|bytes| Mono::from_result(decode_reply(&bytes)))
    }

    pub fn request_stream<A: Wire, R: Wire>(&self, operation: &str, args: &A) -> Flux<R> {
        self.invoke(operation, Shape::ServerStream, args.encode(), None)
            .into_stream()
            .and_then(|bytes| decode_reply(&bytes))
    }

    /// Bidirectional channel: streams `input` to the peer and returns its reply stream.
    pub fn request_channel<A: Wire, I: Wire, R: Wire>(&self, operation: &str, args: &A, input: Flux<I>) -> Flux<R> {
        let input = input.map(|value| value.encode());
        self.invoke(operation, Shape::BidiChannel, args.encode(), Some(input))
            .into_stream()
            .and_then(|bytes| decode_reply(&bytes))
    }

    /// Client channel: streams `input` to the peer and returns its single reply.
    pub fn request_channel_single<A: Wire, I: Wire, R: Wire>(
        &self,
        operation: &str,
        args: &A,
        input: Flux<I>,
    ) -> Mono<R> {
        let input = input.map(|value| value.encode());
        self.invoke(operation, Shape::ClientChannel, args.encode(), Some(input))
            .into_single()
            .and_then(|bytes| Mono::from_result(decode_reply(&bytes)))
    }
}

impl std::fmt::Debug for HostInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostInvoker")
            .field("connected", &self.is_connected())
            .field("active", &self.session.active())
            .finish()
    }
}

fn decode_reply<R: Wire>(bytes: &[u8]) -> rxrpc::Result<R> {
    R::decode(bytes).map_err(|e| Error::protocol_violation(format!("undecodable reply: {}", e)))
}

/// Drives the local side of one requester exchange until it is terminated.
async fn request(session: Arc<Session>, id: StreamId, reply: ReplySink, input: Option<Flux<Payload>>) {
    tokio::join!(watch_reply(&session, id, reply), pump_input(&session, id, input));
}

/// Forwards the local consumer's demand as RequestN and its cancellation as Cancel.
async fn watch_reply(session: &Session, id: StreamId, reply: ReplySink) {
    match &reply {
        ReplySink::Empty(sink) => sink.cancelled().await,
        ReplySink::Single(sink) => sink.cancelled().await,
        ReplySink::Stream(sink) => loop {
            tokio::select! {
                biased;
                _ = sink.cancelled() => break,
                demand = sink.demand() => match demand {
                    Some(n) => {
                        if !session.emit_credit(id, n) {
                            return;
                        }
                    }
                    None if sink.is_cancelled() => break,
                    None => return,
                },
            }
        },
    }
    debug!(stream_id = %id, "reply cancelled locally");
    session.terminate(id, [Frame::cancel(id)], Error::cancelled());
}

/// Sends the input stream as Next frames, then Complete.
async fn pump_input(session: &Session, id: StreamId, input: Option<Flux<Payload>>) {
    let Some(mut input) = input else {
        return;
    };
    input.request(session.config().handshake_credit as u64);
    while let Some(item) = input.next().await {
        match item {
            Ok(value) => {
                if !session.emit(id, Frame::next(id, value)) {
                    return;
                }
            }
            Err(error) => {
                debug!(stream_id = %id, %error, "input stream failed");
                session.terminate(id, [Frame::error(id, &error)], error);
                return;
            }
        }
    }
    if !input.is_cancelled() {
        session.emit(id, Frame::complete(id));
    }
}
