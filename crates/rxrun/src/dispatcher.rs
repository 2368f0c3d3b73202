//! # Dispatcher
//!
//! Reads frames from the transport and routes them to exchanges by stream id.
//!
//! ## Architecture
//!
//! - **Reader Loop**: one task decodes inbound frames and handles them one at a
//!   time, so frames for the same id are seen in arrival order. Handling a frame
//!   never awaits; slow work happens in the exchange's own task.
//! - **Responder Tasks**: an Open resolves the registry, invokes the handler and
//!   spawns one task that turns the returned `Mono`/`Flux` into Next, Complete and
//!   Error frames, and turns the handler's demand on its input proxy into RequestN.
//! - **Fast Path**: a reply that is already settled (an unimplemented stub, for
//!   instance) is answered while the Open is still being handled and the id never
//!   becomes Active.
//!
//! ## Failure Rules
//! - Unknown operation or malformed Open: one Error frame, the id is closed.
//! - Frames for inactive ids: dropped if the id closed recently or the frame is a
//!   Cancel or Error; otherwise answered with a `ProtocolViolation` Error frame.
//! - Handler panics become `Application` errors for that stream only.
//! - Transport failure terminates every exchange with `Transport`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;

use futures::FutureExt;
use futures::StreamExt;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use rxrpc::Error;
use rxrpc::ErrorKind;
use rxrpc::Frame;
use rxrpc::FrameKind;
use rxrpc::Payload;
use rxrpc::StreamId;
use rxrpc::peek_stream_id;

use crate::context::Context;
use crate::flux::Demand;
use crate::flux::Flux;
use crate::flux::FluxSink;
use crate::registry::Registry;
use crate::registry::Reply;
use crate::session::Exchange;
use crate::session::ReplySink;
use crate::session::Responder;
use crate::session::Session;
use crate::transport;
use crate::transport::Transport;

/// Inbound frame router for one session.
pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    session: Arc<Session>,
}

/// What the reader needs from an active exchange to handle one frame.
enum Route {
    Responder {
        input: Option<FluxSink<Payload>>,
        output: Option<Demand>,
    },
    Requester {
        reply: ReplySink,
        input: Option<Demand>,
    },
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, session: Arc<Session>) -> Self {
        Self { registry, session }
    }

    /// Reads until the transport closes or fails, then fails the session.
    pub async fn run(self, transport: Arc<dyn Transport>) {
        let error = loop {
            match transport.recv().await {
                Ok(Some(bytes)) => self.handle_bytes(&bytes),
                Ok(None) => break transport::Error::ConnectionLost("Stream closed".into()),
                Err(e) => {
                    warn!(error = %e, "transport error in reader");
                    break e;
                }
            }
        };
        self.session.fail_all(error.into());
    }

    pub fn handle_bytes(&self, bytes: &[u8]) {
        if self.session.is_failed() {
            return;
        }
        match Frame::decode_with_limit(bytes, self.session.config().max_payload_len) {
            Ok(frame) => self.handle_frame(frame),
            Err(e) => match peek_stream_id(bytes) {
                Ok(id) => {
                    warn!(stream_id = %id, error = %e, "undecodable frame");
                    self.violation(id, Error::protocol_violation(format!("undecodable frame: {}", e)));
                }
                Err(_) => warn!(error = %e, len = bytes.len(), "dropping undecodable frame"),
            },
        }
    }

    pub fn handle_frame(&self, frame: Frame) {
        let id = frame.stream_id;
        trace!(stream_id = %id, kind = ?frame.kind, "inbound frame");

        if frame.kind == FrameKind::Open {
            return self.handle_open(frame);
        }

        let route = self.session.with_exchange(id, |exchange| match exchange {
            Exchange::Responder(r) => Route::Responder {
                input: r.input.clone(),
                output: r.output.clone(),
            },
            Exchange::Requester(r) => Route::Requester {
                reply: r.reply.clone(),
                input: r.input.clone(),
            },
        });

        match route {
            Some(Route::Responder { input, output }) => self.on_responder(frame, input, output),
            Some(Route::Requester { reply, input }) => self.on_requester(frame, reply, input),
            None => self.on_inactive(frame),
        }
    }

    fn handle_open(&self, frame: Frame) {
        let id = frame.stream_id;
        if self.session.contains(id) {
            warn!(stream_id = %id, "open for an active stream");
            return self.violation(id, Error::protocol_violation("stream id already active"));
        }

        let open = match frame.open_request() {
            Ok(open) => open,
            Err(e) => {
                warn!(stream_id = %id, error = %e, "malformed open");
                return self.reject(id, Error::protocol_violation(format!("malformed open: {}", e)));
            }
        };

        let entry = match self.registry.resolve(&open.operation) {
            Ok(entry) => entry,
            Err(error) => {
                debug!(stream_id = %id, operation = %open.operation, "unknown operation");
                return self.reject(id, error);
            }
        };

        let descriptor = entry.descriptor().clone();
        let ctx = Context::new(id, descriptor.clone());
        let (input_sink, input) = if descriptor.shape.has_input() {
            let (sink, flux) = Flux::channel();
            sink.grant(self.session.config().handshake_credit as u64);
            (Some(sink), Some(flux))
        } else {
            (None, None)
        };

        debug!(stream_id = %id, operation = %descriptor.name, shape = %descriptor.shape, "open");
        let invoked = catch_unwind(AssertUnwindSafe(|| entry.invoke(ctx, open.args, input)));
        let mut reply = match invoked {
            Ok(reply) => reply,
            Err(panic) => {
                warn!(stream_id = %id, operation = %descriptor.name, "handler panicked");
                return self.reject(id, panic_error(panic));
            }
        };

        if let Some(frames) = settle_now(id, &mut reply) {
            trace!(stream_id = %id, "reply settled during open");
            for frame in frames {
                self.session.send(frame);
            }
            self.session.close(id);
            return;
        }

        let output = match &reply {
            Reply::Stream(flux) => {
                flux.request(open.initial_request as u64);
                Some(flux.demand_handle())
            }
            _ => None,
        };

        let responder = Responder {
            descriptor,
            input: input_sink.clone(),
            output,
            task: None,
        };
        if !self.session.insert(id, Exchange::Responder(responder)) {
            return self.violation(id, Error::protocol_violation("stream id already active"));
        }

        let task = tokio::spawn(respond(self.session.clone(), id, reply, input_sink));
        self.session.set_task(id, task.abort_handle());
    }

    /// Frames for an exchange this side is serving.
    fn on_responder(&self, frame: Frame, input: Option<FluxSink<Payload>>, output: Option<Demand>) {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Next => match input {
                Some(input) => match input.try_next(frame.payload) {
                    Ok(()) => {}
                    Err(e) if e.is(ErrorKind::Cancelled) => trace!(stream_id = %id, "input cancelled, dropping value"),
                    Err(e) => self.violation(id, e),
                },
                None => self.violation(id, Error::protocol_violation("exchange has no input stream")),
            },
            FrameKind::RequestN => match output {
                Some(output) => output.request(frame.requested.unwrap_or(0) as u64),
                None => trace!(stream_id = %id, "ignoring credit for a single reply"),
            },
            FrameKind::Complete => match input {
                Some(input) => match input.complete() {
                    Ok(()) => {}
                    Err(e) if e.is(ErrorKind::Cancelled) => {}
                    Err(e) => self.violation(id, e),
                },
                None => self.violation(id, Error::protocol_violation("exchange has no input stream")),
            },
            FrameKind::Error => {
                let error = remote_error(&frame);
                debug!(stream_id = %id, %error, "requester failed the exchange");
                self.session.terminate(id, [], error);
            }
            FrameKind::Cancel => {
                debug!(stream_id = %id, "requester cancelled");
                self.session.terminate(id, [], Error::cancelled());
            }
            FrameKind::Open => {}
        }
    }

    /// Frames answering an exchange this side opened.
    fn on_requester(&self, frame: Frame, reply: ReplySink, input: Option<Demand>) {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Next => match reply.next(frame.payload) {
                Ok(true) => self.session.terminate(id, [], Error::cancelled()),
                Ok(false) => {}
                Err(e) if e.is(ErrorKind::Cancelled) => trace!(stream_id = %id, "reply cancelled, dropping value"),
                Err(e) => self.violation(id, e),
            },
            FrameKind::RequestN => match input {
                Some(input) => input.request(frame.requested.unwrap_or(0) as u64),
                None => trace!(stream_id = %id, "ignoring credit for an exchange without input"),
            },
            FrameKind::Complete => {
                let _ = reply.complete();
                self.session.terminate(id, [], Error::cancelled());
            }
            FrameKind::Error => {
                let error = remote_error(&frame);
                debug!(stream_id = %id, %error, "exchange failed remotely");
                let _ = reply.fail(error.clone());
                self.session.terminate(id, [], error);
            }
            // Either side cancelling a channel tears down both directions.
            FrameKind::Cancel => {
                debug!(stream_id = %id, "responder cancelled");
                self.session.terminate(id, [], Error::cancelled());
            }
            FrameKind::Open => {}
        }
    }

    fn on_inactive(&self, frame: Frame) {
        let id = frame.stream_id;
        if matches!(frame.kind, FrameKind::Cancel | FrameKind::Error) {
            trace!(stream_id = %id, kind = ?frame.kind, "dropping terminal for inactive stream");
        } else if self.session.recently_closed(id) {
            trace!(stream_id = %id, kind = ?frame.kind, "dropping late frame");
        } else {
            debug!(stream_id = %id, kind = ?frame.kind, "frame for unknown stream");
            self.reject(id, Error::protocol_violation("no active exchange for stream"));
        }
    }

    /// Ends an id that never became Active with a single Error frame.
    fn reject(&self, id: StreamId, error: Error) {
        self.session.send(Frame::error(id, &error));
        self.session.close(id);
    }

    /// Fails the exchange on `id` (or just the id) with a protocol violation.
    fn violation(&self, id: StreamId, error: Error) {
        match self.session.finish(id, [Frame::error(id, &error)]) {
            Some(exchange) => exchange.release(error),
            None => self.reject(id, error),
        }
    }
}

fn remote_error(frame: &Frame) -> Error {
    frame
        .error_payload()
        .unwrap_or_else(|e| Error::protocol_violation(format!("undecodable error payload: {}", e)))
}

pub(crate) fn panic_error(panic: Box<dyn Any + Send>) -> Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Error::application(format!("handler panicked: {}", message))
}

/// Polls a single reply once. Returns its frames if it was already settled.
fn settle_now(id: StreamId, reply: &mut Reply) -> Option<Vec<Frame>> {
    let polled = catch_unwind(AssertUnwindSafe(|| match reply {
        Reply::Empty(mono) => mono.now_or_never().map(|outcome| outcome.map(|()| None)),
        Reply::Single(mono) => mono.now_or_never().map(|outcome| outcome.map(Some)),
        Reply::Stream(_) => None,
    }));
    match polled {
        Ok(None) => None,
        Ok(Some(outcome)) => Some(single_frames(id, outcome)),
        Err(panic) => Some(vec![Frame::error(id, &panic_error(panic))]),
    }
}

fn single_frames(id: StreamId, outcome: rxrpc::Result<Option<Payload>>) -> Vec<Frame> {
    match outcome {
        Ok(None) => vec![Frame::complete(id)],
        Ok(Some(value)) => vec![Frame::next(id, value), Frame::complete(id)],
        Err(error) => vec![Frame::error(id, &error)],
    }
}

/// Drives one responder exchange to Terminal.
async fn respond(session: Arc<Session>, id: StreamId, reply: Reply, input: Option<FluxSink<Payload>>) {
    let output = drive_output(&session, id, reply);
    tokio::pin!(output);
    match input {
        None => output.await,
        Some(input) => {
            tokio::select! {
                _ = &mut output => {}
                _ = forward_demand(&session, id, &input) => output.await,
            }
        }
    }
}

async fn drive_output(session: &Session, id: StreamId, reply: Reply) {
    let frames = match reply {
        Reply::Empty(mono) => match AssertUnwindSafe(mono).catch_unwind().await {
            Ok(outcome) => single_frames(id, outcome.map(|()| None)),
            Err(panic) => vec![Frame::error(id, &panic_error(panic))],
        },
        Reply::Single(mono) => match AssertUnwindSafe(mono).catch_unwind().await {
            Ok(outcome) => single_frames(id, outcome.map(Some)),
            Err(panic) => vec![Frame::error(id, &panic_error(panic))],
        },
        Reply::Stream(flux) => match stream_output(session, id, flux).await {
            Some(frames) => frames,
            None => return,
        },
    };
    session.terminate(id, frames, Error::cancelled());
}

/// Forwards values as Next frames. Returns the terminal frames, or `None` if the
/// exchange ended underneath it.
async fn stream_output(session: &Session, id: StreamId, mut flux: Flux<Payload>) -> Option<Vec<Frame>> {
    loop {
        match AssertUnwindSafe(flux.next()).catch_unwind().await {
            Ok(Some(Ok(value))) => {
                if !session.emit(id, Frame::next(id, value)) {
                    return None;
                }
            }
            Ok(Some(Err(error))) => return Some(vec![Frame::error(id, &error)]),
            Ok(None) => return Some(vec![Frame::complete(id)]),
            Err(panic) => return Some(vec![Frame::error(id, &panic_error(panic))]),
        }
    }
}

/// Turns the handler's demand on its input proxy into RequestN frames. Its
/// cancellation ends the whole exchange with a Cancel frame.
async fn forward_demand(session: &Session, id: StreamId, input: &FluxSink<Payload>) {
    loop {
        tokio::select! {
            biased;
            _ = input.cancelled() => break,
            demand = input.demand() => match demand {
                Some(n) => {
                    if !session.emit_credit(id, n) {
                        return;
                    }
                }
                None if input.is_cancelled() => break,
                None => return,
            },
        }
    }
    debug!(stream_id = %id, "handler cancelled its input");
    session.terminate(id, [Frame::cancel(id)], Error::cancelled());
}
