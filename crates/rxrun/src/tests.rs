//! Tests for session bookkeeping and frame routing, without a transport.

use std::sync::Arc;
use std::sync::Mutex;

use futures::FutureExt;
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedReceiver;

use rxrpc::Error;
use rxrpc::ErrorKind;
use rxrpc::Frame;
use rxrpc::FrameKind;
use rxrpc::OpenRequest;
use rxrpc::Payload;
use rxrpc::StreamId;
use rxrpc::Wire;

use crate::config::Config;
use crate::config::Role;
use crate::dispatcher::Dispatcher;
use crate::flux::Flux;
use crate::mono::Mono;
use crate::mono::MonoSink;
use crate::registry::Registry;
use crate::registry::Shape;
use crate::session::Exchange;
use crate::session::ReplySink;
use crate::session::Requester;
use crate::session::Session;

fn requester(shape: Shape) -> (Exchange, Mono<()>) {
    let (sink, mono) = Mono::pending();
    let exchange = Exchange::Requester(Requester {
        operation: "op".into(),
        shape,
        reply: ReplySink::Empty(sink),
        input: None,
        task: None,
    });
    (exchange, mono)
}

fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn error_kind(frame: &Frame) -> ErrorKind {
    assert_eq!(frame.kind, FrameKind::Error);
    frame.error_payload().unwrap().kind
}

// --- Session ---

#[test]
fn ids_follow_role_parity() {
    let (guest, _rx) = Session::new(Config::standard().with_role(Role::Guest));
    let ids: Vec<u32> = (0..3).map(|_| guest.allocate_id().0).collect();
    assert_eq!(ids, vec![2, 4, 6]);

    let (host, _rx) = Session::new(Config::standard().with_role(Role::Host));
    let ids: Vec<u32> = (0..3).map(|_| host.allocate_id().0).collect();
    assert_eq!(ids, vec![1, 3, 5]);
}

#[test]
fn allocation_skips_active_ids() {
    let (session, _rx) = Session::new(Config::standard().with_role(Role::Host));
    let (exchange, _mono) = requester(Shape::Void);
    assert!(session.insert(StreamId(1), exchange));
    assert_eq!(session.allocate_id(), StreamId(3));
}

#[test]
fn closed_history_is_bounded() {
    let (session, _rx) = Session::new(Config::standard().with_closed_history(2));
    session.close(StreamId(1));
    session.close(StreamId(3));
    session.close(StreamId(5));

    assert!(!session.recently_closed(StreamId(1)));
    assert!(session.recently_closed(StreamId(3)));
    assert!(session.recently_closed(StreamId(5)));
}

#[test]
fn emission_requires_an_active_exchange() {
    let (session, mut rx) = Session::new(Config::standard());
    let id = StreamId(7);
    assert!(!session.emit(id, Frame::complete(id)));
    assert!(drain(&mut rx).is_empty());

    let (exchange, _mono) = requester(Shape::Void);
    assert!(session.insert(id, exchange));
    assert!(session.emit(id, Frame::request_n(id, 1)));

    assert!(session.finish(id, [Frame::cancel(id)]).is_some());
    assert!(!session.emit(id, Frame::complete(id)));
    assert!(session.finish(id, [Frame::cancel(id)]).is_none());

    let kinds: Vec<_> = drain(&mut rx).into_iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FrameKind::RequestN, FrameKind::Cancel]);
    assert!(session.recently_closed(id));
}

#[test]
fn large_credit_is_split_across_frames() {
    let (session, mut rx) = Session::new(Config::standard());
    let id = StreamId(2);
    let (exchange, _mono) = requester(Shape::ServerStream);
    session.insert(id, exchange);

    assert!(session.emit_credit(id, u32::MAX as u64 + 5));
    let counts: Vec<_> = drain(&mut rx).into_iter().map(|f| f.requested.unwrap()).collect();
    assert_eq!(counts, vec![u32::MAX, 5]);
}

#[test]
fn failing_the_session_releases_every_exchange() {
    let (session, _rx) = Session::new(Config::standard());
    let (a, mono_a) = requester(Shape::Void);
    let (b, mono_b) = requester(Shape::Void);
    session.insert(StreamId(2), a);
    session.insert(StreamId(4), b);

    session.fail_all(Error::transport("gone"));
    assert!(session.is_failed());
    assert_eq!(session.active(), 0);
    assert!(mono_a.now_or_never().unwrap().unwrap_err().is(ErrorKind::Transport));
    assert!(mono_b.now_or_never().unwrap().unwrap_err().is(ErrorKind::Transport));
}

// --- Dispatcher ---

fn dispatcher(registry: Registry) -> (Dispatcher, Arc<Session>, UnboundedReceiver<Frame>) {
    let (session, rx) = Session::new(Config::standard());
    let session = Arc::new(session);
    (Dispatcher::new(Arc::new(registry), session.clone()), session, rx)
}

fn open(id: u32, operation: &str, args: Vec<u8>) -> Frame {
    Frame::open(StreamId(id), &OpenRequest::new(operation, 0, args))
}

#[tokio::test]
async fn settled_replies_never_become_active() {
    let mut registry = Registry::new();
    registry.register_unary("double", |_, v: u32| Mono::just(v * 2)).unwrap();
    let (dispatcher, session, mut rx) = dispatcher(registry);

    dispatcher.handle_frame(open(1, "double", 21u32.encode()));

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].kind, FrameKind::Next);
    assert_eq!(u32::decode(&frames[0].payload).unwrap(), 42);
    assert_eq!(frames[1].kind, FrameKind::Complete);
    assert_eq!(session.active(), 0);
    assert!(session.recently_closed(StreamId(1)));
}

#[tokio::test]
async fn unknown_operation_closes_the_id() {
    let (dispatcher, session, mut rx) = dispatcher(Registry::new());

    dispatcher.handle_frame(open(1, "missing", Vec::new()));
    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(error_kind(&frames[0]), ErrorKind::UnknownOperation);

    // Late frames for the rejected id are dropped quietly.
    dispatcher.handle_frame(Frame::next(StreamId(1), vec![1]));
    dispatcher.handle_frame(Frame::complete(StreamId(1)));
    assert!(drain(&mut rx).is_empty());
    assert_eq!(session.active(), 0);
}

#[tokio::test]
async fn frames_for_unknown_ids_are_violations() {
    let (dispatcher, _session, mut rx) = dispatcher(Registry::new());

    dispatcher.handle_frame(Frame::next(StreamId(9), vec![1]));
    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].stream_id, StreamId(9));
    assert_eq!(error_kind(&frames[0]), ErrorKind::ProtocolViolation);

    dispatcher.handle_frame(Frame::cancel(StreamId(11)));
    dispatcher.handle_frame(Frame::error(StreamId(13), &Error::application("x")));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn pending_stream_becomes_active_until_cancelled() {
    let mut registry = Registry::new();
    registry
        .register_server_stream("ticks", |_, _: ()| Flux::<u32>::from_stream(futures::stream::pending()))
        .unwrap();
    let (dispatcher, session, mut rx) = dispatcher(registry);

    dispatcher.handle_frame(open(1, "ticks", Vec::new()));
    assert_eq!(session.active(), 1);
    assert!(drain(&mut rx).is_empty());

    dispatcher.handle_frame(open(1, "ticks", Vec::new()));
    let frames = drain(&mut rx);
    assert_eq!(error_kind(&frames[0]), ErrorKind::ProtocolViolation);
    assert_eq!(session.active(), 0);

    dispatcher.handle_frame(open(3, "ticks", Vec::new()));
    dispatcher.handle_frame(Frame::cancel(StreamId(3)));
    assert_eq!(session.active(), 0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn panicking_handler_fails_only_its_exchange() {
    let mut registry = Registry::new();
    registry
        .register_unary("boom", |_, _: ()| -> Mono<u32> { panic!("kaboom") })
        .unwrap();
    registry.register_unary("ok", |_, _: ()| Mono::just(1u32)).unwrap();
    let (dispatcher, _session, mut rx) = dispatcher(registry);

    dispatcher.handle_frame(open(1, "boom", Vec::new()));
    dispatcher.handle_frame(open(3, "ok", Vec::new()));

    let frames = drain(&mut rx);
    let error = frames[0].error_payload().unwrap();
    assert_eq!(error.kind, ErrorKind::Application);
    assert!(error.message.contains("kaboom"));
    assert_eq!(frames[1].stream_id, StreamId(3));
    assert_eq!(frames[1].kind, FrameKind::Next);
}

#[test]
fn undecodable_frames_with_an_id_are_answered() {
    let (dispatcher, _session, mut rx) = dispatcher(Registry::new());

    let mut bytes = Frame::complete(StreamId(5)).encode().unwrap();
    bytes[4] = 0x7f;
    dispatcher.handle_bytes(&bytes);
    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].stream_id, StreamId(5));
    assert_eq!(error_kind(&frames[0]), ErrorKind::ProtocolViolation);

    dispatcher.handle_bytes(&[1, 2]);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn resolution_after_cancel_emits_nothing() {
    let parked: Arc<Mutex<Option<MonoSink<u32>>>> = Arc::new(Mutex::new(None));
    let slot = parked.clone();
    let mut registry = Registry::new();
    registry
        .register_unary("later", move |_, _: ()| {
            let (sink, mono) = Mono::pending();
            *slot.lock().unwrap() = Some(sink);
            mono
        })
        .unwrap();
    let (dispatcher, session, mut rx) = dispatcher(registry);

    dispatcher.handle_frame(open(1, "later", Vec::new()));
    assert_eq!(session.active(), 1);
    dispatcher.handle_frame(Frame::cancel(StreamId(1)));
    assert_eq!(session.active(), 0);

    let sink = parked.lock().unwrap().take().unwrap();
    let _ = sink.resolve(5);
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn remote_cancel_tears_down_a_requester_channel() {
    let (dispatcher, session, mut rx) = dispatcher(Registry::new());
    let id = StreamId(2);
    let (reply_sink, mut reply) = Flux::<Payload>::channel();
    let (input_sink, input) = Flux::<Payload>::channel();
    let exchange = Exchange::Requester(Requester {
        operation: "echo".into(),
        shape: Shape::BidiChannel,
        reply: ReplySink::Stream(reply_sink),
        input: Some(input.demand_handle()),
        task: None,
    });
    assert!(session.insert(id, exchange));

    dispatcher.handle_frame(Frame::cancel(id));
    assert_eq!(session.active(), 0);
    assert!(session.recently_closed(id));
    assert!(input_sink.is_cancelled());

    let item = reply.next().now_or_never().unwrap().unwrap();
    assert!(item.unwrap_err().is(ErrorKind::Cancelled));
    assert!(drain(&mut rx).is_empty());
    drop(input);
}

#[tokio::test]
async fn handler_cancelling_its_input_cancels_the_exchange() {
    let mut registry = Registry::new();
    registry
        .register_channel("abandon", |_, _: (), input: Flux<u32>| {
            input.cancel();
            Flux::<u32>::from_stream(futures::stream::pending())
        })
        .unwrap();
    let (dispatcher, session, mut rx) = dispatcher(registry);

    dispatcher.handle_frame(open(1, "abandon", Vec::new()));
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }

    let frames = drain(&mut rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, FrameKind::Cancel);
    assert_eq!(session.active(), 0);
}
