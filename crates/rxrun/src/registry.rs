//! # Operation Registry
//!
//! Maps operation names to handlers. Filled while the guest is being built, then
//! moved behind an `Arc` and only read during dispatch.
//!
//! ## Shapes
//!
//! | shape           | input          | reply           |
//! |-----------------|----------------|-----------------|
//! | `Void`          | none           | `Mono<()>`      |
//! | `Unary`         | none           | `Mono<T>`       |
//! | `ServerStream`  | none           | `Flux<T>`       |
//! | `ClientChannel` | `Flux<In>`     | `Mono<T>`       |
//! | `BidiChannel`   | `Flux<In>`     | `Flux<T>`       |
//!
//! Handlers are stored type-erased over `Payload`. The typed `register_*` methods
//! wrap a typed closure with `Wire` decoding of arguments and stream items and
//! encoding of results.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use rxrpc::Error;
use rxrpc::FrameError;
use rxrpc::MAX_OPERATION_NAME;
use rxrpc::Payload;
use rxrpc::Result;
use rxrpc::Wire;

use crate::context::Context;
use crate::flux::Flux;
use crate::mono::Mono;

/// The structural pattern of an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    Void,
    Unary,
    ServerStream,
    ClientChannel,
    BidiChannel,
}

impl Shape {
    /// True when the requester streams values into the handler.
    pub fn has_input(&self) -> bool {
        matches!(self, Self::ClientChannel | Self::BidiChannel)
    }

    /// True when the handler replies with a stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::ServerStream | Self::BidiChannel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Unary => "unary",
            Self::ServerStream => "server-stream",
            Self::ClientChannel => "client-channel",
            Self::BidiChannel => "bidi-channel",
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and shape of a registered operation. Immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    pub shape: Shape,
}

type VoidFn = Box<dyn Fn(Context, Payload) -> Mono<()> + Send + Sync>;
type UnaryFn = Box<dyn Fn(Context, Payload) -> Mono<Payload> + Send + Sync>;
type ServerStreamFn = Box<dyn Fn(Context, Payload) -> Flux<Payload> + Send + Sync>;
type ClientChannelFn = Box<dyn Fn(Context, Payload, Flux<Payload>) -> Mono<Payload> + Send + Sync>;
type BidiChannelFn = Box<dyn Fn(Context, Payload, Flux<Payload>) -> Flux<Payload> + Send + Sync>;

/// A type-erased handler. The variant fixes the shape it implements.
pub enum Handler {
    Void(VoidFn),
    Unary(UnaryFn),
    ServerStream(ServerStreamFn),
    ClientChannel(ClientChannelFn),
    BidiChannel(BidiChannelFn),
}

impl Handler {
    pub fn void<F>(f: F) -> Self
    where
        F: Fn(Context, Payload) -> Mono<()> + Send + Sync + 'static,
    {
        Self::Void(Box::new(f))
    }

    pub fn unary<F>(f: F) -> Self
    where
        F: Fn(Context, Payload) -> Mono<Payload> + Send + Sync + 'static,
    {
        Self::Unary(Box::new(f))
    }

    pub fn server_stream<F>(f: F) -> Self
    where
        F: Fn(Context, Payload) -> Flux<Payload> + Send + Sync + 'static,
    {
        Self::ServerStream(Box::new(f))
    }

    pub fn client_channel<F>(f: F) -> Self
    where
        F: Fn(Context, Payload, Flux<Payload>) -> Mono<Payload> + Send + Sync + 'static,
    {
        Self::ClientChannel(Box::new(f))
    }

    pub fn bidi_channel<F>(f: F) -> Self
    where
        F: Fn(Context, Payload, Flux<Payload>) -> Flux<Payload> + Send + Sync + 'static,
    {
        Self::BidiChannel(Box::new(f))
    }

    pub fn shape(&self) -> Shape {
        match self {
            Self::Void(_) => Shape::Void,
            Self::Unary(_) => Shape::Unary,
            Self::ServerStream(_) => Shape::ServerStream,
            Self::ClientChannel(_) => Shape::ClientChannel,
            Self::BidiChannel(_) => Shape::BidiChannel,
        }
    }
}

/// What an exchange produces, in the primitive its shape dictates.
#[derive(Debug)]
pub enum Reply {
    /// Void: completion only.
    Empty(Mono<()>),
    /// Unary and ClientChannel.
    Single(Mono<Payload>),
    /// ServerStream and BidiChannel.
    Stream(Flux<Payload>),
}

impl Reply {
    /// An already-failed reply in the primitive matching `shape`.
    pub fn failed(shape: Shape, error: Error) -> Self {
        match shape {
            Shape::Void => Self::Empty(Mono::error(error)),
            Shape::Unary | Shape::ClientChannel => Self::Single(Mono::error(error)),
            Shape::ServerStream | Shape::BidiChannel => Self::Stream(Flux::error(error)),
        }
    }

    pub fn into_empty(self) -> Mono<()> {
        match self {
            Self::Empty(mono) => mono,
            other => Mono::error(other.mismatch("void")),
        }
    }

    pub fn into_single(self) -> Mono<Payload> {
        match self {
            Self::Single(mono) => mono,
            other => Mono::error(other.mismatch("single")),
        }
    }

    pub fn into_stream(self) -> Flux<Payload> {
        match self {
            Self::Stream(flux) => flux,
            other => Flux::error(other.mismatch("stream")),
        }
    }

    fn mismatch(&self, wanted: &str) -> Error {
        let found = match self {
            Self::Empty(_) => "void",
            Self::Single(_) => "single",
            Self::Stream(_) => "stream",
        };
        Error::protocol_violation(format!("expected a {} reply, found {}", wanted, found))
    }
}

/// A registered operation: its descriptor and the handler bound to it.
pub struct HandlerEntry {
    descriptor: Arc<OperationDescriptor>,
    handler: Handler,
}

impl HandlerEntry {
    pub fn descriptor(&self) -> &Arc<OperationDescriptor> {
        &self.descriptor
    }

    /// Calls the handler. `input` must be present exactly for channel shapes.
    pub fn invoke(&self, ctx: Context, args: Payload, input: Option<Flux<Payload>>) -> Reply {
        match (&self.handler, input) {
            (Handler::Void(f), None) => Reply::Empty(f(ctx, args)),
            (Handler::Unary(f), None) => Reply::Single(f(ctx, args)),
            (Handler::ServerStream(f), None) => Reply::Stream(f(ctx, args)),
            (Handler::ClientChannel(f), Some(input)) => Reply::Single(f(ctx, args, input)),
            (Handler::BidiChannel(f), Some(input)) => Reply::Stream(f(ctx, args, input)),
            (handler, _) => {
                let shape = handler.shape();
                let message = format!("input stream does not match {} operation", shape);
                Reply::failed(shape, Error::protocol_violation(message))
            }
        }
    }
}

/// Name → handler table.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, HandlerEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `name`.
    ///
    /// Fails with `DuplicateOperation` if the name is taken, and with
    /// `ProtocolViolation` if the handler does not implement `shape` or the name
    /// cannot travel in an Open frame.
    pub fn register(&mut self, name: impl Into<String>, shape: Shape, handler: Handler) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_OPERATION_NAME {
            return Err(Error::protocol_violation(format!(
                "operation name must be 1 to {} bytes, got {}",
                MAX_OPERATION_NAME,
                name.len()
            )));
        }
        if handler.shape() != shape {
            return Err(Error::protocol_violation(format!(
                "handler for '{}' implements {} but was declared {}",
                name,
                handler.shape(),
                shape
            )));
        }
        if self.entries.contains_key(&name) {
            return Err(Error::duplicate_operation(&name));
        }

        debug!(operation = %name, %shape, "registered operation");
        let descriptor = Arc::new(OperationDescriptor { name: name.clone(), shape });
        self.entries.insert(name, HandlerEntry { descriptor, handler });
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&HandlerEntry> {
        self.entries.get(name).ok_or_else(|| Error::unknown_operation(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.entries.values().map(|e| e.descriptor.as_ref())
    }

    /// Scopes registrations under `prefix`: operations become `"{prefix}/{operation}"`.
    /// An empty prefix registers bare names.
    pub fn namespace(&mut self, prefix: impl Into<String>) -> Namespace<'_> {
        Namespace { registry: self, prefix: prefix.into() }
    }

    pub fn register_void<A, F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        A: Wire,
        F: Fn(Context, A) -> Mono<()> + Send + Sync + 'static,
    {
        let handler = Handler::void(move |ctx, args| match A::decode(&args) {
            Ok(args) => f(ctx, args),
            Err(e) => Mono::error(bad_arguments(e)),
        });
        self.register(name, Shape::Void, handler)
    }

    pub fn register_unary<A, R, F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        A: Wire,
        R: Wire,
        F: Fn(Context, A) -> Mono<R> + Send + Sync + 'static,
    {
        let handler = Handler::unary(move |ctx, args| match A::decode(&args) {
            Ok(args) => f(ctx, args).map(|r| r.encode()),
            Err(e) => Mono::error(bad_arguments(e)),
        });
        self.register(name, Shape::Unary, handler)
    }

    pub fn register_server_stream<A, R, F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        A: Wire,
        R: Wire,
        F: Fn(Context, A) -> Flux<R> + Send + Sync + 'static,
    {
        let handler = Handler::server_stream(move |ctx, args| match A::decode(&args) {
            Ok(args) => f(ctx, args).map(|r| r.encode()),
            Err(e) => Flux::error(bad_arguments(e)),
        });
        self.register(name, Shape::ServerStream, handler)
    }

    /// Registers a channel. The reply type picks the shape: `Mono<R>` gives a
    /// ClientChannel, `Flux<R>` a BidiChannel.
    pub fn register_channel<A, I, R, F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        A: Wire,
        I: Wire,
        R: ChannelReply,
        F: Fn(Context, A, Flux<I>) -> R + Send + Sync + 'static,
    {
        let handler = R::channel_handler(f);
        let shape = handler.shape();
        self.register(name, shape, handler)
    }
}

fn bad_arguments(e: FrameError) -> Error {
    Error::protocol_violation(format!("undecodable arguments: {}", e))
}

fn decode_input<I: Wire>(input: Flux<Payload>) -> Flux<I> {
    input.and_then(|item| {
        I::decode(&item).map_err(|e| Error::protocol_violation(format!("undecodable stream item: {}", e)))
    })
}

/// Reply types a channel handler may return.
pub trait ChannelReply: Send + 'static {
    fn channel_handler<A, I, F>(f: F) -> Handler
    where
        A: Wire,
        I: Wire,
        F: Fn(Context, A, Flux<I>) -> Self + Send + Sync + 'static;
}

impl<T: Wire> ChannelReply for Mono<T> {
    fn channel_handler<A, I, F>(f: F) -> Handler
    where
        A: Wire,
        I: Wire,
        F: Fn(Context, A, Flux<I>) -> Self + Send + Sync + 'static,
    {
        Handler::client_channel(move |ctx, args, input| match A::decode(&args) {
            Ok(args) => f(ctx, args, decode_input(input)).map(|r| r.encode()),
            Err(e) => Mono::error(bad_arguments(e)),
        })
    }
}

impl<T: Wire> ChannelReply for Flux<T> {
    fn channel_handler<A, I, F>(f: F) -> Handler
    where
        A: Wire,
        I: Wire,
        F: Fn(Context, A, Flux<I>) -> Self + Send + Sync + 'static,
    {
        Handler::bidi_channel(move |ctx, args, input| match A::decode(&args) {
            Ok(args) => f(ctx, args, decode_input(input)).map(|r| r.encode()),
            Err(e) => Flux::error(bad_arguments(e)),
        })
    }
}

/// Registration scoped under a prefix, one per service interface.
pub struct Namespace<'a> {
    registry: &'a mut Registry,
    prefix: String,
}

impl Namespace<'_> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The full registered name of `operation`.
    pub fn qualify(&self, operation: &str) -> String {
        if self.prefix.is_empty() {
            operation.to_string()
        } else {
            format!("{}/{}", self.prefix, operation)
        }
    }

    pub fn register(&mut self, operation: &str, shape: Shape, handler: Handler) -> Result<()> {
        let name = self.qualify(operation);
        self.registry.register(name, shape, handler)
    }

    pub fn register_void<A, F>(&mut self, operation: &str, f: F) -> Result<()>
    where
        A: Wire,
        F: Fn(Context, A) -> Mono<()> + Send + Sync + 'static,
    {
        let name = self.qualify(operation);
        self.registry.register_void(name, f)
    }

    pub fn register_unary<A, R, F>(&mut self, operation: &str, f: F) -> Result<()>
    where
        A: Wire,
        R: Wire,
        F: Fn(Context, A) -> Mono<R> + Send + Sync + 'static,
    {
        let name = self.qualify(operation);
        self.registry.register_unary(name, f)
    }

    pub fn register_server_stream<A, R, F>(&mut self, operation: &str, f: F) -> Result<()>
    where
        A: Wire,
        R: Wire,
        F: Fn(Context, A) -> Flux<R> + Send + Sync + 'static,
    {
        let name = self.qualify(operation);
        self.registry.register_server_stream(name, f)
    }

    pub fn register_channel<A, I, R, F>(&mut self, operation: &str, f: F) -> Result<()>
    where
        A: Wire,
        I: Wire,
        R: ChannelReply,
        F: Fn(Context, A, Flux<I>) -> R + Send + Sync + 'static,
    {
        let name = self.qualify(operation);
        self.registry.register_channel(name, f)
    }
}
