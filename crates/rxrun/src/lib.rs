//! # rxrun
//!
//! Reactive invocation core for guest/host RPC over a single byte transport.
//!
//! ## Architecture
//!
//! - **Mono / Flux**: deferred single results and credit-gated streams. Every
//!   handler returns one of them and every remote call hands one back.
//! - **Registry**: operation name → typed handler, filled while the guest is
//!   built and frozen when it starts.
//! - **Dispatcher**: reads frames, opens exchanges for inbound `Open` frames and
//!   routes everything else to the exchange its stream id names.
//! - **HostInvoker**: opens exchanges toward the peer from this side's half of
//!   the id space.
//! - **DependencySet**: shared resources handed to service constructors.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rxrun::Config;
//! use rxrun::GuestBuilder;
//! use rxrun::MemoryTransport;
//! use rxrun::Mono;
//! use rxrun::Role;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (guest_side, host_side) = MemoryTransport::pair();
//!
//! let mut builder = GuestBuilder::new(Arc::new(guest_side));
//! builder
//!     .registry()
//!     .register_unary("math/double", |_ctx, v: u32| Mono::just(v * 2))?;
//! let _guest = builder.start();
//!
//! let config = Config::standard().with_role(Role::Host);
//! let host = GuestBuilder::with_config(Arc::new(host_side), config).start();
//! let four: u32 = host.invoker().request_response("math/double", &2u32).await?;
//! assert_eq!(four, 4);
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Protocol
//!
//! Frames are defined in [rxrpc]: `Open`, `Next`, `RequestN`, `Complete`,
//! `Error` and `Cancel`, each addressed by a 32-bit stream id.

pub mod config;
pub mod context;
pub mod deps;
mod dispatcher;
pub mod flux;
pub mod guest;
pub mod invoker;
pub mod memory;
pub mod mono;
pub mod registry;
mod session;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use config::Role;
pub use context::Context;
pub use deps::DependencySet;
pub use flux::Demand;
pub use flux::Flux;
pub use flux::FluxSink;
pub use flux::MAX_CREDIT;
pub use guest::Guest;
pub use guest::GuestBuilder;
pub use guest::Service;
pub use invoker::HostInvoker;
pub use memory::MemoryTransport;
pub use mono::Mono;
pub use mono::MonoSink;
pub use registry::ChannelReply;
pub use registry::Handler;
pub use registry::HandlerEntry;
pub use registry::Namespace;
pub use registry::OperationDescriptor;
pub use registry::Registry;
pub use registry::Reply;
pub use registry::Shape;
pub use transport::Transport;

pub use rxrpc::Error;
pub use rxrpc::ErrorKind;
pub use rxrpc::Payload;
pub use rxrpc::Result;
pub use rxrpc::StreamId;
pub use rxrpc::Wire;
