//! # Guest Assembly
//!
//! Wires the pieces of one side of a connection together: a transport, the
//! operation registry, the shared dependency set and the host invoker.
//!
//! ## Lifecycle
//!
//! 1. `GuestBuilder::new` creates the session for a transport. Nothing runs yet.
//! 2. Dependencies are inserted, then services are constructed from them. Each
//!    constructor also receives a `HostInvoker`, so a service can call back into
//!    the peer while serving requests.
//! 3. `start` freezes the registry and spawns the reader and writer tasks.
//!    Registration after this point is impossible by construction.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::deps;
use crate::deps::DependencySet;
use crate::dispatcher::Dispatcher;
use crate::invoker::HostInvoker;
use crate::registry::Namespace;
use crate::registry::Registry;
use crate::session::Session;
use crate::session::write_loop;
use crate::transport::Transport;

#[derive(Debug)]
pub enum Error {
    Registration(rxrpc::Error),
    Dependency(deps::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registration(e) => write!(f, "Registration error: {}", e),
            Self::Dependency(e) => write!(f, "Dependency error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<rxrpc::Error> for Error {
    fn from(e: rxrpc::Error) -> Self {
        Self::Registration(e)
    }
}

impl From<deps::Error> for Error {
    fn from(e: deps::Error) -> Self {
        Self::Dependency(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A set of operations registered together under one namespace.
pub trait Service: Send + Sync + 'static {
    /// Prefix for every operation of this service. Empty for bare names.
    const NAMESPACE: &'static str;

    fn register(self: Arc<Self>, ns: &mut Namespace<'_>) -> rxrpc::Result<()>;
}

/// Collects services and dependencies before the guest starts serving.
pub struct GuestBuilder {
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    outbound: tokio::sync::mpsc::UnboundedReceiver<rxrpc::Frame>,
    registry: Registry,
    deps: DependencySet,
    invoker: HostInvoker,
}

impl GuestBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, Config::standard())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: Config) -> Self {
        let (session, outbound) = Session::new(config);
        let session = Arc::new(session);
        Self {
            transport,
            invoker: HostInvoker::new(session.clone()),
            session,
            outbound,
            registry: Registry::new(),
            deps: DependencySet::new(),
        }
    }

    /// Replaces the dependency set.
    pub fn dependencies(mut self, deps: DependencySet) -> Self {
        self.deps = deps;
        self
    }

    pub fn dependency<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.deps.insert(value);
        self
    }

    /// The invoker for this connection. Usable once the guest is started.
    pub fn invoker(&self) -> HostInvoker {
        self.invoker.clone()
    }

    /// Direct access for registering handlers outside a `Service`.
    pub fn registry(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Constructs a service from the dependency set and registers its operations
    /// under `S::NAMESPACE`.
    pub fn service<S, F>(mut self, ctor: F) -> Result<Self>
    where
        S: Service,
        F: FnOnce(&DependencySet, HostInvoker) -> Result<S>,
    {
        let service = Arc::new(ctor(&self.deps, self.invoker.clone())?);
        let mut ns = self.registry.namespace(S::NAMESPACE);
        service.register(&mut ns)?;
        Ok(self)
    }

    /// Starts serving. Must be called from within a tokio runtime.
    pub fn start(self) -> Guest {
        debug!(
            operations = self.registry.len(),
            dependencies = self.deps.len(),
            role = ?self.session.config().role,
            "starting guest"
        );
        let registry = Arc::new(self.registry);
        let writer = tokio::spawn(write_loop(self.session.clone(), self.transport.clone(), self.outbound));
        let reader = tokio::spawn(Dispatcher::new(registry, self.session.clone()).run(self.transport));

        Guest {
            session: self.session,
            invoker: self.invoker,
            deps: Arc::new(self.deps),
            reader: Some(reader),
            writer,
        }
    }
}

/// A running guest: serves registered operations and invokes the peer's.
pub struct Guest {
    session: Arc<Session>,
    invoker: HostInvoker,
    deps: Arc<DependencySet>,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl Guest {
    pub fn invoker(&self) -> HostInvoker {
        self.invoker.clone()
    }

    pub fn dependencies(&self) -> &Arc<DependencySet> {
        &self.deps
    }

    /// Exchanges currently Active, in either direction.
    pub fn active_streams(&self) -> usize {
        self.session.active()
    }

    pub fn is_failed(&self) -> bool {
        self.session.is_failed()
    }

    /// Waits until the reader stops, i.e. the transport closed or failed.
    pub async fn closed(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }

    /// Stops both tasks and cancels every exchange.
    pub fn shutdown(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        self.writer.abort();
        self.session.fail_all(rxrpc::Error::cancelled());
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Guest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guest")
            .field("active", &self.active_streams())
            .field("failed", &self.is_failed())
            .finish()
    }
}
