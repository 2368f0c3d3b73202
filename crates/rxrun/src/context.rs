//! Per-exchange context handed to every handler invocation.

use std::sync::Arc;

use rxrpc::StreamId;

use crate::registry::OperationDescriptor;
use crate::registry::Shape;

/// Identifies the exchange a handler is serving.
///
/// Cheap to clone; handlers may move it into the futures and streams they return.
#[derive(Clone, Debug)]
pub struct Context {
    stream_id: StreamId,
    descriptor: Arc<OperationDescriptor>,
}

impl Context {
    pub fn new(stream_id: StreamId, descriptor: Arc<OperationDescriptor>) -> Self {
        Self { stream_id, descriptor }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn operation(&self) -> &str {
        &self.descriptor.name
    }

    pub fn shape(&self) -> Shape {
        self.descriptor.shape
    }

    pub fn descriptor(&self) -> &Arc<OperationDescriptor> {
        &self.descriptor
    }
}
