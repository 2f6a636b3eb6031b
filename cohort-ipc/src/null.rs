//! Single-process transport

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{IpcError, IpcResult};
use crate::transport::{Frame, Rank, Tag, Transport};

/// Transport for a session of exactly one process.
///
/// Every coordination primitive collapses to a local call when this transport
/// is in use, so any attempt to actually move data is an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl NullTransport {
    /// Create a new null transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, _payload: Bytes, _destination: Rank, _tag: Tag) -> IpcResult<()> {
        Err(IpcError::TransportDisabled)
    }

    async fn receive(&self, _source: Option<Rank>, _tag: Option<Tag>) -> IpcResult<Frame> {
        Err(IpcError::TransportDisabled)
    }

    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> IpcResult<()> {
        Ok(())
    }

    async fn finalize(&self) -> IpcResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
