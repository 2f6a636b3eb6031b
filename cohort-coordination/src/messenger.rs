//! Typed send and receive over a transport

use std::sync::Arc;

use bytes::Bytes;
use cohort_ipc::{Frame, Rank, Tag, Transport};
use tracing::trace;

use crate::error::{CoordinationError, CoordinationResult};
use crate::message::{Message, MessageRegistry, RemoteError, Request};

/// Per-process endpoint that encodes messages with their registered tag and
/// decodes what arrives, re-raising errors reported by the remote side.
#[derive(Clone)]
pub struct Messenger {
    transport: Arc<dyn Transport>,
    registry: Arc<MessageRegistry>,
}

impl Messenger {
    /// Create a new messenger
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<MessageRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    /// Send a message to another rank
    pub async fn send<M: Message>(&self, message: &M, destination: Rank) -> CoordinationResult<()> {
        let tag = self.registry.tag_of::<M>()?;
        let payload = message.encode()?;
        trace!("send {} to rank {}", M::KIND, destination);
        self.transport.send(payload, destination, tag).await?;
        Ok(())
    }

    /// Block for the next message from `source` (any rank if `None`), which
    /// must be of type `M`
    pub async fn receive<M: Message>(&self, source: Option<Rank>) -> CoordinationResult<(M, Rank)> {
        let frame = self.transport.receive(source, None).await?;
        self.decode_expected(frame)
    }

    fn decode_expected<M: Message>(&self, frame: Frame) -> CoordinationResult<(M, Rank)> {
        if frame.tag == self.registry.tag_of::<M>()? {
            return Ok((M::decode(&frame.payload)?, frame.source));
        }

        if frame.tag == self.registry.tag_of::<RemoteError>()? {
            let remote = RemoteError::decode(&frame.payload)?;
            return Err(CoordinationError::Remote {
                rank: frame.source,
                kind: remote.kind,
                message: remote.message,
            });
        }

        let actual = match self.registry.entry(frame.tag) {
            Ok(entry) => entry.kind.to_string(),
            Err(_) => format!("tag {}", frame.tag),
        };
        Err(CoordinationError::UnexpectedMessageType {
            expected: M::KIND.to_string(),
            actual,
        })
    }

    /// Send a request and block for its response
    pub async fn request<R: Request>(
        &self,
        request: &R,
        destination: Rank,
    ) -> CoordinationResult<R::Response> {
        self.send(request, destination).await?;
        let (response, _) = self.receive::<R::Response>(Some(destination)).await?;
        Ok(response)
    }

    /// Answer a request received from `destination`
    pub async fn respond<R: Request>(
        &self,
        response: &R::Response,
        destination: Rank,
    ) -> CoordinationResult<()> {
        self.send(response, destination).await
    }

    /// Report a failure to the rank whose message caused it
    pub async fn send_remote_error(
        &self,
        error: &CoordinationError,
        kind: &str,
        destination: Rank,
    ) -> CoordinationResult<()> {
        let remote = RemoteError {
            kind: kind.to_string(),
            message: error.to_string(),
        };
        self.send(&remote, destination).await
    }

    /// Receive the next frame from any rank, undecoded
    pub async fn receive_frame(&self) -> CoordinationResult<Frame> {
        Ok(self.transport.receive(None, None).await?)
    }

    pub(crate) async fn send_raw(
        &self,
        payload: Bytes,
        destination: Rank,
        tag: Tag,
    ) -> CoordinationResult<()> {
        self.transport.send(payload, destination, tag).await?;
        Ok(())
    }

    pub(crate) async fn receive_raw(&self, source: Rank, tag: Tag) -> CoordinationResult<Frame> {
        Ok(self.transport.receive(Some(source), Some(tag)).await?)
    }
}
