//! Message envelope and type registry
//!
//! Every message type is registered once per process, in the same order on
//! every process, so that the numeric tag assigned to a type is identical
//! across the session. A frame's tag selects the type to decode and, on the
//! coordinator, how it is processed.

use std::any::TypeId;
use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use cohort_ipc::{Rank, Tag};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::async_processing::AsyncContext;
use crate::barrier::{BarrierRelease, BarrierRequest};
use crate::datacache::messages::{DatasetReady, ReleaseDataset, RequestArray, RequestDataset};
use crate::datacache::transfer::ArrayHeader;
use crate::error::{CoordinationError, CoordinationResult};
use crate::jobs::{
    DeliverJob, DistributeJobList, IterationStarted, RequestJob, StartIteration,
};
use crate::lock::{LockGranted, LockRelease, LockRequest};
use crate::server::Server;
use crate::shared_set::{SharedSetAdd, SharedSetResult};
use crate::stats::{
    AccumulateStatistics, Accumulator, AccumulatorCreated, AccumulatorFactory, CreateAccumulator,
};

/// First tag handed out to message types; lower tags are left to transports
pub const FIRST_MESSAGE_TAG: Tag = 100;

/// A typed unit of communication with an explicit wire encoding
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of the message type, used in logs and errors
    const KIND: &'static str;

    fn encode(&self) -> CoordinationResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn decode(payload: &[u8]) -> CoordinationResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// A message answered by exactly one response message
pub trait Request: Message {
    type Response: Message;
}

/// A message processed on the coordinator's main receive loop
#[async_trait]
pub trait Handle: Message {
    /// Whether the sender blocks for an answer. Failures of messages nobody
    /// waits on are logged on the coordinator instead of sent back.
    const REPLIES: bool = true;

    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()>;
}

/// A message processed off the main loop by the async background worker
#[async_trait]
pub trait HandleAsync: Message {
    /// See [`Handle::REPLIES`]
    const REPLIES: bool = true;

    async fn handle_async(self, source: Rank, context: &mut AsyncContext)
        -> CoordinationResult<()>;
}

pub(crate) type MainHandler =
    for<'a> fn(Bytes, Rank, &'a mut Server) -> BoxFuture<'a, CoordinationResult<()>>;

pub(crate) type AsyncHandler =
    for<'a> fn(Bytes, Rank, &'a mut AsyncContext) -> BoxFuture<'a, CoordinationResult<()>>;

/// Where a received message is processed
#[derive(Clone, Copy)]
pub(crate) enum Dispatch {
    /// Only ever received by a blocked caller
    None,
    Main(MainHandler),
    Async(AsyncHandler),
}

fn dispatch_main<'a, M: Handle>(
    payload: Bytes,
    source: Rank,
    server: &'a mut Server,
) -> BoxFuture<'a, CoordinationResult<()>> {
    Box::pin(async move {
        let message = M::decode(&payload)?;
        message.handle(source, server).await
    })
}

fn dispatch_async<'a, M: HandleAsync>(
    payload: Bytes,
    source: Rank,
    context: &'a mut AsyncContext,
) -> BoxFuture<'a, CoordinationResult<()>> {
    Box::pin(async move {
        let message = M::decode(&payload)?;
        message.handle_async(source, context).await
    })
}

/// Registered message type
#[derive(Clone, Copy)]
pub struct MessageEntry {
    pub kind: &'static str,
    pub tag: Tag,
    /// Whether a failure is reported back to the sender
    pub replies: bool,
    pub(crate) dispatch: Dispatch,
}

/// Deterministic mapping between message types and wire tags
pub struct MessageRegistry {
    entries: Vec<MessageEntry>,
    tags: HashMap<TypeId, Tag>,
    accumulators: HashMap<&'static str, AccumulatorFactory>,
}

impl MessageRegistry {
    /// Create a registry holding every built-in message type
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
            tags: HashMap::new(),
            accumulators: HashMap::new(),
        };

        registry.insert::<RemoteError>(Dispatch::None, false);
        registry.insert_handled::<WorkerExit>();

        registry.insert_handled::<BarrierRequest>();
        registry.insert::<BarrierRelease>(Dispatch::None, false);

        registry.insert_handled::<LockRequest>();
        registry.insert_handled::<LockRelease>();
        registry.insert::<LockGranted>(Dispatch::None, false);

        registry.insert_handled::<StartIteration>();
        registry.insert::<IterationStarted>(Dispatch::None, false);
        registry.insert_handled::<RequestJob>();
        registry.insert::<DeliverJob>(Dispatch::None, false);
        registry.insert_handled::<DistributeJobList>();

        registry.insert_handled::<CreateAccumulator>();
        registry.insert::<AccumulatorCreated>(Dispatch::None, false);
        registry.insert_handled::<AccumulateStatistics>();

        registry.insert_handled::<SharedSetAdd>();
        registry.insert::<SharedSetResult>(Dispatch::None, false);

        registry.insert_async::<RequestDataset>();
        registry.insert::<DatasetReady>(Dispatch::None, false);
        registry.insert_async::<ReleaseDataset>();
        registry.insert_async::<RequestArray>();
        registry.insert::<ArrayHeader>(Dispatch::None, false);

        registry
    }

    fn insert<M: Message>(&mut self, dispatch: Dispatch, replies: bool) -> Tag {
        let tag = FIRST_MESSAGE_TAG + self.entries.len() as Tag;
        self.entries.push(MessageEntry {
            kind: M::KIND,
            tag,
            replies,
            dispatch,
        });
        self.tags.insert(TypeId::of::<M>(), tag);
        tag
    }

    fn insert_handled<M: Handle>(&mut self) -> Tag {
        self.insert::<M>(Dispatch::Main(dispatch_main::<M>), M::REPLIES)
    }

    fn insert_async<M: HandleAsync>(&mut self) -> Tag {
        self.insert::<M>(Dispatch::Async(dispatch_async::<M>), M::REPLIES)
    }

    fn ensure_new<M: Message>(&self) -> CoordinationResult<()> {
        if self.tags.contains_key(&TypeId::of::<M>()) {
            return Err(CoordinationError::DuplicateMessageType {
                kind: M::KIND.to_string(),
            });
        }
        Ok(())
    }

    /// Register a message type that is only received by blocked callers
    pub fn register<M: Message>(&mut self) -> CoordinationResult<Tag> {
        self.ensure_new::<M>()?;
        Ok(self.insert::<M>(Dispatch::None, false))
    }

    /// Register a message type processed on the coordinator's main loop
    pub fn register_handled<M: Handle>(&mut self) -> CoordinationResult<Tag> {
        self.ensure_new::<M>()?;
        Ok(self.insert_handled::<M>())
    }

    /// Register a message type processed by the async background worker
    pub fn register_async<M: HandleAsync>(&mut self) -> CoordinationResult<Tag> {
        self.ensure_new::<M>()?;
        Ok(self.insert_async::<M>())
    }

    /// Register a statistics accumulator kind so the coordinator can create it
    pub fn register_accumulator<A: Accumulator>(&mut self) -> CoordinationResult<()> {
        if self.accumulators.contains_key(A::KIND) {
            return Err(CoordinationError::DuplicateMessageType {
                kind: A::KIND.to_string(),
            });
        }
        self.accumulators
            .insert(A::KIND, crate::stats::factory::<A>);
        Ok(())
    }

    /// Tag assigned to a message type
    pub fn tag_of<M: Message>(&self) -> CoordinationResult<Tag> {
        self.tags
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or_else(|| CoordinationError::UnregisteredMessage {
                kind: M::KIND.to_string(),
            })
    }

    /// Look up the type registered under a tag
    pub fn entry(&self, tag: Tag) -> CoordinationResult<&MessageEntry> {
        tag.checked_sub(FIRST_MESSAGE_TAG)
            .and_then(|index| self.entries.get(index as usize))
            .ok_or(CoordinationError::UnknownMessageType { tag })
    }

    pub(crate) fn accumulator_factory(&self, kind: &str) -> CoordinationResult<AccumulatorFactory> {
        self.accumulators
            .get(kind)
            .copied()
            .ok_or_else(|| CoordinationError::UnknownAccumulator {
                kind: kind.to_string(),
            })
    }

    /// Number of registered message types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no message types are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Error raised while processing a message on another process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl Message for RemoteError {
    const KIND: &'static str = "remote_error";
}

/// Sent by a worker once its body has finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerExit;

impl Message for WorkerExit {
    const KIND: &'static str = "worker_exit";
}

#[async_trait]
impl Handle for WorkerExit {
    const REPLIES: bool = false;

    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        server.worker_exited(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        payload: Vec<u32>,
    }

    impl Message for Ping {
        const KIND: &'static str = "ping";
    }

    #[test]
    fn test_builtin_tags_are_deterministic() {
        let first = MessageRegistry::new();
        let second = MessageRegistry::new();

        assert_eq!(first.len(), second.len());
        assert_eq!(first.tag_of::<RemoteError>().unwrap(), FIRST_MESSAGE_TAG);
        assert_eq!(
            first.tag_of::<LockRequest>().unwrap(),
            second.tag_of::<LockRequest>().unwrap()
        );
        for tag in FIRST_MESSAGE_TAG..FIRST_MESSAGE_TAG + first.len() as Tag {
            assert_eq!(first.entry(tag).unwrap().kind, second.entry(tag).unwrap().kind);
        }
    }

    #[test]
    fn test_register_custom_message() {
        let mut registry = MessageRegistry::new();
        let tag = registry.register::<Ping>().unwrap();

        assert_eq!(tag, FIRST_MESSAGE_TAG + registry.len() as Tag - 1);
        assert_eq!(registry.entry(tag).unwrap().kind, "ping");
        assert!(matches!(
            registry.register::<Ping>(),
            Err(CoordinationError::DuplicateMessageType { .. })
        ));
    }

    #[test]
    fn test_unknown_and_unregistered() {
        let registry = MessageRegistry::new();
        assert!(matches!(
            registry.entry(7),
            Err(CoordinationError::UnknownMessageType { tag: 7 })
        ));
        assert!(matches!(
            registry.entry(FIRST_MESSAGE_TAG + 500),
            Err(CoordinationError::UnknownMessageType { .. })
        ));
        assert!(matches!(
            registry.tag_of::<Ping>(),
            Err(CoordinationError::UnregisteredMessage { .. })
        ));
    }

    #[test]
    fn test_encode_decode_preserves_contents() {
        let message = Ping {
            payload: vec![1, 2, 3],
        };
        let decoded = Ping::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);

        assert!(matches!(
            Ping::decode(b"not json"),
            Err(CoordinationError::Codec(_))
        ));
    }

    fn round_trip<M: Message + PartialEq + std::fmt::Debug>(message: M) {
        let decoded = M::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message, "{} changed on the wire", M::KIND);
    }

    #[test]
    fn test_builtin_messages_survive_the_wire() {
        use crate::datacache::transfer::TransferMode;
        use crate::datacache::{DType, SharedArrayHandle};
        use crate::jobs::{IterationContext, IterationMode};

        round_trip(StartIteration {
            context: IterationContext {
                argv: "analyse --snapshot 42".to_string(),
                resume_id: "halo-loop".to_string(),
                job_count: 128,
            },
            mode: IterationMode::Synchronized,
        });
        round_trip(ArrayHeader {
            shape: vec![64, 3],
            dtype: DType::F32,
            mode: TransferMode::Shared(SharedArrayHandle {
                segment: "cohort:snap:pos".to_string(),
                shape: vec![64, 3],
                dtype: DType::F32,
                offset: 768,
            }),
        });
        round_trip(AccumulateStatistics {
            id: 2,
            partial: serde_json::json!({ "calls": 7, "seconds": 1.25, "tags": ["a", null] }),
        });
        round_trip(DeliverJob { job: None });
        round_trip(RequestArray {
            array: "mass".to_string(),
            rows: Some((4, 9)),
        });
    }
}
