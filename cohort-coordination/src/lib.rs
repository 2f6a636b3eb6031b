//! Cohort coordination layer
//!
//! Rank 0 of a session is the coordinator: it owns every piece of shared
//! state (lock queues, job iterations, accumulators, the data cache) and
//! serves the other ranks, the workers, over a [`cohort_ipc::Transport`].
//! Workers reach that state only through typed request/response messages.

pub mod async_processing;
pub mod barrier;
pub mod datacache;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod message;
pub mod messenger;
pub mod resumption;
pub mod roles;
pub mod server;
pub mod session;
pub mod shared_set;
pub mod stats;

// Re-export main types
pub use error::{CoordinationError, CoordinationResult};
pub use jobs::{GeneratedJobs, ItemIterator, IterationContext, IterationMode, JobIterator};
pub use lock::DistributedLock;
pub use message::{Handle, HandleAsync, Message, MessageRegistry, RemoteError, Request};
pub use messenger::Messenger;
pub use resumption::ResumptionStore;
pub use roles::{CoordinatorRole, CoordinatorShared, Participant, WorkerRole};
pub use server::Server;
pub use session::{Session, SessionBuilder, SessionReport};
pub use shared_set::SharedSet;
pub use stats::{Accumulator, StatisticsAccumulator};

pub use datacache::{ArrayData, DType, Dataset, DatasetConnection, DatasetLoader};
