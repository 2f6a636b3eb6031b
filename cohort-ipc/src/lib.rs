//! Transport layer for cohort
//!
//! This crate defines the point-to-point transport contract used between the
//! coordinator (rank 0) and the worker processes, together with the two
//! transports shipped with cohort: a disabled single-process transport and an
//! in-process multi-rank transport.

pub mod error;
pub mod local;
pub mod null;
pub mod segment;
pub mod transport;

// Re-export commonly used types
pub use error::{IpcError, IpcResult};
pub use local::LocalTransport;
pub use null::NullTransport;
pub use segment::SegmentTable;
pub use transport::{Frame, Rank, Tag, Transport, ARRAY_PAYLOAD_TAG, COORDINATOR_RANK};
