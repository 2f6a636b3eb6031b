//! Transport contract

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IpcResult;
use crate::segment::SegmentTable;

/// Process identity within a session, in `[0, size)`
pub type Rank = usize;

/// Wire tag identifying the kind of a frame
pub type Tag = u32;

/// The rank that owns all coordination state
pub const COORDINATOR_RANK: Rank = 0;

/// Reserved tag for raw array payloads that follow an array header
pub const ARRAY_PAYLOAD_TAG: Tag = 1515;

/// A unit of data as seen by a receiver
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Bytes,
}

impl Frame {
    /// Check whether this frame satisfies a receive filter
    pub fn matches(&self, source: Option<Rank>, tag: Option<Tag>) -> bool {
        source.map_or(true, |s| s == self.source) && tag.map_or(true, |t| t == self.tag)
    }
}

/// Point-to-point transport between the processes of one session.
///
/// Frames from the same source to the same destination are delivered in send
/// order; nothing is guaranteed across different sources.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a payload to another rank
    async fn send(&self, payload: Bytes, destination: Rank, tag: Tag) -> IpcResult<()>;

    /// Receive the first frame matching the filter; `None` is a wildcard
    async fn receive(&self, source: Option<Rank>, tag: Option<Tag>) -> IpcResult<Frame>;

    /// Rank of this process
    fn rank(&self) -> Rank;

    /// Number of processes in the session
    fn size(&self) -> usize;

    /// Transport-native barrier, used only to join and leave the session
    async fn barrier(&self) -> IpcResult<()>;

    /// Release transport resources
    async fn finalize(&self) -> IpcResult<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Segment table shared with peers, if this transport can address the
    /// same memory as its peers
    fn shared_segments(&self) -> Option<Arc<SegmentTable>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_matching() {
        let frame = Frame {
            source: 2,
            tag: 101,
            payload: Bytes::from_static(b"{}"),
        };

        assert!(frame.matches(None, None));
        assert!(frame.matches(Some(2), None));
        assert!(frame.matches(None, Some(101)));
        assert!(frame.matches(Some(2), Some(101)));
        assert!(!frame.matches(Some(1), None));
        assert!(!frame.matches(Some(2), Some(ARRAY_PAYLOAD_TAG)));
    }
}
