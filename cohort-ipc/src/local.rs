//! In-process multi-rank transport

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Barrier, Mutex};
use tracing::trace;

use crate::error::{IpcError, IpcResult};
use crate::segment::SegmentTable;
use crate::transport::{Frame, Rank, Tag, Transport};

struct Inbox {
    receiver: mpsc::UnboundedReceiver<Frame>,
    /// Frames that arrived while a receive was waiting for something else
    pending: VecDeque<Frame>,
}

/// Transport connecting the ranks of a session that all live inside one OS
/// process, each rank running as its own task.
///
/// Every rank owns an unbounded inbox. Receives that filter by source or tag
/// park non-matching frames in a pending buffer, which preserves per-source
/// ordering.
pub struct LocalTransport {
    rank: Rank,
    peers: Arc<Vec<mpsc::UnboundedSender<Frame>>>,
    inbox: Mutex<Inbox>,
    barrier: Arc<Barrier>,
    segments: Arc<SegmentTable>,
    finalized: AtomicBool,
}

impl LocalTransport {
    /// Create the transports for a session of `size` ranks, indexed by rank
    pub fn group(size: usize) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::unbounded_channel()).unzip();
        let peers = Arc::new(senders);
        let barrier = Arc::new(Barrier::new(size.max(1)));
        let segments = Arc::new(SegmentTable::new());

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| LocalTransport {
                rank,
                peers: Arc::clone(&peers),
                inbox: Mutex::new(Inbox {
                    receiver,
                    pending: VecDeque::new(),
                }),
                barrier: Arc::clone(&barrier),
                segments: Arc::clone(&segments),
                finalized: AtomicBool::new(false),
            })
            .collect()
    }

    fn ensure_active(&self) -> IpcResult<()> {
        if self.finalized.load(Ordering::Acquire) {
            return Err(IpcError::Finalized);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, payload: Bytes, destination: Rank, tag: Tag) -> IpcResult<()> {
        self.ensure_active()?;
        let peer = self.peers.get(destination).ok_or(IpcError::InvalidRank {
            rank: destination,
            size: self.peers.len(),
        })?;

        trace!(
            "rank {} -> rank {}: tag {} ({} bytes)",
            self.rank,
            destination,
            tag,
            payload.len()
        );
        peer.send(Frame {
            source: self.rank,
            tag,
            payload,
        })
        .map_err(|_| IpcError::ConnectionClosed)
    }

    async fn receive(&self, source: Option<Rank>, tag: Option<Tag>) -> IpcResult<Frame> {
        self.ensure_active()?;
        let mut inbox = self.inbox.lock().await;

        if let Some(position) = inbox.pending.iter().position(|f| f.matches(source, tag)) {
            if let Some(frame) = inbox.pending.remove(position) {
                return Ok(frame);
            }
        }

        loop {
            let frame = inbox
                .receiver
                .recv()
                .await
                .ok_or(IpcError::ConnectionClosed)?;
            if frame.matches(source, tag) {
                return Ok(frame);
            }
            inbox.pending.push_back(frame);
        }
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    async fn barrier(&self) -> IpcResult<()> {
        self.ensure_active()?;
        self.barrier.wait().await;
        Ok(())
    }

    async fn finalize(&self) -> IpcResult<()> {
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }

    fn shared_segments(&self) -> Option<Arc<SegmentTable>> {
        Some(Arc::clone(&self.segments))
    }
}
