//! Named exclusive and shared locks arbitrated by the coordinator
//!
//! The coordinator keeps one FIFO queue per lock name. An exclusive entry is
//! granted only at the front of its queue with no sharers active; shared
//! entries are granted together whenever the front of the queue is shared,
//! and new shared requests join immediately while the lock is in shared mode.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use async_trait::async_trait;
use cohort_ipc::{Rank, COORDINATOR_RANK};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordinationError, CoordinationResult};
use crate::message::{Handle, Message};
use crate::roles::Participant;
use crate::server::Server;

/// Permission for one rank to proceed as a holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub rank: Rank,
    /// Whether the holder should wait one grace period before proceeding
    pub delay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    rank: Rank,
    shared: bool,
    granted: bool,
}

/// Queue of holders and waiters for a single lock name
#[derive(Debug, Default)]
pub struct LockQueue {
    entries: VecDeque<Entry>,
    sharers: usize,
}

impl LockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request, returning any grants it makes possible
    pub fn request(&mut self, rank: Rank, shared: bool) -> Vec<Grant> {
        self.entries.push_back(Entry {
            rank,
            shared,
            granted: false,
        });

        if self.entries.len() == 1 {
            return self.issue_next(false);
        }

        if shared && self.is_shared_mode() {
            if let Some(entry) = self.entries.back_mut() {
                entry.granted = true;
            }
            self.sharers += 1;
            return vec![Grant { rank, delay: false }];
        }

        Vec::new()
    }

    /// Release the lock held by `rank`, returning the grants that follow
    pub fn release(&mut self, rank: Rank) -> CoordinationResult<Vec<Grant>> {
        if self.is_shared_mode() {
            let position = self
                .entries
                .iter()
                .position(|e| e.rank == rank && e.shared && e.granted)
                .ok_or_else(|| {
                    CoordinationError::LockProtocol(format!(
                        "rank {} released a shared lock it does not hold",
                        rank
                    ))
                })?;
            self.entries.remove(position);
            self.sharers -= 1;
            if self.sharers == 0 {
                return Ok(self.issue_next(false));
            }
            return Ok(Vec::new());
        }

        match self.entries.front() {
            Some(front) if front.rank == rank && !front.shared && front.granted => {
                self.entries.pop_front();
                Ok(self.issue_next(true))
            }
            _ => Err(CoordinationError::LockProtocol(format!(
                "rank {} released an exclusive lock it does not hold",
                rank
            ))),
        }
    }

    fn issue_next(&mut self, delay: bool) -> Vec<Grant> {
        let front_shared = match self.entries.front() {
            Some(front) => front.shared,
            None => return Vec::new(),
        };

        if front_shared {
            let mut grants = Vec::new();
            for entry in self.entries.iter_mut().filter(|e| e.shared && !e.granted) {
                entry.granted = true;
                grants.push(Grant {
                    rank: entry.rank,
                    delay,
                });
            }
            self.sharers += grants.len();
            grants
        } else {
            match self.entries.front_mut() {
                Some(front) => {
                    front.granted = true;
                    vec![Grant {
                        rank: front.rank,
                        delay,
                    }]
                }
                None => Vec::new(),
            }
        }
    }

    /// Ranks currently holding the lock
    pub fn holders(&self) -> Vec<Rank> {
        self.entries
            .iter()
            .filter(|e| e.granted)
            .map(|e| e.rank)
            .collect()
    }

    /// Whether the lock is currently held by one or more sharers
    pub fn is_shared_mode(&self) -> bool {
        self.sharers > 0
    }

    /// Whether `rank` holds or waits for the lock
    pub fn involves(&self, rank: Rank) -> bool {
        self.entries.iter().any(|e| e.rank == rank)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All lock queues of a session, owned by the coordinator.
///
/// Grants addressed to the coordinator itself are recorded here for its
/// direct acquisition path; every other grant is returned to be sent.
#[derive(Debug, Default)]
pub struct LockTable {
    queues: HashMap<String, LockQueue>,
    local_grants: HashMap<String, bool>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self, name: &str, rank: Rank, shared: bool) -> Vec<Grant> {
        let grants = self
            .queues
            .entry(name.to_string())
            .or_default()
            .request(rank, shared);
        self.route(name, grants)
    }

    pub fn release(&mut self, name: &str, rank: Rank) -> CoordinationResult<Vec<Grant>> {
        let queue = self.queues.get_mut(name).ok_or_else(|| {
            CoordinationError::LockProtocol(format!(
                "rank {} released lock {} which has no queue",
                rank, name
            ))
        })?;
        let grants = queue.release(rank)?;
        if queue.is_empty() {
            self.queues.remove(name);
        }
        Ok(self.route(name, grants))
    }

    fn route(&mut self, name: &str, grants: Vec<Grant>) -> Vec<Grant> {
        grants
            .into_iter()
            .filter(|grant| {
                if grant.rank == COORDINATOR_RANK {
                    self.local_grants.insert(name.to_string(), grant.delay);
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    /// Take a pending grant addressed to the coordinator
    pub fn take_local_grant(&mut self, name: &str) -> Option<bool> {
        self.local_grants.remove(name)
    }

    /// Names of locks `rank` holds or waits for
    pub fn locks_involving(&self, rank: Rank) -> Vec<String> {
        self.queues
            .iter()
            .filter(|(_, queue)| queue.involves(rank))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn holders(&self, name: &str) -> Vec<Rank> {
        self.queues
            .get(name)
            .map(LockQueue::holders)
            .unwrap_or_default()
    }
}

/// Request to acquire a named lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    pub name: String,
    pub shared: bool,
}

impl Message for LockRequest {
    const KIND: &'static str = "lock_request";
}

#[async_trait]
impl Handle for LockRequest {
    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        debug!(
            "Received request for lock {:?} from rank {}, shared={}",
            self.name, source, self.shared
        );
        let grants = server
            .shared()
            .locks
            .lock()
            .request(&self.name, source, self.shared);
        server.send_grants(&self.name, grants).await
    }
}

/// Release of a held lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRelease {
    pub name: String,
}

impl Message for LockRelease {
    const KIND: &'static str = "lock_release";
}

#[async_trait]
impl Handle for LockRelease {
    const REPLIES: bool = false;

    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        debug!("Finished with lock {:?} for rank {}", self.name, source);
        let grants = server.shared().locks.lock().release(&self.name, source)?;
        server.send_grants(&self.name, grants).await
    }
}

/// Permission to proceed as a holder of a lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockGranted {
    pub name: String,
    pub delay: bool,
}

impl Message for LockGranted {
    const KIND: &'static str = "lock_granted";
}

/// Named, re-entrant lock handle.
///
/// Only the outermost `acquire` talks to the coordinator; nested acquisitions
/// by the same handle just count.
pub struct DistributedLock {
    participant: Participant,
    name: String,
    shared: bool,
    count: usize,
}

impl DistributedLock {
    pub(crate) fn new(participant: Participant, name: impl Into<String>, shared: bool) -> Self {
        Self {
            participant,
            name: name.into(),
            shared,
            count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_held(&self) -> bool {
        self.count > 0
    }

    pub async fn acquire(&mut self) -> CoordinationResult<()> {
        if self.count == 0 {
            self.participant
                .acquire_lock(&self.name, self.shared)
                .await?;
        }
        self.count += 1;
        Ok(())
    }

    pub async fn release(&mut self) -> CoordinationResult<()> {
        if self.count == 0 {
            return Err(CoordinationError::LockNotHeld {
                name: self.name.clone(),
            });
        }
        self.count -= 1;
        if self.count == 0 {
            self.participant.release_lock(&self.name).await?;
        }
        Ok(())
    }

    /// Run `body` while holding the lock
    pub async fn with_lock<F, T>(&mut self, body: F) -> CoordinationResult<T>
    where
        F: Future<Output = T>,
    {
        self.acquire().await?;
        let output = body.await;
        self.release().await?;
        Ok(output)
    }
}
