//! The two roles a process can play in a session
//!
//! Rank 0 is the coordinator: it owns all shared coordination state and
//! takes the direct path to it. Every other rank is a worker and reaches
//! that state only through request/response round trips.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cohort_config::CohortConfig;
use cohort_ipc::{Rank, COORDINATOR_RANK};
use parking_lot::Mutex;
use tracing::debug;

use crate::barrier::BarrierRequest;
use crate::datacache::{DatasetConnection, DatasetLoader, SharedDataCache};
use crate::error::{CoordinationError, CoordinationResult};
use crate::jobs::{
    DistributeJobList, GeneratedJobs, ItemIterator, IterationContext, IterationMode, JobIterator,
};
use crate::lock::{DistributedLock, Grant, LockGranted, LockRelease, LockRequest, LockTable};
use crate::messenger::Messenger;
use crate::resumption::ResumptionStore;
use crate::shared_set::SharedSet;
use crate::stats::{Accumulator, StatisticsAccumulator};

/// Coordinator state reachable from both the receive loop and the
/// coordinator's own foreground work
#[derive(Debug, Default)]
pub struct CoordinatorShared {
    pub(crate) locks: Mutex<LockTable>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl CoordinatorShared {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert into a named set, returning `false` if the value was present
    pub fn insert_into_set(&self, set_id: &str, value: String) -> bool {
        self.sets
            .lock()
            .entry(set_id.to_string())
            .or_default()
            .insert(value)
    }

    /// Ranks currently holding lock `name`
    pub fn lock_holders(&self, name: &str) -> Vec<Rank> {
        self.locks.lock().holders(name)
    }
}

/// Rank 0
#[derive(Clone)]
pub struct CoordinatorRole {
    messenger: Messenger,
    config: Arc<CohortConfig>,
    shared: Arc<CoordinatorShared>,
    local_cache: Arc<tokio::sync::Mutex<SharedDataCache>>,
    connection_open: Arc<AtomicBool>,
}

impl CoordinatorRole {
    pub fn new(
        messenger: Messenger,
        config: Arc<CohortConfig>,
        shared: Arc<CoordinatorShared>,
        loader: Option<Arc<dyn DatasetLoader>>,
    ) -> Self {
        let cache = SharedDataCache::new(loader, None, config.data_cache.segment_prefix.clone());
        Self {
            messenger,
            config,
            shared,
            local_cache: Arc::new(tokio::sync::Mutex::new(cache)),
            connection_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shared(&self) -> &Arc<CoordinatorShared> {
        &self.shared
    }

    fn has_workers(&self) -> bool {
        self.messenger.size() > 1
    }

    /// Queue for the lock and poll the local table until it is granted
    async fn acquire_lock(&self, name: &str, shared: bool) -> CoordinationResult<()> {
        let grants = self.shared.locks.lock().request(name, COORDINATOR_RANK, shared);
        send_grants(&self.messenger, name, grants).await?;

        loop {
            let granted = self.shared.locks.lock().take_local_grant(name);
            if let Some(delay) = granted {
                if delay {
                    tokio::time::sleep(self.config.locking.grace_period).await;
                }
                debug!("Coordinator acquired lock {:?}", name);
                return Ok(());
            }
            tokio::time::sleep(self.config.locking.poll_interval).await;
        }
    }

    async fn release_lock(&self, name: &str) -> CoordinationResult<()> {
        let grants = self.shared.locks.lock().release(name, COORDINATOR_RANK)?;
        send_grants(&self.messenger, name, grants).await
    }
}

pub(crate) async fn send_grants(
    messenger: &Messenger,
    name: &str,
    grants: Vec<Grant>,
) -> CoordinationResult<()> {
    for grant in grants {
        debug!("Issue lock {:?} to rank {}", name, grant.rank);
        messenger
            .send(
                &LockGranted {
                    name: name.to_string(),
                    delay: grant.delay,
                },
                grant.rank,
            )
            .await?;
    }
    Ok(())
}

/// Any rank other than 0
#[derive(Clone)]
pub struct WorkerRole {
    messenger: Messenger,
    config: Arc<CohortConfig>,
    connection_open: Arc<AtomicBool>,
}

impl WorkerRole {
    pub fn new(messenger: Messenger, config: Arc<CohortConfig>) -> Self {
        Self {
            messenger,
            config,
            connection_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    async fn acquire_lock(&self, name: &str, shared: bool) -> CoordinationResult<()> {
        let started = tokio::time::Instant::now();
        self.messenger
            .send(
                &LockRequest {
                    name: name.to_string(),
                    shared,
                },
                COORDINATOR_RANK,
            )
            .await?;

        let (granted, _) = self
            .messenger
            .receive::<LockGranted>(Some(COORDINATOR_RANK))
            .await?;
        if granted.name != name {
            return Err(CoordinationError::LockProtocol(format!(
                "received lock {} while waiting for {}",
                granted.name, name
            )));
        }
        if granted.delay {
            tokio::time::sleep(self.config.locking.grace_period).await;
        }
        debug!(
            "Lock {:?} acquired in {:.1}s",
            name,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn release_lock(&self, name: &str) -> CoordinationResult<()> {
        self.messenger
            .send(
                &LockRelease {
                    name: name.to_string(),
                },
                COORDINATOR_RANK,
            )
            .await
    }
}

/// This process's part in the session, fixed at startup
#[derive(Clone)]
pub enum Participant {
    Coordinator(CoordinatorRole),
    Worker(WorkerRole),
}

impl Participant {
    pub fn messenger(&self) -> &Messenger {
        match self {
            Participant::Coordinator(role) => &role.messenger,
            Participant::Worker(role) => &role.messenger,
        }
    }

    pub fn config(&self) -> &CohortConfig {
        match self {
            Participant::Coordinator(role) => &role.config,
            Participant::Worker(role) => &role.config,
        }
    }

    pub fn rank(&self) -> Rank {
        self.messenger().rank()
    }

    pub fn size(&self) -> usize {
        self.messenger().size()
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Participant::Coordinator(_))
    }

    /// Wait until every worker has reached this point
    pub async fn barrier(&self) -> CoordinationResult<()> {
        match self {
            Participant::Coordinator(role) if role.has_workers() => {
                Err(CoordinationError::CoordinatorBarrier)
            }
            Participant::Coordinator(_) => Ok(()),
            Participant::Worker(role) => {
                role.messenger
                    .request(&BarrierRequest, COORDINATOR_RANK)
                    .await?;
                Ok(())
            }
        }
    }

    /// Exclusive lock of the given name
    pub fn exclusive_lock(&self, name: impl Into<String>) -> DistributedLock {
        DistributedLock::new(self.clone(), name, false)
    }

    /// Shared lock of the given name
    pub fn shared_lock(&self, name: impl Into<String>) -> DistributedLock {
        DistributedLock::new(self.clone(), name, true)
    }

    pub(crate) async fn acquire_lock(&self, name: &str, shared: bool) -> CoordinationResult<()> {
        match self {
            Participant::Coordinator(role) => role.acquire_lock(name, shared).await,
            Participant::Worker(role) => role.acquire_lock(name, shared).await,
        }
    }

    pub(crate) async fn release_lock(&self, name: &str) -> CoordinationResult<()> {
        match self {
            Participant::Coordinator(role) => role.release_lock(name).await,
            Participant::Worker(role) => role.release_lock(name).await,
        }
    }

    /// Loop over `context.job_count` jobs with the given discipline
    pub fn iterate(
        &self,
        context: IterationContext,
        mode: IterationMode,
    ) -> CoordinationResult<JobIterator> {
        match self {
            Participant::Coordinator(role) if role.has_workers() => {
                Err(CoordinationError::CoordinatorCannotIterate)
            }
            Participant::Coordinator(role) => Ok(JobIterator::local(
                ResumptionStore::new(&role.config.jobs.resumption_file),
                role.config.jobs.resume,
                context,
                mode,
            )),
            Participant::Worker(role) => {
                Ok(JobIterator::remote(role.messenger.clone(), context, mode))
            }
        }
    }

    /// Distributed loop over `job_count` jobs, resumable per call site
    #[track_caller]
    pub fn distributed(&self, job_count: usize) -> CoordinationResult<JobIterator> {
        self.iterate(
            IterationContext::from_call_site(job_count),
            IterationMode::Distributed,
        )
    }

    /// Synchronized loop over `job_count` jobs, resumable per call site
    #[track_caller]
    pub fn synchronized(&self, job_count: usize) -> CoordinationResult<JobIterator> {
        self.iterate(
            IterationContext::from_call_site(job_count),
            IterationMode::Synchronized,
        )
    }

    /// Distributed loop yielding the items of a slice
    #[track_caller]
    pub fn distributed_items<'a, T>(&self, items: &'a [T]) -> CoordinationResult<ItemIterator<'a, T>> {
        let jobs = self.distributed(items.len())?;
        Ok(ItemIterator::new(items, jobs))
    }

    /// Generate a job list on rank 1 only, share it with every worker and
    /// distributed-iterate it
    pub async fn generate_then_distribute<F>(
        &self,
        resume_id: &str,
        generate: F,
    ) -> CoordinationResult<GeneratedJobs>
    where
        F: FnOnce() -> Vec<String>,
    {
        let items = match self {
            Participant::Coordinator(role) if role.has_workers() => {
                return Err(CoordinationError::CoordinatorCannotIterate)
            }
            Participant::Coordinator(_) => generate(),
            Participant::Worker(role) if role.messenger.rank() == 1 => {
                let items = generate();
                debug!("Generated job list of {} items", items.len());
                role.messenger
                    .send(
                        &DistributeJobList {
                            items: items.clone(),
                        },
                        COORDINATOR_RANK,
                    )
                    .await?;
                items
            }
            Participant::Worker(role) => {
                debug!("Awaiting job list from rank 1");
                let (list, _) = role
                    .messenger
                    .receive::<DistributeJobList>(Some(COORDINATOR_RANK))
                    .await?;
                list.items
            }
        };

        let jobs = self.iterate(
            IterationContext::new(resume_id, items.len()),
            IterationMode::Distributed,
        )?;
        Ok(GeneratedJobs::new(items, jobs))
    }

    /// Statistics accumulator of kind `A`.
    ///
    /// On workers this is a collective call: every worker must ask for the
    /// same kind before any of them proceeds.
    pub async fn accumulator<A: Accumulator>(&self) -> CoordinationResult<StatisticsAccumulator<A>> {
        match self {
            Participant::Coordinator(_) => Ok(StatisticsAccumulator::local()),
            Participant::Worker(role) => StatisticsAccumulator::register(role.messenger.clone()).await,
        }
    }

    /// Named set shared by every process of the session
    pub fn shared_set(&self, set_id: impl Into<String>) -> SharedSet {
        SharedSet::new(self.clone(), set_id)
    }

    /// Connect to dataset `name` through the coordinator's cache, waiting
    /// until it is resident
    pub async fn open_dataset(
        &self,
        name: &str,
        shared_memory: bool,
    ) -> CoordinationResult<DatasetConnection> {
        match self {
            Participant::Coordinator(role) if role.has_workers() => {
                Err(CoordinationError::WorkerOnly {
                    operation: "open_dataset",
                })
            }
            Participant::Coordinator(role) => {
                DatasetConnection::open_local(
                    Arc::clone(&role.local_cache),
                    Arc::clone(&role.connection_open),
                    name,
                )
                .await
            }
            Participant::Worker(role) => {
                DatasetConnection::open_remote(
                    role.messenger.clone(),
                    Arc::clone(&role.connection_open),
                    name,
                    shared_memory,
                )
                .await
            }
        }
    }
}
