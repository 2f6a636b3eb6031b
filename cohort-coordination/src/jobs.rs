//! Job distribution
//!
//! Two disciplines are arbitrated by the coordinator:
//!
//! * **distributed**: each job index is handed to exactly one worker, in no
//!   particular order;
//! * **synchronized**: every worker walks the same index sequence, never more
//!   than one index ahead of the slowest worker.
//!
//! Iteration progress is persisted by context so that a later run presenting
//! the same context resumes where the previous one stopped.

use std::collections::{BTreeSet, HashMap};
use std::panic::Location;

use async_trait::async_trait;
use cohort_ipc::{Rank, COORDINATOR_RANK};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::barrier::BarrierRequest;
use crate::error::{CoordinationError, CoordinationResult};
use crate::message::{Handle, Message, Request};
use crate::messenger::Messenger;
use crate::resumption::ResumptionStore;
use crate::server::Server;

/// Identity of "the same logical loop" across separate runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationContext {
    /// Invocation string of the process
    pub argv: String,
    pub resume_id: String,
    pub job_count: usize,
}

impl IterationContext {
    /// Context with an explicit resumption identifier
    pub fn new(resume_id: impl Into<String>, job_count: usize) -> Self {
        Self {
            argv: std::env::args().collect::<Vec<_>>().join(" "),
            resume_id: resume_id.into(),
            job_count,
        }
    }

    /// Context whose resumption identifier is derived from the caller's
    /// source location.
    ///
    /// Moving the call site (or editing the lines above it) changes the
    /// identifier and so loses any persisted progress; prefer
    /// [`IterationContext::new`] for loops that must resume reliably.
    #[track_caller]
    pub fn from_call_site(job_count: usize) -> Self {
        let location = Location::caller();
        let digest = Sha256::digest(format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        ));
        Self::new(format!("{:x}", digest), job_count)
    }
}

/// Iteration discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationMode {
    Distributed,
    Synchronized,
}

/// Outcome of asking for the next job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextJob {
    /// Job assigned to the requester, `None` once the loop is exhausted
    pub job: Option<usize>,
    /// Job that became complete as a result of the request
    pub completed: Option<usize>,
}

/// Completion and assignment state of one loop
#[derive(Debug, Clone)]
pub struct IterationState {
    context: IterationContext,
    mode: IterationMode,
    complete: Vec<bool>,
    running: HashMap<Rank, usize>,
}

impl IterationState {
    /// State of a loop that has not started yet
    pub fn new(context: IterationContext, mode: IterationMode) -> Self {
        let complete = vec![false; context.job_count];
        Self {
            context,
            mode,
            complete,
            running: HashMap::new(),
        }
    }

    /// State of a loop resumed from persisted completion bits
    pub fn resumed(context: IterationContext, mode: IterationMode, complete: Vec<bool>) -> Self {
        if complete.len() != context.job_count {
            warn!(
                "Ignoring persisted state with {} jobs for a loop of {} jobs",
                complete.len(),
                context.job_count
            );
            return Self::new(context, mode);
        }
        Self {
            context,
            mode,
            complete,
            running: HashMap::new(),
        }
    }

    pub fn context(&self) -> &IterationContext {
        &self.context
    }

    pub fn mode(&self) -> IterationMode {
        self.mode
    }

    pub fn complete_jobs(&self) -> &[bool] {
        &self.complete
    }

    pub fn completed_count(&self) -> usize {
        self.complete.iter().filter(|done| **done).count()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.iter().all(|done| *done)
    }

    fn is_running(&self, job: usize) -> bool {
        self.running.values().any(|&running| running == job)
    }

    /// Record that `rank` finished its previous job and assign the next one
    pub fn next_job(&mut self, rank: Rank) -> NextJob {
        let previous = self.running.remove(&rank);
        let mut completed = None;

        let job = match self.mode {
            IterationMode::Distributed => {
                if let Some(previous) = previous {
                    self.complete[previous] = true;
                    completed = Some(previous);
                }
                (0..self.complete.len()).find(|&job| !self.complete[job] && !self.is_running(job))
            }
            IterationMode::Synchronized => {
                // complete only once every rank has moved past it
                if let Some(previous) = previous {
                    if !self.is_running(previous) {
                        self.complete[previous] = true;
                        completed = Some(previous);
                    }
                }
                let start = previous.map_or(0, |previous| previous + 1);
                (start..self.complete.len()).find(|&job| !self.complete[job])
            }
        };

        if let Some(job) = job {
            self.running.insert(rank, job);
        }
        NextJob { job, completed }
    }
}

struct ActiveIteration {
    state: IterationState,
    finished: BTreeSet<Rank>,
}

/// Iterations known to the coordinator during this run
pub struct IterationRegistry {
    store: ResumptionStore,
    resume: bool,
    workers: usize,
    next_id: u64,
    active: HashMap<u64, ActiveIteration>,
}

impl IterationRegistry {
    pub fn new(store: ResumptionStore, resume: bool, workers: usize) -> Self {
        Self {
            store,
            resume,
            workers,
            next_id: 0,
            active: HashMap::new(),
        }
    }

    /// Create or resume the shared state of a loop
    pub async fn start(&mut self, context: IterationContext, mode: IterationMode) -> u64 {
        let state = load_state(&self.store, self.resume, context, mode).await;
        let id = self.next_id;
        self.next_id += 1;
        self.active.insert(
            id,
            ActiveIteration {
                state,
                finished: BTreeSet::new(),
            },
        );
        id
    }

    /// Assign the next job of iteration `id` to `rank`
    pub async fn next_job(&mut self, id: u64, rank: Rank) -> CoordinationResult<Option<usize>> {
        let iteration = self
            .active
            .get_mut(&id)
            .ok_or(CoordinationError::UnknownIteration { id })?;

        let next = iteration.state.next_job(rank);
        if next.completed.is_some() {
            persist(&self.store, &iteration.state).await;
        }

        match next.job {
            Some(job) => info!(
                "Send job {} of {} to rank {}",
                job,
                iteration.state.context().job_count,
                rank
            ),
            None => {
                info!("Finished jobs; notify rank {}", rank);
                iteration.finished.insert(rank);
                if iteration.finished.len() >= self.workers {
                    debug!("Retiring iteration {}", id);
                    self.active.remove(&id);
                }
            }
        }
        Ok(next.job)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

async fn load_state(
    store: &ResumptionStore,
    resume: bool,
    context: IterationContext,
    mode: IterationMode,
) -> IterationState {
    let prior = if resume { store.load(&context).await } else { None };
    match prior {
        Some(complete) => {
            let state = IterationState::resumed(context, mode, complete);
            info!(
                "Resuming loop {}: {} of {} jobs already complete",
                state.context().resume_id,
                state.completed_count(),
                state.context().job_count
            );
            state
        }
        None => IterationState::new(context, mode),
    }
}

async fn persist(store: &ResumptionStore, state: &IterationState) {
    if let Err(err) = store.save(state.context(), state.complete_jobs()).await {
        warn!(
            "Unable to persist progress to {}: {}",
            store.path().display(),
            err
        );
    }
}

/// Collective start of a loop, presented by every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartIteration {
    pub context: IterationContext,
    pub mode: IterationMode,
}

impl Message for StartIteration {
    const KIND: &'static str = "start_iteration";
}

impl Request for StartIteration {
    type Response = IterationStarted;
}

#[async_trait]
impl Handle for StartIteration {
    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        let gathered = server.gather(source, self, |first, next| {
            if first.context.job_count != next.context.job_count {
                return Err(CoordinationError::InconsistentJobList {
                    expected: first.context.job_count,
                    actual: next.context.job_count,
                    rank: source,
                });
            }
            if first != next {
                return Err(CoordinationError::InconsistentContext { rank: source });
            }
            Ok(())
        })?;

        if let Some((message, ranks)) = gathered {
            let iteration = server
                .iterations_mut()
                .start(message.context, message.mode)
                .await;
            for rank in ranks {
                server
                    .messenger()
                    .respond::<StartIteration>(&IterationStarted { iteration }, rank)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Identifier of a started loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationStarted {
    pub iteration: u64,
}

impl Message for IterationStarted {
    const KIND: &'static str = "iteration_started";
}

/// Request for the next job of a loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestJob {
    pub iteration: u64,
}

impl Message for RequestJob {
    const KIND: &'static str = "request_job";
}

impl Request for RequestJob {
    type Response = DeliverJob;
}

#[async_trait]
impl Handle for RequestJob {
    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        let job = server
            .iterations_mut()
            .next_job(self.iteration, source)
            .await?;
        server
            .messenger()
            .respond::<RequestJob>(&DeliverJob { job }, source)
            .await
    }
}

/// Next job index, or `None` when the loop is exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverJob {
    pub job: Option<usize>,
}

impl Message for DeliverJob {
    const KIND: &'static str = "deliver_job";
}

/// Job list generated on one worker and fanned out to the others
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributeJobList {
    pub items: Vec<String>,
}

impl Message for DistributeJobList {
    const KIND: &'static str = "distribute_job_list";
}

#[async_trait]
impl Handle for DistributeJobList {
    const REPLIES: bool = false;

    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        debug!(
            "Forwarding job list of {} items from rank {}",
            self.items.len(),
            source
        );
        for rank in (1..server.size()).filter(|&rank| rank != source) {
            server.messenger().send(&self, rank).await?;
        }
        Ok(())
    }
}

enum Driver {
    Remote {
        messenger: Messenger,
        iteration: Option<u64>,
    },
    Local {
        store: ResumptionStore,
        resume: bool,
        state: Option<IterationState>,
    },
}

/// Lazily started loop yielding job indices to the calling process
pub struct JobIterator {
    context: IterationContext,
    mode: IterationMode,
    driver: Driver,
    exhausted: bool,
}

impl JobIterator {
    pub(crate) fn remote(messenger: Messenger, context: IterationContext, mode: IterationMode) -> Self {
        Self {
            context,
            mode,
            driver: Driver::Remote {
                messenger,
                iteration: None,
            },
            exhausted: false,
        }
    }

    pub(crate) fn local(
        store: ResumptionStore,
        resume: bool,
        context: IterationContext,
        mode: IterationMode,
    ) -> Self {
        Self {
            context,
            mode,
            driver: Driver::Local {
                store,
                resume,
                state: None,
            },
            exhausted: false,
        }
    }

    pub fn context(&self) -> &IterationContext {
        &self.context
    }

    pub fn mode(&self) -> IterationMode {
        self.mode
    }

    /// Next job index for this process, or `None` once the loop is over
    pub async fn next(&mut self) -> CoordinationResult<Option<usize>> {
        if self.exhausted {
            return Ok(None);
        }

        let job = match &mut self.driver {
            Driver::Remote {
                messenger,
                iteration,
            } => {
                let id = match *iteration {
                    Some(id) => id,
                    None => {
                        let started = messenger
                            .request(
                                &StartIteration {
                                    context: self.context.clone(),
                                    mode: self.mode,
                                },
                                COORDINATOR_RANK,
                            )
                            .await?;
                        *iteration = Some(started.iteration);
                        started.iteration
                    }
                };

                let delivered = messenger
                    .request(&RequestJob { iteration: id }, COORDINATOR_RANK)
                    .await?;

                // lock-step: nobody acts on a job until every rank has asked
                if self.mode == IterationMode::Synchronized || delivered.job.is_none() {
                    messenger.request(&BarrierRequest, COORDINATOR_RANK).await?;
                }
                delivered.job
            }
            Driver::Local {
                store,
                resume,
                state,
            } => {
                if state.is_none() {
                    *state =
                        Some(load_state(store, *resume, self.context.clone(), self.mode).await);
                }
                match state.as_mut() {
                    Some(state) => {
                        let next = state.next_job(COORDINATOR_RANK);
                        if next.completed.is_some() {
                            persist(store, state).await;
                        }
                        next.job
                    }
                    None => None,
                }
            }
        };

        if job.is_none() {
            self.exhausted = true;
        }
        Ok(job)
    }
}

/// Loop over the items of a slice, by index
pub struct ItemIterator<'a, T> {
    items: &'a [T],
    jobs: JobIterator,
}

impl<'a, T> ItemIterator<'a, T> {
    pub(crate) fn new(items: &'a [T], jobs: JobIterator) -> Self {
        Self { items, jobs }
    }

    pub async fn next(&mut self) -> CoordinationResult<Option<&'a T>> {
        let job = self.jobs.next().await?;
        Ok(job.and_then(|index| self.items.get(index)))
    }
}

/// Job list generated once and distributed-iterated by every worker
pub struct GeneratedJobs {
    items: Vec<String>,
    jobs: JobIterator,
}

impl GeneratedJobs {
    pub(crate) fn new(items: Vec<String>, jobs: JobIterator) -> Self {
        Self { items, jobs }
    }

    /// The full job list, identical on every worker
    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub async fn next(&mut self) -> CoordinationResult<Option<&str>> {
        let job = self.jobs.next().await?;
        Ok(job
            .and_then(|index| self.items.get(index))
            .map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(job_count: usize) -> IterationContext {
        IterationContext {
            argv: "test".to_string(),
            resume_id: "loop".to_string(),
            job_count,
        }
    }

    #[test]
    fn test_call_site_ids_differ() {
        let first = IterationContext::from_call_site(3);
        let second = IterationContext::from_call_site(3);
        assert_ne!(first.resume_id, second.resume_id);
        assert_eq!(first.resume_id.len(), 64);
    }

    #[test]
    fn test_distributed_covers_every_job_once() {
        let mut state = IterationState::new(context(5), IterationMode::Distributed);
        let mut handed_out = Vec::new();
        loop {
            let mut any = false;
            for rank in 1..=3 {
                if let Some(job) = state.next_job(rank).job {
                    handed_out.push(job);
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
        handed_out.sort_unstable();
        assert_eq!(handed_out, vec![0, 1, 2, 3, 4]);
        assert!(state.is_complete());
    }

    #[test]
    fn test_distributed_completes_previous_job() {
        let mut state = IterationState::new(context(3), IterationMode::Distributed);
        assert_eq!(state.next_job(1), NextJob { job: Some(0), completed: None });
        assert_eq!(state.next_job(2), NextJob { job: Some(1), completed: None });
        assert_eq!(state.next_job(1), NextJob { job: Some(2), completed: Some(0) });
        assert_eq!(state.complete_jobs(), &[true, false, false]);
    }

    #[test]
    fn test_synchronized_lock_step() {
        let mut state = IterationState::new(context(3), IterationMode::Synchronized);
        assert_eq!(state.next_job(1).job, Some(0));
        assert_eq!(state.next_job(2).job, Some(0));

        // rank 1 moves on while rank 2 still runs job 0
        let next = state.next_job(1);
        assert_eq!(next, NextJob { job: Some(1), completed: None });
        assert!(!state.complete_jobs()[0]);

        let next = state.next_job(2);
        assert_eq!(next, NextJob { job: Some(1), completed: Some(0) });

        assert_eq!(state.next_job(1).job, Some(2));
        assert_eq!(state.next_job(2), NextJob { job: Some(2), completed: Some(1) });
        assert_eq!(state.next_job(1).job, None);
        assert_eq!(state.next_job(2), NextJob { job: None, completed: Some(2) });
        assert!(state.is_complete());
    }

    #[test]
    fn test_resumed_state_skips_complete_jobs() {
        let mut state = IterationState::resumed(
            context(4),
            IterationMode::Distributed,
            vec![true, false, true, false],
        );
        assert_eq!(state.next_job(1).job, Some(1));
        assert_eq!(state.next_job(2).job, Some(3));
        assert_eq!(state.next_job(3).job, None);
    }

    #[test]
    fn test_mismatched_resume_state_ignored() {
        let state = IterationState::resumed(context(4), IterationMode::Distributed, vec![true]);
        assert_eq!(state.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_persists_and_retires() {
        let dir = TempDir::new().unwrap();
        let store = ResumptionStore::new(dir.path().join("resume.jsonl"));
        let mut registry = IterationRegistry::new(store.clone(), true, 2);

        let id = registry.start(context(2), IterationMode::Distributed).await;
        assert_eq!(registry.next_job(id, 1).await.unwrap(), Some(0));
        assert_eq!(registry.next_job(id, 2).await.unwrap(), Some(1));
        assert_eq!(registry.next_job(id, 1).await.unwrap(), None);
        assert_eq!(store.load(&context(2)).await.unwrap(), vec![true, false]);

        assert_eq!(registry.next_job(id, 2).await.unwrap(), None);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(store.load(&context(2)).await.unwrap(), vec![true, true]);

        assert!(matches!(
            registry.next_job(id, 1).await,
            Err(CoordinationError::UnknownIteration { .. })
        ));

        // a new run with the same context has nothing left to do
        let mut rerun = IterationRegistry::new(store.clone(), true, 2);
        let id = rerun.start(context(2), IterationMode::Distributed).await;
        assert_eq!(rerun.next_job(id, 1).await.unwrap(), None);

        // unless resumption is disabled
        let mut fresh = IterationRegistry::new(store, false, 2);
        let id = fresh.start(context(2), IterationMode::Distributed).await;
        assert_eq!(fresh.next_job(id, 1).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_local_iterator_runs_every_job() {
        let dir = TempDir::new().unwrap();
        let store = ResumptionStore::new(dir.path().join("resume.jsonl"));
        let mut jobs = JobIterator::local(store, true, context(3), IterationMode::Distributed);

        let mut seen = Vec::new();
        while let Some(job) = jobs.next().await.unwrap() {
            seen.push(job);
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(jobs.next().await.unwrap(), None);
    }
}
