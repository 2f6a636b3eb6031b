//! Coordinator receive loop
//!
//! Rank 0 receives from any rank and dispatches each message to its handler
//! until every worker has announced its exit. All coordination state lives
//! on the [`Server`] and is only touched from handlers.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use cohort_config::CohortConfig;
use cohort_ipc::{Frame, Rank};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::async_processing::AsyncWorkerHandle;
use crate::error::{CoordinationError, CoordinationResult};
use crate::jobs::IterationRegistry;
use crate::lock::Grant;
use crate::message::{Dispatch, Message};
use crate::messenger::Messenger;
use crate::resumption::ResumptionStore;
use crate::roles::{send_grants, CoordinatorShared};
use crate::stats::AccumulatorTable;

struct Collective {
    first: Box<dyn Any + Send + Sync>,
    ranks: Vec<Rank>,
}

enum Event {
    Frame(CoordinationResult<Frame>),
    Report,
}

/// Coordinator state and receive loop
pub struct Server {
    messenger: Messenger,
    config: Arc<CohortConfig>,
    shared: Arc<CoordinatorShared>,
    alive: BTreeSet<Rank>,
    collectives: HashMap<&'static str, Collective>,
    iterations: IterationRegistry,
    accumulators: AccumulatorTable,
    async_worker: Option<AsyncWorkerHandle>,
}

impl Server {
    /// Create a new server for the coordinator's messenger
    pub fn new(
        messenger: Messenger,
        config: Arc<CohortConfig>,
        shared: Arc<CoordinatorShared>,
        async_worker: Option<AsyncWorkerHandle>,
    ) -> Self {
        let workers = messenger.size().saturating_sub(1);
        let iterations = IterationRegistry::new(
            ResumptionStore::new(&config.jobs.resumption_file),
            config.jobs.resume,
            workers,
        );
        Self {
            alive: (1..messenger.size()).collect(),
            messenger,
            config,
            shared,
            collectives: HashMap::new(),
            iterations,
            accumulators: AccumulatorTable::new(),
            async_worker,
        }
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn size(&self) -> usize {
        self.messenger.size()
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<CoordinatorShared> {
        &self.shared
    }

    pub fn iterations_mut(&mut self) -> &mut IterationRegistry {
        &mut self.iterations
    }

    pub fn accumulators_mut(&mut self) -> &mut AccumulatorTable {
        &mut self.accumulators
    }

    /// Collect one copy of a collective message from every worker.
    ///
    /// Fails once any worker has exited, since it can no longer arrive. Each
    /// arrival is checked against the first with `check`. Once all
    /// workers have arrived, the first copy and the arrival order are
    /// returned and the collective is reset.
    pub fn gather<M, F>(
        &mut self,
        source: Rank,
        message: M,
        check: F,
    ) -> CoordinationResult<Option<(M, Vec<Rank>)>>
    where
        M: Message,
        F: FnOnce(&M, &M) -> CoordinationResult<()>,
    {
        let expected = self.size().saturating_sub(1);
        if let Some(exited) = (1..self.size()).find(|rank| !self.alive.contains(rank)) {
            return Err(CoordinationError::CollectiveAbandoned {
                kind: M::KIND.to_string(),
                rank: exited,
            });
        }

        if let Some(collective) = self.collectives.get_mut(M::KIND) {
            if collective.ranks.contains(&source) {
                return Err(CoordinationError::InconsistentRequest {
                    kind: M::KIND.to_string(),
                    rank: source,
                });
            }
            let first = collective.first.downcast_ref::<M>().ok_or_else(|| {
                CoordinationError::InconsistentRequest {
                    kind: M::KIND.to_string(),
                    rank: source,
                }
            })?;
            check(first, &message)?;
            collective.ranks.push(source);
        } else {
            self.collectives.insert(
                M::KIND,
                Collective {
                    first: Box::new(message),
                    ranks: vec![source],
                },
            );
        }

        let arrived = self
            .collectives
            .get(M::KIND)
            .map_or(0, |collective| collective.ranks.len());
        if arrived < expected {
            debug!(
                "{} from rank {}: {} of {} ranks arrived",
                M::KIND,
                source,
                arrived,
                expected
            );
            return Ok(None);
        }

        let collective = match self.collectives.remove(M::KIND) {
            Some(collective) => collective,
            None => return Ok(None),
        };
        let first = collective.first.downcast::<M>().map_err(|_| {
            CoordinationError::InconsistentRequest {
                kind: M::KIND.to_string(),
                rank: source,
            }
        })?;
        Ok(Some((*first, collective.ranks)))
    }

    /// [`Server::gather`] requiring every copy to be identical
    pub fn gather_consistent<M>(
        &mut self,
        source: Rank,
        message: M,
    ) -> CoordinationResult<Option<(M, Vec<Rank>)>>
    where
        M: Message + PartialEq,
    {
        self.gather(source, message, |first, next| {
            if first == next {
                Ok(())
            } else {
                Err(CoordinationError::InconsistentRequest {
                    kind: M::KIND.to_string(),
                    rank: source,
                })
            }
        })
    }

    /// Send lock grants to the workers they are addressed to
    pub(crate) async fn send_grants(&self, name: &str, grants: Vec<Grant>) -> CoordinationResult<()> {
        send_grants(&self.messenger, name, grants).await
    }

    pub(crate) fn worker_exited(&mut self, rank: Rank) -> CoordinationResult<()> {
        self.alive.remove(&rank);
        debug!("Rank {} exited; {} still running", rank, self.alive.len());

        if let Some((kind, _)) = self
            .collectives
            .iter()
            .find(|(_, collective)| !collective.ranks.contains(&rank))
        {
            return Err(CoordinationError::CollectiveAbandoned {
                kind: kind.to_string(),
                rank,
            });
        }

        let held = self.shared.locks.lock().locks_involving(rank);
        if !held.is_empty() {
            return Err(CoordinationError::LockProtocol(format!(
                "rank {} exited while holding or waiting for {:?}",
                rank, held
            )));
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> CoordinationResult<()> {
        let registry = Arc::clone(self.messenger.registry());
        let entry = *registry.entry(frame.tag)?;

        match entry.dispatch {
            Dispatch::Main(handler) => {
                let source = frame.source;
                if let Err(err) = handler(frame.payload, source, self).await {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    warn!("Error processing {} from rank {}: {}", entry.kind, source, err);
                    if entry.replies {
                        self.messenger
                            .send_remote_error(&err, entry.kind, source)
                            .await?;
                    }
                }
                Ok(())
            }
            Dispatch::Async(_) => match &self.async_worker {
                Some(worker) => worker.submit(frame),
                None => Err(CoordinationError::NoHandler {
                    kind: entry.kind.to_string(),
                }),
            },
            Dispatch::None => Err(CoordinationError::NoHandler {
                kind: entry.kind.to_string(),
            }),
        }
    }

    async fn broadcast_fatal(&self, error: &CoordinationError) {
        for &rank in &self.alive {
            if let Err(err) = self
                .messenger
                .send_remote_error(error, "coordinator", rank)
                .await
            {
                warn!("Unable to notify rank {} of fatal error: {}", rank, err);
            }
        }
    }

    /// Serve until every worker has exited, returning the final
    /// accumulator reports
    pub async fn run(mut self) -> CoordinationResult<Vec<String>> {
        info!(
            "Coordinator serving {} workers over {} transport",
            self.alive.len(),
            self.messenger.transport().name()
        );

        let period = self.config.statistics.report_interval;
        let mut report = interval_at(Instant::now() + period, period);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if self.alive.is_empty() {
                break Ok(());
            }

            let messenger = self.messenger.clone();
            let event = tokio::select! {
                frame = messenger.receive_frame() => Event::Frame(frame),
                _ = report.tick() => Event::Report,
            };

            match event {
                Event::Report => self.accumulators.report_changed(),
                Event::Frame(Ok(frame)) => {
                    if let Err(err) = self.dispatch(frame).await {
                        break Err(err);
                    }
                }
                Event::Frame(Err(err)) => break Err(err),
            }
        };

        if let Err(err) = &outcome {
            warn!("Coordinator stopping after fatal error: {}", err);
            self.broadcast_fatal(err).await;
        }

        if let Some(worker) = self.async_worker.take() {
            worker.shutdown().await?;
        }

        let reports = self.accumulators.report_final();
        info!("Coordinator finished");
        outcome.map(|_| reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{IterationContext, IterationMode, StartIteration};
    use crate::lock::LockRequest;
    use crate::message::{MessageRegistry, WorkerExit};
    use crate::shared_set::{SharedSetAdd, SharedSetResult};
    use crate::stats::{AccumulateStatistics, Accumulator, CreateAccumulator};
    use cohort_ipc::LocalTransport;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Hits {
        hits: u64,
    }

    impl Accumulator for Hits {
        const KIND: &'static str = "hits";

        fn add(&mut self, other: &Self) {
            self.hits += other.hits;
        }

        fn report(&self) -> String {
            format!("{} hits", self.hits)
        }
    }

    fn test_config(dir: &TempDir) -> CohortConfig {
        let mut config = CohortConfig::default();
        config.jobs.resumption_file = dir.path().join("resume.jsonl");
        config
    }

    /// A server on rank 0 plus the messengers of ranks 1..size
    fn serve(size: usize, registry: MessageRegistry, config: CohortConfig) -> (Server, Vec<Messenger>) {
        let registry = Arc::new(registry);
        let mut messengers: Vec<Messenger> = LocalTransport::group(size)
            .into_iter()
            .map(|transport| Messenger::new(Arc::new(transport), Arc::clone(&registry)))
            .collect();
        let coordinator = messengers.remove(0);
        let server = Server::new(
            coordinator,
            Arc::new(config),
            Arc::new(CoordinatorShared::new()),
            None,
        );
        (server, messengers)
    }

    fn lock_request(name: &str) -> LockRequest {
        LockRequest {
            name: name.to_string(),
            shared: false,
        }
    }

    #[tokio::test]
    async fn test_gather_completes_when_every_worker_arrived() {
        let dir = TempDir::new().unwrap();
        let (mut server, _workers) = serve(4, MessageRegistry::new(), test_config(&dir));

        assert!(server.gather_consistent(2, lock_request("L")).unwrap().is_none());
        assert!(server.gather_consistent(1, lock_request("L")).unwrap().is_none());
        let (message, ranks) = server
            .gather_consistent(3, lock_request("L"))
            .unwrap()
            .unwrap();
        assert_eq!(message, lock_request("L"));
        assert_eq!(ranks, vec![2, 1, 3]);

        // the collective starts over afterwards
        assert!(server.gather_consistent(3, lock_request("M")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gather_rejects_repeats_and_mismatches() {
        let dir = TempDir::new().unwrap();
        let (mut server, _workers) = serve(3, MessageRegistry::new(), test_config(&dir));
        server.gather_consistent(1, lock_request("L")).unwrap();
        let err = server.gather_consistent(1, lock_request("L")).unwrap_err();
        assert!(matches!(err, CoordinationError::InconsistentRequest { rank: 1, .. }));
        assert!(err.is_fatal());

        let (mut server, _workers) = serve(3, MessageRegistry::new(), test_config(&dir));
        server.gather_consistent(1, lock_request("L")).unwrap();
        let err = server.gather_consistent(2, lock_request("other")).unwrap_err();
        assert!(matches!(err, CoordinationError::InconsistentRequest { rank: 2, .. }));
    }

    #[tokio::test]
    async fn test_exit_abandons_pending_collective() {
        let dir = TempDir::new().unwrap();
        let (mut server, _workers) = serve(3, MessageRegistry::new(), test_config(&dir));
        server.gather_consistent(1, lock_request("L")).unwrap();

        let err = server.worker_exited(2).unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::CollectiveAbandoned { rank: 2, .. }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_collective_after_exit_fails() {
        let dir = TempDir::new().unwrap();
        let (mut server, _workers) = serve(4, MessageRegistry::new(), test_config(&dir));
        server.worker_exited(1).unwrap();

        let err = server.gather_consistent(2, lock_request("L")).unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::CollectiveAbandoned { rank: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_exit_while_holding_lock_fails() {
        let dir = TempDir::new().unwrap();
        let (mut server, _workers) = serve(3, MessageRegistry::new(), test_config(&dir));
        server.shared().locks.lock().request("db", 1, false);

        let err = server.worker_exited(1).unwrap_err();
        assert!(matches!(err, CoordinationError::LockProtocol(_)));
        assert!(server.worker_exited(2).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fatal_error_reaches_blocked_workers() {
        let dir = TempDir::new().unwrap();
        let (server, workers) = serve(3, MessageRegistry::new(), test_config(&dir));

        let start = |count: usize| StartIteration {
            context: IterationContext::new("loop", count),
            mode: IterationMode::Distributed,
        };
        let (four, five) = (start(4), start(5));
        let first = workers[0].request(&four, 0);
        let second = async {
            // rank 1 is already blocked when the mismatch arrives
            tokio::time::sleep(Duration::from_millis(20)).await;
            workers[1].request(&five, 0).await
        };

        let (served, first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(server.run(), first, second)
        })
        .await
        .unwrap();

        assert!(matches!(
            served,
            Err(CoordinationError::InconsistentJobList { rank: 2, .. })
        ));
        assert!(first.unwrap_err().is_remote());
        assert!(second.unwrap_err().is_remote());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unanswered_failures_stay_on_coordinator() {
        let dir = TempDir::new().unwrap();
        let (server, workers) = serve(2, MessageRegistry::new(), test_config(&dir));
        let worker = &workers[0];

        let client = async {
            let unknown = AccumulateStatistics {
                id: 7,
                partial: serde_json::json!({ "hits": 1 }),
            };
            worker.send(&unknown, 0).await?;
            let add = SharedSetAdd {
                set_id: "seen".to_string(),
                value: "a".to_string(),
            };
            let result = worker.request(&add, 0).await?;
            worker.send(&WorkerExit, 0).await?;
            Ok::<SharedSetResult, CoordinationError>(result)
        };

        let (served, result) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(server.run(), client)
        })
        .await
        .unwrap();

        assert_eq!(result.unwrap(), SharedSetResult { already_present: false });
        assert_eq!(served.unwrap(), Vec::<String>::new());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reports_while_serving() {
        let dir = TempDir::new().unwrap();
        let mut registry = MessageRegistry::new();
        registry.register_accumulator::<Hits>().unwrap();
        let mut config = test_config(&dir);
        config.statistics.report_interval = Duration::from_millis(5);
        let (server, workers) = serve(2, registry, config);
        let worker = &workers[0];

        let client = async {
            let create = CreateAccumulator {
                kind: Hits::KIND.to_string(),
            };
            let created = worker.request(&create, 0).await?;
            for _ in 0..3 {
                let partial = AccumulateStatistics {
                    id: created.id,
                    partial: serde_json::to_value(Hits { hits: 2 })?,
                };
                worker.send(&partial, 0).await?;
                // let the report tick fire between updates
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
            worker.send(&WorkerExit, 0).await
        };

        let (served, sent) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(server.run(), client)
        })
        .await
        .unwrap();

        sent.unwrap();
        assert_eq!(served.unwrap(), vec!["6 hits".to_string()]);
    }
}
