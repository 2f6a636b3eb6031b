//! Session launcher
//!
//! A session wires one transport per rank to a [`Participant`], runs the
//! coordinator's server loop on rank 0 and the user's body on every worker,
//! and tears everything down once the workers have exited.

use std::future::Future;
use std::sync::Arc;

use cohort_config::CohortConfig;
use cohort_ipc::{LocalTransport, NullTransport, Rank, Transport, COORDINATOR_RANK};
use futures::future::BoxFuture;
use tokio::task::JoinError;
use tracing::{info, warn, Instrument};

use crate::async_processing::{AsyncContext, AsyncWorkerHandle};
use crate::datacache::{DatasetLoader, SharedDataCache};
use crate::error::{CoordinationError, CoordinationResult};
use crate::message::{MessageRegistry, WorkerExit};
use crate::messenger::Messenger;
use crate::roles::{CoordinatorRole, CoordinatorShared, Participant, WorkerRole};
use crate::server::Server;

type CoordinatorBody = Box<dyn FnOnce(Participant) -> BoxFuture<'static, CoordinationResult<()>> + Send>;

/// Outcome of a finished session
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Number of processes that took part, coordinator included
    pub size: usize,
    /// Final report line of every accumulator the coordinator held
    pub accumulators: Vec<String>,
}

/// Entry point for running code under coordination
pub struct Session;

impl Session {
    pub fn builder(config: CohortConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            registry: MessageRegistry::new(),
            loader: None,
        }
    }
}

pub struct SessionBuilder {
    config: CohortConfig,
    registry: MessageRegistry,
    loader: Option<Arc<dyn DatasetLoader>>,
}

impl SessionBuilder {
    /// Use a registry with additional message or accumulator types
    pub fn registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Source of datasets for the shared data cache
    pub fn dataset_loader(mut self, loader: Arc<dyn DatasetLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Run `body` once on every worker, or once in total on the null
    /// backend
    pub async fn run<F, Fut>(self, body: F) -> CoordinationResult<SessionReport>
    where
        F: Fn(Participant) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordinationResult<()>> + Send + 'static,
    {
        self.launch(None, body).await
    }

    /// Like [`SessionBuilder::run`], additionally running `coordinator` on
    /// rank 0 alongside its server loop
    pub async fn run_with_coordinator<C, CFut, F, Fut>(
        self,
        coordinator: C,
        body: F,
    ) -> CoordinationResult<SessionReport>
    where
        C: FnOnce(Participant) -> CFut + Send + 'static,
        CFut: Future<Output = CoordinationResult<()>> + Send + 'static,
        F: Fn(Participant) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordinationResult<()>> + Send + 'static,
    {
        let coordinator: CoordinatorBody =
            Box::new(move |participant| Box::pin(coordinator(participant)));
        self.launch(Some(coordinator), body).await
    }

    async fn launch<F, Fut>(
        self,
        coordinator: Option<CoordinatorBody>,
        body: F,
    ) -> CoordinationResult<SessionReport>
    where
        F: Fn(Participant) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordinationResult<()>> + Send + 'static,
    {
        self.config.validate_all()?;
        let backend = self.config.backend;
        info!("Starting session on {} backend", backend);

        let registry = Arc::new(self.registry);
        let config = Arc::new(self.config);

        if !backend.is_parallel() {
            return run_single(registry, config, self.loader, coordinator, body).await;
        }

        let size = backend.processes();
        let body = Arc::new(body);
        let mut coordinator = coordinator;
        let mut tasks = Vec::with_capacity(size);

        for transport in LocalTransport::group(size) {
            let rank = transport.rank();
            let messenger = Messenger::new(Arc::new(transport), Arc::clone(&registry));
            let config = Arc::clone(&config);
            let span = cohort_logging::rank_span(rank);

            let task = if rank == COORDINATOR_RANK {
                let loader = self.loader.clone();
                let coordinator = coordinator.take();
                tokio::spawn(
                    async move { run_coordinator(messenger, config, loader, coordinator).await }
                        .instrument(span),
                )
            } else {
                let body = Arc::clone(&body);
                tokio::spawn(
                    async move {
                        run_worker(messenger, config, move |participant| body(participant))
                            .await
                            .map(|_| Vec::new())
                    }
                    .instrument(span),
                )
            };
            tasks.push(task);
        }

        let mut first_error = None;
        let mut accumulators = Vec::new();
        for (rank, task) in tasks.into_iter().enumerate() {
            match task.await.map_err(|err| panicked(rank, err)).and_then(|result| result) {
                Ok(reports) if rank == COORDINATOR_RANK => accumulators = reports,
                Ok(_) => {}
                Err(err) => {
                    warn!("Rank {} failed: {}", rank, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("Session finished");
                Ok(SessionReport { size, accumulators })
            }
        }
    }
}

fn panicked(rank: Rank, err: JoinError) -> CoordinationError {
    CoordinationError::WorkerPanicked {
        rank,
        message: err.to_string(),
    }
}

async fn run_single<F, Fut>(
    registry: Arc<MessageRegistry>,
    config: Arc<CohortConfig>,
    loader: Option<Arc<dyn DatasetLoader>>,
    coordinator: Option<CoordinatorBody>,
    body: F,
) -> CoordinationResult<SessionReport>
where
    F: Fn(Participant) -> Fut,
    Fut: Future<Output = CoordinationResult<()>>,
{
    let messenger = Messenger::new(Arc::new(NullTransport::new()), registry);
    let participant = Participant::Coordinator(CoordinatorRole::new(
        messenger,
        config,
        Arc::new(CoordinatorShared::new()),
        loader,
    ));

    if let Some(coordinator) = coordinator {
        coordinator(participant.clone()).await?;
    }
    body(participant).await?;

    Ok(SessionReport {
        size: 1,
        accumulators: Vec::new(),
    })
}

async fn run_coordinator(
    messenger: Messenger,
    config: Arc<CohortConfig>,
    loader: Option<Arc<dyn DatasetLoader>>,
    coordinator: Option<CoordinatorBody>,
) -> CoordinationResult<Vec<String>> {
    let shared = Arc::new(CoordinatorShared::new());
    let segments = if config.data_cache.shared_memory {
        messenger.transport().shared_segments()
    } else {
        None
    };
    let cache = SharedDataCache::new(
        loader.clone(),
        segments,
        config.data_cache.segment_prefix.clone(),
    );
    let async_worker = AsyncWorkerHandle::spawn(AsyncContext::new(messenger.clone(), cache));
    let server = Server::new(
        messenger.clone(),
        Arc::clone(&config),
        Arc::clone(&shared),
        Some(async_worker),
    );

    let foreground = coordinator.map(|body| {
        let participant = Participant::Coordinator(CoordinatorRole::new(
            messenger.clone(),
            Arc::clone(&config),
            shared,
            loader,
        ));
        tokio::spawn(body(participant).in_current_span())
    });

    let served = server.run().await;
    let ran = match foreground {
        // nobody is left to grant or answer the foreground body
        Some(task) if served.is_err() => {
            task.abort();
            Ok(())
        }
        Some(task) => task
            .await
            .map_err(|err| panicked(COORDINATOR_RANK, err))
            .and_then(|result| result),
        None => Ok(()),
    };

    leave(&messenger).await;
    let reports = served?;
    ran?;
    Ok(reports)
}

async fn run_worker<F, Fut>(
    messenger: Messenger,
    config: Arc<CohortConfig>,
    body: F,
) -> CoordinationResult<()>
where
    F: FnOnce(Participant) -> Fut,
    Fut: Future<Output = CoordinationResult<()>> + Send + 'static,
{
    let participant = Participant::Worker(WorkerRole::new(messenger.clone(), config));
    let outcome = tokio::spawn(body(participant).in_current_span())
        .await
        .map_err(|err| panicked(messenger.rank(), err))
        .and_then(|result| result);

    if let Err(err) = messenger.send(&WorkerExit, COORDINATOR_RANK).await {
        warn!("Unable to announce exit: {}", err);
    }
    leave(&messenger).await;
    outcome
}

/// Join the closing transport barrier and release the transport
async fn leave(messenger: &Messenger) {
    let transport = messenger.transport();
    if let Err(err) = transport.barrier().await {
        warn!("Closing barrier failed: {}", err);
    }
    if let Err(err) = transport.finalize().await {
        warn!("Transport finalize failed: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_config::BackendSpec;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, backend: BackendSpec) -> CohortConfig {
        let mut config = CohortConfig::with_backend(backend);
        config.jobs.resumption_file = dir.path().join("resume.jsonl");
        config.locking.grace_period = Duration::from_millis(5);
        config.locking.poll_interval = Duration::from_millis(1);
        config
    }

    #[tokio::test]
    async fn test_null_backend_runs_body_once() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);

        let report = Session::builder(config(&dir, BackendSpec::Null))
            .run(move |participant| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(participant.rank());
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.size, 1);
        assert_eq!(*calls.lock(), vec![0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_body_runs_on_every_worker() {
        let dir = TempDir::new().unwrap();
        let ranks = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&ranks);

        let report = Session::builder(config(&dir, BackendSpec::Local { processes: 4 }))
            .run(move |participant| {
                let seen = Arc::clone(&seen);
                async move {
                    participant.barrier().await?;
                    seen.lock().push(participant.rank());
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.size, 4);
        let mut ranks = ranks.lock().clone();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_panic_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = Session::builder(config(&dir, BackendSpec::Local { processes: 3 }))
            .run(|participant| async move {
                if participant.rank() == 2 {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinationError::WorkerPanicked { rank: 2, .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_start() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, BackendSpec::Local { processes: 2 });
        config.statistics.report_interval = Duration::ZERO;

        let err = Session::builder(config)
            .run(|_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
    }
}
