//! Background processing of slow-to-answer messages
//!
//! Messages registered with [`MessageRegistry::register_async`] are handed
//! from the coordinator's receive loop to a single background task, which
//! processes them in arrival order and sends any response itself.
//!
//! [`MessageRegistry::register_async`]: crate::message::MessageRegistry::register_async

use cohort_ipc::Frame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::datacache::SharedDataCache;
use crate::error::{CoordinationError, CoordinationResult};
use crate::message::Dispatch;
use crate::messenger::Messenger;

/// Work for the background task
#[derive(Debug)]
pub enum AsyncTask {
    Process(Frame),
    /// Finish everything queued before this, then exit
    Stop,
}

/// State owned by the background task
pub struct AsyncContext {
    pub messenger: Messenger,
    pub cache: SharedDataCache,
}

impl AsyncContext {
    pub fn new(messenger: Messenger, cache: SharedDataCache) -> Self {
        Self { messenger, cache }
    }

    async fn process(&mut self, frame: Frame) {
        let registry = std::sync::Arc::clone(self.messenger.registry());
        let entry = match registry.entry(frame.tag) {
            Ok(entry) => *entry,
            Err(err) => {
                warn!("Dropping frame from rank {}: {}", frame.source, err);
                return;
            }
        };

        let result = match entry.dispatch {
            Dispatch::Async(handler) => handler(frame.payload, frame.source, self).await,
            _ => Err(CoordinationError::NoHandler {
                kind: entry.kind.to_string(),
            }),
        };

        if let Err(err) = result {
            warn!(
                "Error processing {} from rank {}: {}",
                entry.kind, frame.source, err
            );
            if !entry.replies {
                return;
            }
            if let Err(send_err) = self
                .messenger
                .send_remote_error(&err, entry.kind, frame.source)
                .await
            {
                warn!("Unable to report error to rank {}: {}", frame.source, send_err);
            }
        }
    }
}

/// Handle on the background task
pub struct AsyncWorkerHandle {
    sender: mpsc::UnboundedSender<AsyncTask>,
    task: JoinHandle<()>,
}

impl AsyncWorkerHandle {
    /// Spawn the background task
    pub fn spawn(mut context: AsyncContext) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(
            async move {
                while let Some(task) = receiver.recv().await {
                    match task {
                        AsyncTask::Process(frame) => context.process(frame).await,
                        AsyncTask::Stop => break,
                    }
                }
                context.cache.shutdown();
                debug!("Async message worker stopped");
            }
            .in_current_span(),
        );
        Self { sender, task }
    }

    /// Queue a frame for processing
    pub fn submit(&self, frame: Frame) -> CoordinationResult<()> {
        self.sender
            .send(AsyncTask::Process(frame))
            .map_err(|_| CoordinationError::NoHandler {
                kind: "async task".to_string(),
            })
    }

    /// Drain queued work, stop the task and wait for it to exit
    pub async fn shutdown(self) -> CoordinationResult<()> {
        // the task may already have exited, in which case there is nothing to stop
        let _ = self.sender.send(AsyncTask::Stop);
        self.task
            .await
            .map_err(|err| CoordinationError::WorkerPanicked {
                rank: cohort_ipc::COORDINATOR_RANK,
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datacache::messages::{DatasetReady, ReleaseDataset, RequestDataset};
    use crate::message::{Message, MessageRegistry};
    use cohort_ipc::LocalTransport;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_failures_reported_to_requester() {
        let registry = Arc::new(MessageRegistry::new());
        let mut group = LocalTransport::group(2).into_iter();
        let coordinator = Messenger::new(Arc::new(group.next().unwrap()), Arc::clone(&registry));
        let worker = Messenger::new(Arc::new(group.next().unwrap()), Arc::clone(&registry));

        // no loader configured, so every dataset is unavailable
        let cache = SharedDataCache::new(None, None, "cohort");
        let handle = AsyncWorkerHandle::spawn(AsyncContext::new(coordinator, cache));

        let request = RequestDataset {
            name: "snap".to_string(),
            shared_memory: false,
        };
        handle
            .submit(Frame {
                source: 1,
                tag: registry.tag_of::<RequestDataset>().unwrap(),
                payload: request.encode().unwrap(),
            })
            .unwrap();
        handle.shutdown().await.unwrap();

        let (ready, _) = worker.receive::<DatasetReady>(Some(0)).await.unwrap();
        assert!(!ready.available);
    }

    #[tokio::test]
    async fn test_release_failure_not_sent_back() {
        let registry = Arc::new(MessageRegistry::new());
        let mut group = LocalTransport::group(2).into_iter();
        let coordinator = Messenger::new(Arc::new(group.next().unwrap()), Arc::clone(&registry));
        let worker = Messenger::new(Arc::new(group.next().unwrap()), Arc::clone(&registry));

        let handle = AsyncWorkerHandle::spawn(AsyncContext::new(
            coordinator,
            SharedDataCache::new(None, None, "cohort"),
        ));
        // rank 1 holds nothing, so the release fails
        handle
            .submit(Frame {
                source: 1,
                tag: registry.tag_of::<ReleaseDataset>().unwrap(),
                payload: ReleaseDataset.encode().unwrap(),
            })
            .unwrap();
        let request = RequestDataset {
            name: "snap".to_string(),
            shared_memory: false,
        };
        handle
            .submit(Frame {
                source: 1,
                tag: registry.tag_of::<RequestDataset>().unwrap(),
                payload: request.encode().unwrap(),
            })
            .unwrap();
        handle.shutdown().await.unwrap();

        // the next thing rank 1 sees is the answer to its request
        let (ready, _) = worker.receive::<DatasetReady>(Some(0)).await.unwrap();
        assert_eq!(ready.name, "snap");
        assert!(!ready.available);
    }

    #[tokio::test]
    async fn test_main_loop_messages_rejected() {
        let registry = Arc::new(MessageRegistry::new());
        let mut group = LocalTransport::group(2).into_iter();
        let coordinator = Messenger::new(Arc::new(group.next().unwrap()), Arc::clone(&registry));
        let worker = Messenger::new(Arc::new(group.next().unwrap()), Arc::clone(&registry));

        let handle = AsyncWorkerHandle::spawn(AsyncContext::new(
            coordinator,
            SharedDataCache::new(None, None, "cohort"),
        ));
        handle
            .submit(Frame {
                source: 1,
                tag: registry.tag_of::<crate::barrier::BarrierRequest>().unwrap(),
                payload: crate::barrier::BarrierRequest.encode().unwrap(),
            })
            .unwrap();
        handle.shutdown().await.unwrap();

        let err = worker.receive::<DatasetReady>(Some(0)).await.unwrap_err();
        assert!(err.is_remote());
    }
}
