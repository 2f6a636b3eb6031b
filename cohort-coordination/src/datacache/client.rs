//! Requester side of the shared data cache

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cohort_ipc::COORDINATOR_RANK;
use tokio::sync::Mutex;

use super::array::ArrayData;
use super::cache::SharedDataCache;
use super::messages::{ReleaseDataset, RequestArray, RequestDataset};
use super::transfer::receive_array;
use crate::error::{CoordinationError, CoordinationResult};
use crate::messenger::Messenger;

enum Backend {
    Remote(Messenger),
    Local(Arc<Mutex<SharedDataCache>>),
}

/// Access to the dataset currently served by the coordinator.
///
/// The connection must be released explicitly; until then the dataset
/// stays resident and other datasets queue behind it.
pub struct DatasetConnection {
    name: String,
    backend: Backend,
    open: Arc<AtomicBool>,
    released: bool,
}

fn claim(open: &AtomicBool, name: &str) -> CoordinationResult<()> {
    if open.swap(true, Ordering::AcqRel) {
        return Err(CoordinationError::ConnectionActive {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl DatasetConnection {
    pub(crate) async fn open_remote(
        messenger: Messenger,
        open: Arc<AtomicBool>,
        name: &str,
        shared_memory: bool,
    ) -> CoordinationResult<Self> {
        claim(&open, name)?;

        let ready = messenger
            .request(
                &RequestDataset {
                    name: name.to_string(),
                    shared_memory,
                },
                COORDINATOR_RANK,
            )
            .await;
        let ready = match ready {
            Ok(ready) if ready.available => ready,
            Ok(_) => {
                open.store(false, Ordering::Release);
                return Err(CoordinationError::DatasetUnavailable {
                    name: name.to_string(),
                });
            }
            Err(err) => {
                open.store(false, Ordering::Release);
                return Err(err);
            }
        };

        Ok(Self {
            name: ready.name,
            backend: Backend::Remote(messenger),
            open,
            released: false,
        })
    }

    pub(crate) async fn open_local(
        cache: Arc<Mutex<SharedDataCache>>,
        open: Arc<AtomicBool>,
        name: &str,
    ) -> CoordinationResult<Self> {
        claim(&open, name)?;
        let notifications = cache
            .lock()
            .await
            .request(name, COORDINATOR_RANK, false)
            .await;
        match notifications.iter().find(|n| n.rank == COORDINATOR_RANK) {
            Some(notification) if notification.available => Ok(Self {
                name: name.to_string(),
                backend: Backend::Local(cache),
                open,
                released: false,
            }),
            _ => {
                open.store(false, Ordering::Release);
                Err(CoordinationError::DatasetUnavailable {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Name of the connected dataset
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch an array, or the half-open `rows` of its first axis
    pub async fn array(&self, array: &str, rows: Option<Range<usize>>) -> CoordinationResult<ArrayData> {
        match &self.backend {
            Backend::Remote(messenger) => {
                messenger
                    .send(
                        &RequestArray {
                            array: array.to_string(),
                            rows: rows.map(|rows| (rows.start, rows.end)),
                        },
                        COORDINATOR_RANK,
                    )
                    .await?;
                receive_array(messenger, COORDINATOR_RANK).await
            }
            Backend::Local(cache) => {
                let (data, _) = cache.lock().await.array(COORDINATOR_RANK, array, rows)?;
                Ok(data)
            }
        }
    }

    /// Give up access so the dataset can be evicted
    pub async fn release(mut self) -> CoordinationResult<()> {
        self.released = true;
        let released = match &self.backend {
            Backend::Remote(messenger) => messenger.send(&ReleaseDataset, COORDINATOR_RANK).await,
            Backend::Local(cache) => cache
                .lock()
                .await
                .release(COORDINATOR_RANK)
                .await
                .map(|_| ()),
        };
        self.open.store(false, Ordering::Release);
        released
    }
}

impl Drop for DatasetConnection {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("Dataset connection to {} dropped without release", self.name);
        }
    }
}
