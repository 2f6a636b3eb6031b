//! Coordinator-resident cache of one dataset at a time

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use cohort_ipc::{Rank, SegmentTable};
use tracing::{debug, info, warn};

use super::array::{ArrayData, SharedArrayHandle};
use crate::error::{CoordinationError, CoordinationResult};

/// A named collection of arrays
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub name: String,
    pub arrays: HashMap<String, ArrayData>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arrays: HashMap::new(),
        }
    }

    pub fn with_array(mut self, name: impl Into<String>, array: ArrayData) -> Self {
        self.arrays.insert(name.into(), array);
        self
    }
}

/// Source of datasets for the cache
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn load(&self, name: &str) -> CoordinationResult<Dataset>;
}

/// Notification that a queued or immediate request can be answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub rank: Rank,
    pub name: String,
    pub available: bool,
}

struct Resident {
    dataset: Dataset,
    /// Holders and whether each asked for shared memory
    holders: BTreeMap<Rank, bool>,
    published: Vec<String>,
}

/// Reference-counted cache holding at most one dataset.
///
/// Requests for another dataset queue behind the resident one; the resident
/// dataset is evicted when its last holder releases it, and the next queued
/// dataset is then loaded for every rank that asked for it.
pub struct SharedDataCache {
    loader: Option<Arc<dyn DatasetLoader>>,
    segments: Option<Arc<SegmentTable>>,
    prefix: String,
    current: Option<Resident>,
    queue: VecDeque<(String, Vec<(Rank, bool)>)>,
    load_count: usize,
}

impl SharedDataCache {
    pub fn new(
        loader: Option<Arc<dyn DatasetLoader>>,
        segments: Option<Arc<SegmentTable>>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            segments,
            prefix: prefix.into(),
            current: None,
            queue: VecDeque::new(),
            load_count: 0,
        }
    }

    /// Name of the resident dataset
    pub fn current(&self) -> Option<&str> {
        self.current
            .as_ref()
            .map(|resident| resident.dataset.name.as_str())
    }

    /// Number of loads performed so far
    pub fn load_count(&self) -> usize {
        self.load_count
    }

    pub fn holders(&self) -> Vec<Rank> {
        self.current
            .as_ref()
            .map(|resident| resident.holders.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Ask for access to dataset `name` on behalf of `rank`
    pub async fn request(&mut self, name: &str, rank: Rank, shared_memory: bool) -> Vec<Availability> {
        if let Some(resident) = self.current.as_mut() {
            if resident.dataset.name == name {
                resident.holders.insert(rank, shared_memory);
                debug!("Rank {} joins holders of resident dataset {}", rank, name);
                return vec![Availability {
                    rank,
                    name: name.to_string(),
                    available: true,
                }];
            }
        }

        match self.queue.iter_mut().find(|(queued, _)| queued == name) {
            Some((_, ranks)) => ranks.push((rank, shared_memory)),
            None => self
                .queue
                .push_back((name.to_string(), vec![(rank, shared_memory)])),
        }
        self.load_next_if_free().await
    }

    /// Drop `rank`'s hold on the resident dataset
    pub async fn release(&mut self, rank: Rank) -> CoordinationResult<Vec<Availability>> {
        let resident = self
            .current
            .as_mut()
            .ok_or(CoordinationError::DatasetNotHeld { rank })?;
        if resident.holders.remove(&rank).is_none() {
            return Err(CoordinationError::DatasetNotHeld { rank });
        }

        if resident.holders.is_empty() {
            self.evict();
            return Ok(self.load_next_if_free().await);
        }
        Ok(Vec::new())
    }

    /// Rows of an array of the resident dataset, for `rank`.
    ///
    /// When `rank` asked for shared memory and segments are available, the
    /// array is published once and a handle to the requested rows is returned
    /// alongside the data.
    pub fn array(
        &mut self,
        rank: Rank,
        name: &str,
        rows: Option<Range<usize>>,
    ) -> CoordinationResult<(ArrayData, Option<SharedArrayHandle>)> {
        let resident = self
            .current
            .as_mut()
            .ok_or(CoordinationError::DatasetNotHeld { rank })?;
        let shared_memory = *resident
            .holders
            .get(&rank)
            .ok_or(CoordinationError::DatasetNotHeld { rank })?;
        let array = resident
            .dataset
            .arrays
            .get(name)
            .ok_or_else(|| CoordinationError::ArrayNotFound {
                dataset: resident.dataset.name.clone(),
                name: name.to_string(),
            })?;

        let (data, offset) = match rows {
            Some(rows) => {
                let offset = array.row_byte_range(&rows)?.start;
                (array.slice_rows(rows)?, offset)
            }
            None => (array.clone(), 0),
        };

        let segments = match (&self.segments, shared_memory) {
            (Some(segments), true) => segments,
            _ => return Ok((data, None)),
        };

        let segment = format!("{}:{}:{}", self.prefix, resident.dataset.name, name);
        if !resident.published.contains(&segment) {
            segments.publish(segment.clone(), array.bytes().clone());
            resident.published.push(segment.clone());
        }
        let handle = SharedArrayHandle {
            segment,
            shape: data.shape().to_vec(),
            dtype: data.dtype(),
            offset,
        };
        Ok((data, Some(handle)))
    }

    /// Evict the resident dataset regardless of holders
    pub fn shutdown(&mut self) {
        self.evict();
        self.queue.clear();
    }

    fn evict(&mut self) {
        if let Some(resident) = self.current.take() {
            if let Some(segments) = &self.segments {
                for segment in &resident.published {
                    segments.remove(segment);
                }
            }
            info!("Evicted dataset {}", resident.dataset.name);
        }
    }

    async fn load_next_if_free(&mut self) -> Vec<Availability> {
        let mut notifications = Vec::new();
        while self.current.is_none() {
            let (name, ranks) = match self.queue.pop_front() {
                Some(next) => next,
                None => break,
            };

            match self.load(&name).await {
                Ok(dataset) => {
                    self.load_count += 1;
                    info!("Loaded dataset {} for ranks {:?}", name, ranks);
                    notifications.extend(ranks.iter().map(|&(rank, _)| Availability {
                        rank,
                        name: name.clone(),
                        available: true,
                    }));
                    self.current = Some(Resident {
                        dataset,
                        holders: ranks.into_iter().collect(),
                        published: Vec::new(),
                    });
                }
                Err(err) => {
                    warn!("Unable to load dataset {}: {}", name, err);
                    notifications.extend(ranks.into_iter().map(|(rank, _)| Availability {
                        rank,
                        name: name.clone(),
                        available: false,
                    }));
                }
            }
        }
        notifications
    }

    async fn load(&self, name: &str) -> CoordinationResult<Dataset> {
        match &self.loader {
            Some(loader) => loader.load(name).await,
            None => Err(CoordinationError::DatasetUnavailable {
                name: name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CountingLoader {
        loads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DatasetLoader for CountingLoader {
        async fn load(&self, name: &str) -> CoordinationResult<Dataset> {
            if name == "missing" {
                return Err(CoordinationError::DatasetUnavailable {
                    name: name.to_string(),
                });
            }
            self.loads.lock().push(name.to_string());
            let values: Vec<f64> = (0..6).map(|v| v as f64).collect();
            Ok(Dataset::new(name).with_array("pos", ArrayData::from_f64(vec![3, 2], &values)?))
        }
    }

    fn cache(segments: Option<Arc<SegmentTable>>) -> (SharedDataCache, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            loads: Mutex::new(Vec::new()),
        });
        let dyn_loader: Arc<dyn DatasetLoader> = loader.clone();
        (SharedDataCache::new(Some(dyn_loader), segments, "cohort"), loader)
    }

    fn ranks(notifications: &[Availability]) -> Vec<Rank> {
        notifications.iter().map(|n| n.rank).collect()
    }

    #[tokio::test]
    async fn test_same_name_loads_once() {
        let (mut cache, loader) = cache(None);
        assert_eq!(ranks(&cache.request("snap", 1, false).await), vec![1]);
        assert_eq!(ranks(&cache.request("snap", 2, false).await), vec![2]);
        assert_eq!(cache.load_count(), 1);
        assert_eq!(cache.holders(), vec![1, 2]);
        assert_eq!(loader.loads.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ordered_hand_off() {
        let (mut cache, _) = cache(None);
        cache.request("a", 1, false).await;
        assert!(cache.request("b", 2, false).await.is_empty());
        assert!(cache.request("b", 3, false).await.is_empty());
        cache.request("a", 4, false).await;

        assert!(cache.release(1).await.unwrap().is_empty());
        assert_eq!(cache.current(), Some("a"));

        let handed = cache.release(4).await.unwrap();
        assert_eq!(ranks(&handed), vec![2, 3]);
        assert!(handed.iter().all(|n| n.available && n.name == "b"));
        assert_eq!(cache.current(), Some("b"));
        assert_eq!(cache.load_count(), 2);

        assert!(matches!(
            cache.release(1).await,
            Err(CoordinationError::DatasetNotHeld { rank: 1 })
        ));
    }

    #[tokio::test]
    async fn test_failed_load_moves_on() {
        let (mut cache, _) = cache(None);
        cache.request("a", 1, false).await;
        cache.request("missing", 2, false).await;
        cache.request("c", 3, false).await;

        let handed = cache.release(1).await.unwrap();
        assert_eq!(
            handed,
            vec![
                Availability {
                    rank: 2,
                    name: "missing".to_string(),
                    available: false
                },
                Availability {
                    rank: 3,
                    name: "c".to_string(),
                    available: true
                },
            ]
        );
        assert_eq!(cache.current(), Some("c"));
    }

    #[tokio::test]
    async fn test_shared_memory_publishes_until_eviction() {
        let segments = Arc::new(SegmentTable::new());
        let (mut cache, _) = cache(Some(Arc::clone(&segments)));
        cache.request("snap", 1, true).await;
        cache.request("snap", 2, false).await;

        let (data, handle) = cache.array(1, "pos", Some(1..3)).unwrap();
        let handle = handle.unwrap();
        assert_eq!(data.to_f64_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(handle.offset, 16);
        assert_eq!(handle.segment, "cohort:snap:pos");
        assert_eq!(segments.len(), 1);

        let (_, copied) = cache.array(2, "pos", None).unwrap();
        assert!(copied.is_none());
        assert!(matches!(
            cache.array(2, "vel", None),
            Err(CoordinationError::ArrayNotFound { .. })
        ));

        cache.release(1).await.unwrap();
        cache.release(2).await.unwrap();
        assert!(segments.is_empty());
        assert_eq!(cache.current(), None);
    }
}
