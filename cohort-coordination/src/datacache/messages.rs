//! Data cache messages, all processed by the async background worker

use async_trait::async_trait;
use cohort_ipc::Rank;
use serde::{Deserialize, Serialize};

use super::cache::Availability;
use super::transfer::send_array;
use crate::async_processing::AsyncContext;
use crate::error::CoordinationResult;
use crate::message::{HandleAsync, Message, Request};
use crate::messenger::Messenger;

async fn notify(messenger: &Messenger, notifications: Vec<Availability>) -> CoordinationResult<()> {
    for notification in notifications {
        messenger
            .send(
                &DatasetReady {
                    name: notification.name,
                    available: notification.available,
                },
                notification.rank,
            )
            .await?;
    }
    Ok(())
}

/// Ask for access to a dataset; answered once it is resident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDataset {
    pub name: String,
    pub shared_memory: bool,
}

impl Message for RequestDataset {
    const KIND: &'static str = "request_dataset";
}

impl Request for RequestDataset {
    type Response = DatasetReady;
}

#[async_trait]
impl HandleAsync for RequestDataset {
    async fn handle_async(
        self,
        source: Rank,
        context: &mut AsyncContext,
    ) -> CoordinationResult<()> {
        let notifications = context
            .cache
            .request(&self.name, source, self.shared_memory)
            .await;
        notify(&context.messenger, notifications).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetReady {
    pub name: String,
    pub available: bool,
}

impl Message for DatasetReady {
    const KIND: &'static str = "dataset_ready";
}

/// Give up access to the resident dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDataset;

impl Message for ReleaseDataset {
    const KIND: &'static str = "release_dataset";
}

#[async_trait]
impl HandleAsync for ReleaseDataset {
    const REPLIES: bool = false;

    async fn handle_async(
        self,
        source: Rank,
        context: &mut AsyncContext,
    ) -> CoordinationResult<()> {
        let notifications = context.cache.release(source).await?;
        notify(&context.messenger, notifications).await
    }
}

/// Ask for (rows of) an array of the resident dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestArray {
    pub array: String,
    /// Half-open row range along the first axis, or the whole array
    pub rows: Option<(usize, usize)>,
}

impl Message for RequestArray {
    const KIND: &'static str = "request_array";
}

#[async_trait]
impl HandleAsync for RequestArray {
    async fn handle_async(
        self,
        source: Rank,
        context: &mut AsyncContext,
    ) -> CoordinationResult<()> {
        let rows = self.rows.map(|(start, end)| start..end);
        let (data, handle) = context.cache.array(source, &self.array, rows)?;
        send_array(&context.messenger, &data, source, handle).await
    }
}
