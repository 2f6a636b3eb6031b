//! Worker barrier arbitrated by the coordinator

use async_trait::async_trait;
use cohort_ipc::Rank;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoordinationResult;
use crate::message::{Handle, Message, Request};
use crate::server::Server;

/// Sent by a worker that has reached the barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierRequest;

impl Message for BarrierRequest {
    const KIND: &'static str = "barrier_request";
}

impl Request for BarrierRequest {
    type Response = BarrierRelease;
}

/// Sent to every worker once all of them have reached the barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierRelease;

impl Message for BarrierRelease {
    const KIND: &'static str = "barrier_release";
}

#[async_trait]
impl Handle for BarrierRequest {
    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        if let Some((_, ranks)) = server.gather_consistent(source, self)? {
            debug!("Releasing barrier for ranks {:?}", ranks);
            for rank in ranks {
                server
                    .messenger()
                    .respond::<BarrierRequest>(&BarrierRelease, rank)
                    .await?;
            }
        }
        Ok(())
    }
}
