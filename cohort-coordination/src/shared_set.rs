//! Session-wide sets of strings, used to claim work items exactly once

use async_trait::async_trait;
use cohort_ipc::{Rank, COORDINATOR_RANK};
use serde::{Deserialize, Serialize};

use crate::error::CoordinationResult;
use crate::message::{Handle, Message, Request};
use crate::roles::Participant;
use crate::server::Server;

/// Add a value to the named set held by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedSetAdd {
    pub set_id: String,
    pub value: String,
}

impl Message for SharedSetAdd {
    const KIND: &'static str = "shared_set_add";
}

impl Request for SharedSetAdd {
    type Response = SharedSetResult;
}

#[async_trait]
impl Handle for SharedSetAdd {
    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        let already_present = !server.shared().insert_into_set(&self.set_id, self.value);
        server
            .messenger()
            .respond::<SharedSetAdd>(&SharedSetResult { already_present }, source)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedSetResult {
    pub already_present: bool,
}

impl Message for SharedSetResult {
    const KIND: &'static str = "shared_set_result";
}

/// Handle on a named set shared by every process of the session
pub struct SharedSet {
    participant: Participant,
    set_id: String,
}

impl SharedSet {
    pub(crate) fn new(participant: Participant, set_id: impl Into<String>) -> Self {
        Self {
            participant,
            set_id: set_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.set_id
    }

    /// Add `value` atomically, returning `true` if it was already present
    pub async fn add_if_absent(&self, value: impl Into<String>) -> CoordinationResult<bool> {
        let value = value.into();
        match &self.participant {
            Participant::Coordinator(role) => {
                Ok(!role.shared().insert_into_set(&self.set_id, value))
            }
            Participant::Worker(role) => {
                let result = role
                    .messenger()
                    .request(
                        &SharedSetAdd {
                            set_id: self.set_id.clone(),
                            value,
                        },
                        COORDINATOR_RANK,
                    )
                    .await?;
                Ok(result.already_present)
            }
        }
    }
}
