//! Accumulative statistics
//!
//! Workers accumulate partial statistics locally and periodically send them
//! to the coordinator, which merges them into a single instance per
//! accumulator kind and reports the totals.

use std::collections::HashMap;

use async_trait::async_trait;
use cohort_ipc::{Rank, COORDINATOR_RANK};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoordinationError, CoordinationResult};
use crate::message::{Handle, Message, Request};
use crate::messenger::Messenger;
use crate::server::Server;

/// Mergeable statistics
pub trait Accumulator:
    Serialize + DeserializeOwned + Default + Clone + PartialEq + Send + Sync + 'static
{
    /// Stable name of the accumulator kind
    const KIND: &'static str;

    /// Merge another partial result into this one; must be associative
    fn add(&mut self, other: &Self);

    /// Human readable summary
    fn report(&self) -> String;
}

pub(crate) trait ErasedAccumulator: Send + Sync {
    fn kind(&self) -> &'static str;
    fn add_value(&mut self, partial: serde_json::Value) -> CoordinationResult<()>;
    fn report(&self) -> String;
}

struct Slot<A>(A);

impl<A: Accumulator> ErasedAccumulator for Slot<A> {
    fn kind(&self) -> &'static str {
        A::KIND
    }

    fn add_value(&mut self, partial: serde_json::Value) -> CoordinationResult<()> {
        let partial: A = serde_json::from_value(partial)?;
        self.0.add(&partial);
        Ok(())
    }

    fn report(&self) -> String {
        self.0.report()
    }
}

pub(crate) type AccumulatorFactory = fn() -> Box<dyn ErasedAccumulator>;

pub(crate) fn factory<A: Accumulator>() -> Box<dyn ErasedAccumulator> {
    Box::new(Slot(A::default()))
}

struct TableEntry {
    accumulator: Box<dyn ErasedAccumulator>,
    changed: bool,
}

/// Coordinator-side accumulators, one per kind, addressed by id
#[derive(Default)]
pub struct AccumulatorTable {
    entries: Vec<TableEntry>,
    by_kind: HashMap<&'static str, usize>,
}

impl AccumulatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&mut self, factory: AccumulatorFactory) -> usize {
        let accumulator = factory();
        let kind = accumulator.kind();
        if let Some(&id) = self.by_kind.get(kind) {
            return id;
        }
        let id = self.entries.len();
        self.entries.push(TableEntry {
            accumulator,
            changed: false,
        });
        self.by_kind.insert(kind, id);
        debug!("Created accumulator {} with id {}", kind, id);
        id
    }

    pub fn accumulate(&mut self, id: usize, partial: serde_json::Value) -> CoordinationResult<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(CoordinationError::UnknownAccumulatorId { id })?;
        entry.accumulator.add_value(partial)?;
        entry.changed = true;
        Ok(())
    }

    /// Log every accumulator that changed since the last report
    pub fn report_changed(&mut self) {
        for entry in self.entries.iter_mut().filter(|entry| entry.changed) {
            info!("{}", entry.accumulator.report());
            entry.changed = false;
        }
    }

    /// Final state of every accumulator. Only states not yet logged by a
    /// periodic report are logged here.
    pub fn report_final(&mut self) -> Vec<String> {
        self.report_changed();
        self.entries
            .iter()
            .map(|entry| entry.accumulator.report())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Target<A> {
    Local { last_reported: Option<A> },
    Remote { messenger: Messenger, id: usize },
}

/// Process-local handle on an accumulator of kind `A`
pub struct StatisticsAccumulator<A: Accumulator> {
    state: A,
    target: Target<A>,
}

impl<A: Accumulator> StatisticsAccumulator<A> {
    /// Accumulator that reports by logging on this process
    pub fn local() -> Self {
        Self {
            state: A::default(),
            target: Target::Local {
                last_reported: None,
            },
        }
    }

    /// Register with the coordinator; every worker must do this for the same
    /// kind before any of them proceeds
    pub(crate) async fn register(messenger: Messenger) -> CoordinationResult<Self> {
        let created = messenger
            .request(
                &CreateAccumulator {
                    kind: A::KIND.to_string(),
                },
                COORDINATOR_RANK,
            )
            .await?;
        Ok(Self {
            state: A::default(),
            target: Target::Remote {
                messenger,
                id: created.id,
            },
        })
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut A {
        &mut self.state
    }

    pub fn add(&mut self, partial: &A) {
        self.state.add(partial);
    }

    /// Send the partial state to the coordinator and reset it, or log it if
    /// it changed since the last local report
    pub async fn report(&mut self) -> CoordinationResult<()> {
        match &mut self.target {
            Target::Remote { messenger, id } => {
                if self.state == A::default() {
                    return Ok(());
                }
                let partial = serde_json::to_value(&self.state)?;
                messenger
                    .send(&AccumulateStatistics { id: *id, partial }, COORDINATOR_RANK)
                    .await?;
                self.state = A::default();
            }
            Target::Local { last_reported } => {
                if last_reported.as_ref() != Some(&self.state) {
                    info!("{}", self.state.report());
                    *last_reported = Some(self.state.clone());
                }
            }
        }
        Ok(())
    }
}

/// Collective request for the id of an accumulator kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAccumulator {
    pub kind: String,
}

impl Message for CreateAccumulator {
    const KIND: &'static str = "create_accumulator";
}

impl Request for CreateAccumulator {
    type Response = AccumulatorCreated;
}

#[async_trait]
impl Handle for CreateAccumulator {
    async fn handle(self, source: Rank, server: &mut Server) -> CoordinationResult<()> {
        let factory = server.messenger().registry().accumulator_factory(&self.kind)?;
        if let Some((_, ranks)) = server.gather_consistent(source, self)? {
            let id = server.accumulators_mut().create(factory);
            for rank in ranks {
                server
                    .messenger()
                    .respond::<CreateAccumulator>(&AccumulatorCreated { id }, rank)
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorCreated {
    pub id: usize,
}

impl Message for AccumulatorCreated {
    const KIND: &'static str = "accumulator_created";
}

/// Partial state to merge into accumulator `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulateStatistics {
    pub id: usize,
    pub partial: serde_json::Value,
}

impl Message for AccumulateStatistics {
    const KIND: &'static str = "accumulate_statistics";
}

#[async_trait]
impl Handle for AccumulateStatistics {
    const REPLIES: bool = false;

    async fn handle(self, _source: Rank, server: &mut Server) -> CoordinationResult<()> {
        server.accumulators_mut().accumulate(self.id, self.partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Timings {
        calls: u64,
        seconds: f64,
    }

    impl Accumulator for Timings {
        const KIND: &'static str = "timings";

        fn add(&mut self, other: &Self) {
            self.calls += other.calls;
            self.seconds += other.seconds;
        }

        fn report(&self) -> String {
            format!("{} calls in {:.1}s", self.calls, self.seconds)
        }
    }

    #[test]
    fn test_one_instance_per_kind() {
        let mut table = AccumulatorTable::new();
        let first = table.create(factory::<Timings>);
        let second = table.create(factory::<Timings>);
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_accumulate_merges_partials() {
        let mut table = AccumulatorTable::new();
        let id = table.create(factory::<Timings>);

        for seconds in [1.0, 2.5] {
            let partial = serde_json::to_value(Timings { calls: 2, seconds }).unwrap();
            table.accumulate(id, partial).unwrap();
        }

        assert_eq!(table.report_final(), vec!["4 calls in 3.5s".to_string()]);
        assert!(matches!(
            table.accumulate(9, serde_json::Value::Null),
            Err(CoordinationError::UnknownAccumulatorId { id: 9 })
        ));
        assert!(matches!(
            table.accumulate(id, serde_json::json!("garbage")),
            Err(CoordinationError::Codec(_))
        ));
    }

    fn unreported(table: &AccumulatorTable) -> usize {
        table.entries.iter().filter(|entry| entry.changed).count()
    }

    #[test]
    fn test_final_report_skips_logged_states() {
        let mut table = AccumulatorTable::new();
        let id = table.create(factory::<Timings>);
        let partial = serde_json::to_value(Timings {
            calls: 1,
            seconds: 1.0,
        })
        .unwrap();
        table.accumulate(id, partial).unwrap();
        assert_eq!(unreported(&table), 1);

        table.report_changed();
        assert_eq!(unreported(&table), 0);

        // already logged, but still part of the final result
        assert_eq!(table.report_final(), vec!["1 calls in 1.0s".to_string()]);
        assert_eq!(unreported(&table), 0);
    }

    #[tokio::test]
    async fn test_local_accumulator() {
        let mut accumulator = StatisticsAccumulator::<Timings>::local();
        accumulator.add(&Timings {
            calls: 1,
            seconds: 0.5,
        });
        accumulator.state_mut().calls += 1;
        accumulator.report().await.unwrap();
        accumulator.report().await.unwrap();
        assert_eq!(accumulator.state().calls, 2);
    }
}
