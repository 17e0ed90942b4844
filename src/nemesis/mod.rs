//! Fault injection
//!
//! The [`FaultInjector`] is the participant bound to [`Process::Nemesis`]. It
//! pulls faults from its own slice of the generator, records each one as an
//! invoke/completion pair, and performs it through a [`Nemesis`] control
//! plane. Whatever is still broken when the active phase ends is healed before
//! the teardown barrier.

pub mod docker;

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessFault, HarnessWarning, HistoryError, NemesisError};
use crate::history::{Action, EventKind, Operation, Process, Value};
use crate::phase::Phase;
use crate::worker::{next_action, ParticipantReport, Participants};

/// A control-plane action
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Fault {
    /// Split the cluster; nodes only talk within their own group
    Partition { groups: Vec<Vec<String>> },
    /// Remove every partition
    Heal,
    /// Kill the database process on a node
    Kill { node: String },
    /// Start a previously killed node
    Restart { node: String },
    /// Shift a node's clock by `offset_ms`
    ClockSkew { node: String, offset_ms: i64 },
    /// Put a node's clock back
    ResetClock { node: String },
}

impl Fault {
    /// The fault that undoes this one, `None` if this one is itself healing
    pub fn heal(&self) -> Option<Fault> {
        match self {
            Fault::Partition { .. } => Some(Fault::Heal),
            Fault::Kill { node } => Some(Fault::Restart { node: node.clone() }),
            Fault::ClockSkew { node, .. } => Some(Fault::ResetClock { node: node.clone() }),
            Fault::Heal | Fault::Restart { .. } | Fault::ResetClock { .. } => None,
        }
    }

    pub fn is_healing(&self) -> bool {
        self.heal().is_none()
    }

    /// Split `nodes` into a minority and a majority
    pub fn majority_partition(nodes: &[String]) -> Fault {
        let minority = nodes.len().saturating_sub(1) / 2;
        Fault::Partition {
            groups: vec![nodes[..minority].to_vec(), nodes[minority..].to_vec()],
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Partition { groups } => {
                let groups: Vec<String> = groups.iter().map(|g| g.join(",")).collect();
                write!(f, "partition {}", groups.join(" | "))
            }
            Fault::Heal => write!(f, "heal"),
            Fault::Kill { node } => write!(f, "kill {}", node),
            Fault::Restart { node } => write!(f, "restart {}", node),
            Fault::ClockSkew { node, offset_ms } => write!(f, "skew {} by {}ms", node, offset_ms),
            Fault::ResetClock { node } => write!(f, "reset clock {}", node),
        }
    }
}

/// Control plane that carries out faults against the system under test
#[async_trait]
pub trait Nemesis: Send {
    async fn setup(&mut self, _nodes: &[String]) -> Result<(), NemesisError> {
        Ok(())
    }

    /// Perform one fault; the returned value is recorded on the completion
    async fn invoke(&mut self, fault: &Fault) -> Result<Option<Value>, NemesisError>;

    async fn teardown(&mut self) -> Result<(), NemesisError> {
        Ok(())
    }
}

/// Nemesis that acknowledges every fault and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNemesis;

#[async_trait]
impl Nemesis for NoopNemesis {
    async fn invoke(&mut self, _fault: &Fault) -> Result<Option<Value>, NemesisError> {
        Ok(None)
    }
}

/// Faults currently in effect, as far as the injector knows
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FaultLedger {
    partitioned: bool,
    killed: BTreeSet<String>,
    skewed: BTreeSet<String>,
}

impl FaultLedger {
    /// Account for a fault that completed with `outcome`
    ///
    /// A disruptive fault counts as active unless it definitely failed. A
    /// healing fault only clears the ledger when it definitely succeeded.
    pub fn apply(&mut self, fault: &Fault, outcome: EventKind) {
        match (fault, outcome) {
            (_, EventKind::Invoke) => {}
            (Fault::Partition { .. }, EventKind::Ok | EventKind::Info) => self.partitioned = true,
            (Fault::Kill { node }, EventKind::Ok | EventKind::Info) => {
                self.killed.insert(node.clone());
            }
            (Fault::ClockSkew { node, .. }, EventKind::Ok | EventKind::Info) => {
                self.skewed.insert(node.clone());
            }
            (Fault::Heal, EventKind::Ok) => self.partitioned = false,
            (Fault::Restart { node }, EventKind::Ok) => {
                self.killed.remove(node);
            }
            (Fault::ResetClock { node }, EventKind::Ok) => {
                self.skewed.remove(node);
            }
            _ => {}
        }
    }

    /// Healing faults for everything still in effect
    pub fn outstanding_heals(&self) -> Vec<Fault> {
        let mut heals = Vec::new();
        if self.partitioned {
            heals.push(Fault::Heal);
        }
        heals.extend(self.killed.iter().map(|node| Fault::Restart { node: node.clone() }));
        heals.extend(self.skewed.iter().map(|node| Fault::ResetClock { node: node.clone() }));
        heals
    }

    pub fn is_clear(&self) -> bool {
        self.outstanding_heals().is_empty()
    }
}

/// The fault-injection participant
pub struct FaultInjector {
    nemesis: Box<dyn Nemesis>,
    nodes: Vec<String>,
    shared: Participants,
    ledger: FaultLedger,
}

impl FaultInjector {
    pub fn new(nemesis: Box<dyn Nemesis>, nodes: Vec<String>, shared: Participants) -> Self {
        FaultInjector {
            nemesis,
            nodes,
            shared,
            ledger: FaultLedger::default(),
        }
    }

    /// Run the injector through setup, active, teardown and into analyzing
    pub async fn run(mut self) -> ParticipantReport {
        let mut report = ParticipantReport::default();
        let barrier = self.shared.barrier.clone();

        let timeout = self.shared.op_timeout;
        let ready = match tokio::time::timeout(timeout, self.nemesis.setup(&self.nodes)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("nemesis setup failed: {}", e);
                report.faults.push(HarnessFault::NemesisUnavailable {
                    reason: e.to_string(),
                });
                false
            }
            Err(_) => {
                tracing::error!("nemesis setup stalled past {:?}", timeout);
                report.faults.push(HarnessFault::Stalled {
                    process: Process::Nemesis,
                    stage: "nemesis setup".to_string(),
                });
                false
            }
        };

        barrier.wait(Phase::Active).await;

        if ready {
            if let Err(e) = self.active(&mut report).await {
                self.shared.abort.trigger("nemesis hit a harness fault");
                report.faults.push(invariant(e));
            }
            if let Err(e) = self.heal_all(&mut report).await {
                report.faults.push(invariant(e));
            }
        }

        barrier.wait(Phase::Teardown).await;

        if ready {
            match tokio::time::timeout(timeout, self.nemesis.teardown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => report.warnings.push(HarnessWarning::NemesisTeardown {
                    reason: e.to_string(),
                }),
                Err(_) => {
                    tracing::error!("nemesis teardown stalled past {:?}", timeout);
                    report.faults.push(HarnessFault::Stalled {
                        process: Process::Nemesis,
                        stage: "nemesis teardown".to_string(),
                    });
                }
            }
        }

        barrier.wait(Phase::Analyzing).await;
        report
    }

    async fn active(&mut self, report: &mut ParticipantReport) -> Result<(), HistoryError> {
        let phase = self.shared.barrier.watch();
        let mut last: Option<Operation> = None;

        loop {
            let action = next_action(
                self.shared.generator.as_ref(),
                &self.shared.history,
                &phase,
                &self.shared.abort,
                Process::Nemesis,
                last.as_ref(),
            )
            .await;

            match action {
                Some(Action::Fault { fault }) => {
                    report.invocations += 1;
                    last = Some(self.perform(fault).await?);
                }
                Some(other) => {
                    tracing::warn!(action = %other, "nemesis was handed a client action, stopping");
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Heal whatever the ledger says is still broken
    async fn heal_all(&mut self, report: &mut ParticipantReport) -> Result<(), HistoryError> {
        if self.ledger.is_clear() {
            return Ok(());
        }
        for heal in self.ledger.outstanding_heals() {
            tracing::info!(fault = %heal, "healing before teardown");
            let completion = self.perform(heal.clone()).await?;
            if completion.kind != EventKind::Ok {
                report.warnings.push(HarnessWarning::Unhealed {
                    fault: heal.to_string(),
                    reason: completion.error.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    /// Record, perform and record the outcome of one fault
    async fn perform(&mut self, fault: Fault) -> Result<Operation, HistoryError> {
        let action = Action::Fault {
            fault: fault.clone(),
        };
        let history = &self.shared.history;
        history.record(Operation::invoke(Process::Nemesis, action.clone()))?;

        let outcome = tokio::time::timeout(self.shared.op_timeout, self.nemesis.invoke(&fault)).await;
        let completion = match outcome {
            Ok(Ok(value)) => Operation::ok(Process::Nemesis, action, value),
            Ok(Err(e @ (NemesisError::Unsupported(_) | NemesisError::UnknownNode(_)))) => {
                Operation::fail(Process::Nemesis, action, e.to_string())
            }
            Ok(Err(e)) => Operation::info(Process::Nemesis, action, e.to_string()),
            Err(_) => Operation::info(Process::Nemesis, action, "fault action timed out"),
        };
        tracing::info!(fault = %fault, kind = ?completion.kind, "nemesis");
        self.ledger.apply(&fault, completion.kind);

        Ok(history.record(completion)?.op)
    }
}

fn invariant(e: HistoryError) -> HarnessFault {
    tracing::error!("history rejected nemesis event: {}", e);
    HarnessFault::HistoryInvariant {
        process: Process::Nemesis,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{self, GeneratorExt};
    use crate::history::HistoryLog;
    use crate::phase::{AbortSignal, PhaseBarrier};
    use std::sync::Arc;
    use std::time::Duration;

    fn nodes() -> Vec<String> {
        (1..=5).map(|i| format!("n{}", i)).collect()
    }

    /// Nemesis that refuses to restart nodes
    struct StubbornNemesis;

    #[async_trait]
    impl Nemesis for StubbornNemesis {
        async fn invoke(&mut self, fault: &Fault) -> Result<Option<Value>, NemesisError> {
            match fault {
                Fault::Restart { .. } => Err(NemesisError::Command {
                    command: "docker start".into(),
                    stderr: "no such container".into(),
                }),
                _ => Ok(Some(Value::Text(fault.to_string()))),
            }
        }
    }

    fn shared(gen: generator::BoxGenerator) -> Participants {
        Participants {
            generator: gen,
            history: Arc::new(HistoryLog::new()),
            barrier: Arc::new(PhaseBarrier::new(1, Duration::from_secs(5))),
            abort: AbortSignal::new(),
            op_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_heal_inverts_faults() {
        assert_eq!(
            Fault::Kill { node: "n1".into() }.heal(),
            Some(Fault::Restart { node: "n1".into() })
        );
        assert_eq!(Fault::majority_partition(&nodes()).heal(), Some(Fault::Heal));
        assert!(Fault::Heal.is_healing());
    }

    #[test]
    fn test_majority_partition_groups() {
        let Fault::Partition { groups } = Fault::majority_partition(&nodes()) else {
            panic!("expected partition");
        };
        assert_eq!(groups[0], vec!["n1", "n2"]);
        assert_eq!(groups[1], vec!["n3", "n4", "n5"]);
    }

    #[test]
    fn test_ledger_tracks_outstanding() {
        let mut ledger = FaultLedger::default();
        ledger.apply(&Fault::majority_partition(&nodes()), EventKind::Info);
        ledger.apply(&Fault::Kill { node: "n2".into() }, EventKind::Ok);
        ledger.apply(&Fault::Kill { node: "n3".into() }, EventKind::Fail);
        assert_eq!(
            ledger.outstanding_heals(),
            vec![Fault::Heal, Fault::Restart { node: "n2".into() }]
        );

        ledger.apply(&Fault::Heal, EventKind::Ok);
        ledger.apply(&Fault::Restart { node: "n2".into() }, EventKind::Info);
        assert_eq!(ledger.outstanding_heals(), vec![Fault::Restart { node: "n2".into() }]);
        assert!(!ledger.is_clear());

        ledger.apply(&Fault::Restart { node: "n2".into() }, EventKind::Ok);
        assert!(ledger.is_clear());
    }

    #[tokio::test]
    async fn test_injector_heals_before_teardown() {
        let gen = generator::sequence(vec![
            Action::Fault {
                fault: Fault::majority_partition(&nodes()),
            },
            Action::Fault {
                fault: Fault::ClockSkew {
                    node: "n1".into(),
                    offset_ms: 250,
                },
            },
        ])
        .boxed();
        let shared = shared(gen);
        let history = shared.history.clone();

        let report = FaultInjector::new(Box::new(NoopNemesis), nodes(), shared).run().await;
        assert_eq!(report.invocations, 2);
        assert!(report.warnings.is_empty());

        let faults: Vec<_> = history
            .snapshot()
            .fault_operations()
            .into_iter()
            .map(|op| op.action)
            .collect();
        assert_eq!(faults.len(), 4);
        assert_eq!(faults[2], Action::Fault { fault: Fault::Heal });
        assert_eq!(
            faults[3],
            Action::Fault {
                fault: Fault::ResetClock { node: "n1".into() }
            }
        );
    }

    #[tokio::test]
    async fn test_failed_heal_is_a_warning() {
        let gen = generator::once(Action::Fault {
            fault: Fault::Kill { node: "n4".into() },
        })
        .boxed();
        let shared = shared(gen);

        let report = FaultInjector::new(Box::new(StubbornNemesis), nodes(), shared).run().await;
        assert!(report.faults.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(matches!(
            &report.warnings[0],
            HarnessWarning::Unhealed { fault, .. } if fault == "restart n4"
        ));
    }

    /// Nemesis whose control plane never answers
    struct HungNemesis;

    #[async_trait]
    impl Nemesis for HungNemesis {
        async fn invoke(&mut self, _fault: &Fault) -> Result<Option<Value>, NemesisError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn teardown(&mut self) -> Result<(), NemesisError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_hung_control_plane_is_bounded() {
        let gen = generator::once(Action::Fault {
            fault: Fault::majority_partition(&nodes()),
        })
        .boxed();
        let mut shared = shared(gen);
        shared.op_timeout = Duration::from_millis(50);
        let history = shared.history.clone();

        let report = FaultInjector::new(Box::new(HungNemesis), nodes(), shared).run().await;
        assert_eq!(
            report.faults,
            vec![HarnessFault::Stalled {
                process: Process::Nemesis,
                stage: "nemesis teardown".into(),
            }]
        );
        // The ambiguous partition still gets a heal attempt, which also stalls
        assert!(matches!(
            report.warnings.as_slice(),
            [HarnessWarning::Unhealed { fault, .. }] if fault == "heal"
        ));

        let history = history.snapshot();
        history.validate().unwrap();
        let outcomes: Vec<_> = history.fault_operations().iter().map(|op| op.outcome).collect();
        assert_eq!(outcomes, vec![EventKind::Info, EventKind::Info]);
    }
}
