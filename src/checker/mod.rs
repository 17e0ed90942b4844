//! History checkers
//!
//! A [`Checker`] turns a sealed [`History`] into a [`Verdict`]. Keys are
//! checked independently against the chosen [`Model`]:
//!
//! - [`Model::Register`]: linearizable read/write/cas register ([`linear`])
//! - [`Model::Set`]: add-only set ([`set`])
//! - [`Model::Counter`]: increment-only counter with bounded reads ([`counter`])
//!
//! Each anomaly carries a small sub-history that reproduces it, plus the
//! nemesis faults that were in effect while it happened.

pub mod counter;
pub mod linear;
pub mod set;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessFault, HarnessWarning, HistoryError};
use crate::history::{Action, EventKind, History, HistoryStats, OpRecord};

/// Consistency model a history is checked against
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Model {
    /// Linearizable register; `initial` is the value before any write (`None` = nil)
    Register {
        #[serde(default)]
        initial: Option<i64>,
    },
    /// Add-only set
    Set,
    /// Counter starting at zero
    Counter,
}

impl Default for Model {
    fn default() -> Self {
        Model::Register { initial: None }
    }
}

/// Overall or per-key outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Valid,
    Invalid,
    /// The checker gave up before reaching a decision
    Indeterminate,
}

impl Validity {
    /// Combine two results; `Invalid` wins over `Indeterminate` over `Valid`
    pub fn merge(self, other: Validity) -> Validity {
        match (self, other) {
            (Validity::Invalid, _) | (_, Validity::Invalid) => Validity::Invalid,
            (Validity::Indeterminate, _) | (_, Validity::Indeterminate) => Validity::Indeterminate,
            _ => Validity::Valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self == Validity::Valid
    }
}

/// What kind of misbehavior an anomaly describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// A read returned a value no operation could have written
    UnwrittenRead,
    /// No order of the operations respects both real time and the model
    NonLinearizable,
    /// An acknowledged set element is missing from a later read
    LostElement,
    /// A read returned an element nobody had tried to add
    UnexpectedElement,
    /// A counter read lies outside what the increments allow
    CounterOutOfBounds,
}

/// A single checker finding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub key: String,
    pub kind: AnomalyKind,
    pub explanation: String,
    /// Minimal sub-history reproducing the anomaly, in invocation order
    pub ops: Vec<OpRecord>,
    /// Nemesis faults in effect at some point while `ops` were in flight
    #[serde(default)]
    pub faults: Vec<OpRecord>,
}

/// Checker outcome for one key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVerdict {
    pub key: String,
    pub validity: Validity,
    /// Operations on this key that took part in the check
    pub ops: usize,
    /// Search configurations explored (register model only)
    pub states: usize,
}

/// The final outcome of a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub validity: Validity,
    pub model: Model,
    pub anomalies: Vec<Anomaly>,
    pub keys: Vec<KeyVerdict>,
    pub stats: HistoryStats,
    #[serde(default)]
    pub harness_faults: Vec<HarnessFault>,
    #[serde(default)]
    pub harness_warnings: Vec<HarnessWarning>,
}

impl Verdict {
    /// Attach the harness-level records of the run that produced the history
    pub fn with_harness(mut self, faults: Vec<HarnessFault>, warnings: Vec<HarnessWarning>) -> Self {
        self.harness_faults = faults;
        self.harness_warnings = warnings;
        self
    }

    /// Whether the run passed: the history is valid and the harness was healthy
    pub fn passed(&self) -> bool {
        self.validity.is_valid() && self.harness_faults.is_empty()
    }
}

/// Checker tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Per-key cap on explored search configurations
    pub max_states: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        CheckerConfig {
            max_states: 1_000_000,
        }
    }
}

/// Result of checking one key, before fault annotation
pub(crate) struct KeyCheck {
    pub validity: Validity,
    pub anomalies: Vec<Anomaly>,
    pub ops: usize,
    pub states: usize,
}

impl KeyCheck {
    pub(crate) fn valid(ops: usize, states: usize) -> Self {
        KeyCheck {
            validity: Validity::Valid,
            anomalies: Vec::new(),
            ops,
            states,
        }
    }
}

pub struct Checker {
    model: Model,
    config: CheckerConfig,
}

impl Checker {
    pub fn new(model: Model) -> Self {
        Checker {
            model,
            config: CheckerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CheckerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Check a history
    ///
    /// Fails only if the history itself breaks the log invariants; that is a
    /// harness problem, not a property of the system under test.
    pub fn check(&self, history: &History) -> Result<Verdict, HistoryError> {
        history.validate()?;

        let windows = fault_windows(&history.fault_operations());
        let mut validity = Validity::Valid;
        let mut anomalies = Vec::new();
        let mut keys = Vec::new();

        for (key, ops) in history.operations_by_key() {
            let result = match &self.model {
                Model::Register { initial } => linear::check_key(&key, &ops, *initial, self.config.max_states),
                Model::Set => set::check_key(&key, &ops),
                Model::Counter => counter::check_key(&key, &ops),
            };

            match result.validity {
                Validity::Valid => tracing::debug!(%key, ops = result.ops, "key valid"),
                Validity::Invalid => {
                    tracing::warn!(%key, anomalies = result.anomalies.len(), "key invalid")
                }
                Validity::Indeterminate => {
                    tracing::warn!(%key, states = result.states, "key indeterminate, search budget exhausted")
                }
            }

            validity = validity.merge(result.validity);
            for mut anomaly in result.anomalies {
                anomaly.faults = overlapping_faults(&anomaly.ops, &windows);
                anomalies.push(anomaly);
            }
            keys.push(KeyVerdict {
                key,
                validity: result.validity,
                ops: result.ops,
                states: result.states,
            });
        }

        Ok(Verdict {
            validity,
            model: self.model.clone(),
            anomalies,
            keys,
            stats: history.stats(),
            harness_faults: Vec::new(),
            harness_warnings: Vec::new(),
        })
    }
}

/// A disruptive fault and the event index at which it was healed
struct FaultWindow {
    op: OpRecord,
    start: u64,
    end: u64,
}

/// How long each fault was in effect
///
/// A fault lasts from its invocation until the completion of the first later
/// successful heal that undoes it, or forever if it was never healed. Faults
/// that definitely failed never took effect.
fn fault_windows(faults: &[OpRecord]) -> Vec<FaultWindow> {
    let mut windows = Vec::new();
    for (i, op) in faults.iter().enumerate() {
        let Action::Fault { fault } = &op.action else {
            continue;
        };
        if op.outcome == EventKind::Fail {
            continue;
        }
        let Some(heal) = fault.heal() else {
            // Healing actions count as disruption only while they run
            windows.push(FaultWindow {
                op: op.clone(),
                start: op.invoke,
                end: op.complete_or_max(),
            });
            continue;
        };

        let end = faults[i + 1..]
            .iter()
            .find(|later| {
                later.outcome == EventKind::Ok
                    && matches!(&later.action, Action::Fault { fault } if *fault == heal)
            })
            .map(|later| later.complete_or_max())
            .unwrap_or(u64::MAX);
        windows.push(FaultWindow {
            op: op.clone(),
            start: op.invoke,
            end,
        });
    }
    windows
}

fn overlapping_faults(ops: &[OpRecord], windows: &[FaultWindow]) -> Vec<OpRecord> {
    let Some(start) = ops.iter().map(|op| op.invoke).min() else {
        return Vec::new();
    };
    let end = ops.iter().map(|op| op.complete_or_max()).max().unwrap_or(u64::MAX);

    windows
        .iter()
        .filter(|w| w.start <= end && w.end >= start)
        .map(|w| w.op.clone())
        .collect()
}

/// Render a few operations for an explanation
pub(crate) fn describe(ops: &[&OpRecord]) -> String {
    ops.iter().map(|op| op.to_string()).collect::<Vec<_>>().join("; ")
}
