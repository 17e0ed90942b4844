//! History types for recording concurrent operations
//!
//! Workers and the fault injector append `invoke` and completion events to a
//! shared [`HistoryLog`]. Once the run reaches the analyzing phase the log is
//! sealed into an immutable [`History`] which the checker consumes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::HistoryError;
use crate::nemesis::Fault;

/// Microsecond timestamp relative to test start
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp from microseconds
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Get the value in microseconds
    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// Logical actor issuing operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    /// Numbered client worker
    Client(u64),
    /// The reserved fault-injector identity
    Nemesis,
}

impl Process {
    pub fn is_nemesis(&self) -> bool {
        matches!(self, Process::Nemesis)
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::Client(id) => write!(f, "process {}", id),
            Process::Nemesis => write!(f, "nemesis"),
        }
    }
}

/// Event type: an invocation or one of the three terminal outcomes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Invoke,
    /// Completed and took effect
    Ok,
    /// Definitely did not take effect
    Fail,
    /// Unknown whether it took effect
    Info,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventKind::Invoke)
    }
}

/// What an operation asks for
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "f", rename_all = "kebab-case")]
pub enum Action {
    /// Read a register, set or counter
    Read { key: String },
    /// Overwrite a register
    Write { key: String, value: i64 },
    /// Compare-and-set a register
    Cas { key: String, expected: i64, new: i64 },
    /// Add an element to a set
    Add { key: String, element: i64 },
    /// Add `delta` to a counter
    Increment { key: String, delta: i64 },
    /// Control-plane action performed by the nemesis
    Fault { fault: Fault },
}

impl Action {
    /// Key this action targets, `None` for faults
    pub fn key(&self) -> Option<&str> {
        match self {
            Action::Read { key }
            | Action::Write { key, .. }
            | Action::Cas { key, .. }
            | Action::Add { key, .. }
            | Action::Increment { key, .. } => Some(key),
            Action::Fault { .. } => None,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Action::Read { .. })
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Action::Fault { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read { key } => write!(f, "read {}", key),
            Action::Write { key, value } => write!(f, "write {} {}", key, value),
            Action::Cas { key, expected, new } => write!(f, "cas {} {}->{}", key, expected, new),
            Action::Add { key, element } => write!(f, "add {} {}", key, element),
            Action::Increment { key, delta } => write!(f, "increment {} {}", key, delta),
            Action::Fault { fault } => write!(f, "{}", fault),
        }
    }
}

/// Observed or applied result carried by a completion
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "lowercase")]
pub enum Value {
    /// Key absent / register never written
    Nil,
    Int(i64),
    /// Set contents, sorted
    Set(Vec<i64>),
    /// Free-form result, e.g. a nemesis action's description
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Set(items) => write!(f, "{:?}", items),
            Value::Text(text) => write!(f, "{:?}", text),
        }
    }
}

/// A single invocation or completion, before it is recorded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Process that performed the operation
    pub process: Process,
    /// Invocation or outcome
    pub kind: EventKind,
    /// What was asked for
    pub action: Action,
    /// What was observed (reads) or applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Reason attached to `fail` and `info` completions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn invoke(process: Process, action: Action) -> Self {
        Operation {
            process,
            kind: EventKind::Invoke,
            action,
            value: None,
            error: None,
        }
    }

    pub fn ok(process: Process, action: Action, value: Option<Value>) -> Self {
        Operation {
            process,
            kind: EventKind::Ok,
            action,
            value,
            error: None,
        }
    }

    pub fn fail(process: Process, action: Action, error: impl Into<String>) -> Self {
        Operation {
            process,
            kind: EventKind::Fail,
            action,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn info(process: Process, action: Action, error: impl Into<String>) -> Self {
        Operation {
            process,
            kind: EventKind::Info,
            action,
            value: None,
            error: Some(error.into()),
        }
    }
}

/// An operation as recorded: stamped with its global position and time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Global sequence number, strictly increasing from 0
    pub index: u64,
    /// Time since test start
    pub time: Timestamp,
    #[serde(flatten)]
    pub op: Operation,
}

/// Tracks the outstanding invocation of every process
#[derive(Debug, Default)]
struct ProcessTracker {
    outstanding: HashMap<Process, (u64, Action)>,
}

impl ProcessTracker {
    fn observe(&mut self, index: u64, op: &Operation) -> Result<(), HistoryError> {
        if op.kind == EventKind::Invoke {
            if let Some((outstanding, _)) = self.outstanding.get(&op.process) {
                return Err(HistoryError::DoubleInvoke {
                    process: op.process,
                    index,
                    outstanding: *outstanding,
                });
            }
            self.outstanding.insert(op.process, (index, op.action.clone()));
            return Ok(());
        }

        match self.outstanding.get(&op.process) {
            None => Err(HistoryError::CompletionWithoutInvoke {
                process: op.process,
                index,
            }),
            Some((invoked, action)) if *action != op.action => Err(HistoryError::ActionMismatch {
                process: op.process,
                index,
                invoked: *invoked,
            }),
            Some(_) => {
                self.outstanding.remove(&op.process);
                Ok(())
            }
        }
    }
}

struct LogState {
    events: Vec<Event>,
    tracker: ProcessTracker,
    sealed: Option<History>,
}

/// Append-only, concurrency-safe ledger of events
///
/// The lock is held only for the instant of an append. Sequence number and
/// timestamp are both assigned under it, so index order and time order agree.
pub struct HistoryLog {
    start: Instant,
    state: Mutex<LogState>,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLog {
    /// Create an empty log; the test clock starts now
    pub fn new() -> Self {
        HistoryLog {
            start: Instant::now(),
            state: Mutex::new(LogState {
                events: Vec::new(),
                tracker: ProcessTracker::default(),
                sealed: None,
            }),
        }
    }

    /// Time elapsed since test start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Current time relative to test start as a Timestamp
    pub fn now(&self) -> Timestamp {
        Timestamp(self.start.elapsed().as_micros() as u64)
    }

    /// Append an event, assigning its sequence number and timestamp
    ///
    /// Fails if the log is sealed or the append would break the per-process
    /// invoke/complete alternation.
    pub fn record(&self, op: Operation) -> Result<Event, HistoryError> {
        let mut state = self.state.lock();
        if state.sealed.is_some() {
            return Err(HistoryError::Sealed {
                process: op.process,
            });
        }

        let index = state.events.len() as u64;
        state.tracker.observe(index, &op)?;

        let event = Event {
            index,
            time: self.now(),
            op,
        };
        state.events.push(event.clone());
        Ok(event)
    }

    /// Seal the log and return its immutable contents
    ///
    /// Every later `record` fails; every later `snapshot` returns the same history.
    pub fn snapshot(&self) -> History {
        let mut state = self.state.lock();
        if let Some(history) = &state.sealed {
            return history.clone();
        }
        let events = std::mem::take(&mut state.events);
        let history = History::from_events(events);
        state.sealed = Some(history.clone());
        history
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed.is_some()
    }

    /// Number of events recorded so far
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        match &state.sealed {
            Some(history) => history.len(),
            None => state.events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An invocation paired with its completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRecord {
    /// Index of the invoke event; unique per operation
    pub id: u64,
    pub process: Process,
    pub action: Action,
    /// `Ok`, `Fail` or `Info`; never-completed invocations count as `Info`
    pub outcome: EventKind,
    pub value: Option<Value>,
    pub error: Option<String>,
    /// Sequence index of the invocation
    pub invoke: u64,
    /// Sequence index of the completion, `None` if it never completed
    pub complete: Option<u64>,
    pub invoke_time: Timestamp,
    pub complete_time: Option<Timestamp>,
}

impl OpRecord {
    /// Whether this operation finished before `other` started
    pub fn precedes(&self, other: &OpRecord) -> bool {
        self.complete.is_some_and(|complete| complete < other.invoke)
    }

    /// Whether the two operations were in flight at the same time
    pub fn overlaps(&self, other: &OpRecord) -> bool {
        !self.precedes(other) && !other.precedes(self)
    }

    /// Completion index, with never-completed operations open forever
    pub fn complete_or_max(&self) -> u64 {
        self.complete.unwrap_or(u64::MAX)
    }
}

impl fmt::Display for OpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome {
            EventKind::Invoke => "invoke",
            EventKind::Ok => "ok",
            EventKind::Fail => "fail",
            EventKind::Info => "info",
        };
        write!(f, "[{}..", self.invoke)?;
        match self.complete {
            Some(complete) => write!(f, "{}]", complete)?,
            None => write!(f, "]")?,
        }
        write!(f, " {} {} {}", self.process, outcome, self.action)?;
        if let Some(value) = &self.value {
            write!(f, " => {}", value)?;
        }
        Ok(())
    }
}

/// Counts of events by outcome
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub events: usize,
    pub invocations: usize,
    pub ok: usize,
    pub fail: usize,
    pub info: usize,
    /// Nemesis invocations
    pub faults: usize,
}

/// Immutable, totally ordered sequence of events from one run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct History {
    events: Arc<[Event]>,
}

impl Default for History {
    fn default() -> Self {
        History::from_events(Vec::new())
    }
}

impl History {
    /// Wrap already-ordered events; call `validate` for untrusted input
    pub fn from_events(events: Vec<Event>) -> Self {
        History {
            events: events.into(),
        }
    }

    /// Build a history from bare operations, numbering them in order
    ///
    /// Timestamps equal the sequence number. Used to replay hand-written
    /// histories.
    pub fn from_ops(ops: impl IntoIterator<Item = Operation>) -> Self {
        let events = ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| Event {
                index: i as u64,
                time: Timestamp(i as u64),
                op,
            })
            .collect::<Vec<_>>();
        History::from_events(events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Re-check ordering and per-process alternation
    pub fn validate(&self) -> Result<(), HistoryError> {
        let mut tracker = ProcessTracker::default();
        for (expected, event) in self.events.iter().enumerate() {
            if event.index != expected as u64 {
                return Err(HistoryError::OutOfOrder {
                    expected: expected as u64,
                    found: event.index,
                });
            }
            tracker.observe(event.index, &event.op)?;
        }
        Ok(())
    }

    /// Pair every invocation with its completion, in invocation order
    pub fn operations(&self) -> Vec<OpRecord> {
        let mut records: Vec<OpRecord> = Vec::new();
        let mut open: HashMap<Process, usize> = HashMap::new();

        for event in self.events.iter() {
            let op = &event.op;
            if op.kind == EventKind::Invoke {
                open.insert(op.process, records.len());
                records.push(OpRecord {
                    id: event.index,
                    process: op.process,
                    action: op.action.clone(),
                    outcome: EventKind::Info,
                    value: None,
                    error: None,
                    invoke: event.index,
                    complete: None,
                    invoke_time: event.time,
                    complete_time: None,
                });
            } else if let Some(slot) = open.remove(&op.process) {
                let record = &mut records[slot];
                record.outcome = op.kind;
                record.value = op.value.clone();
                record.error = op.error.clone();
                record.complete = Some(event.index);
                record.complete_time = Some(event.time);
            }
        }

        records
    }

    /// Client operations grouped by key
    pub fn operations_by_key(&self) -> std::collections::BTreeMap<String, Vec<OpRecord>> {
        let mut by_key: std::collections::BTreeMap<String, Vec<OpRecord>> = Default::default();
        for record in self.operations() {
            if let Some(key) = record.action.key() {
                by_key.entry(key.to_string()).or_default().push(record);
            }
        }
        by_key
    }

    /// Fault actions only
    pub fn fault_operations(&self) -> Vec<OpRecord> {
        self.operations()
            .into_iter()
            .filter(|record| record.action.is_fault())
            .collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            events: self.events.len(),
            ..Default::default()
        };
        for event in self.events.iter() {
            match event.op.kind {
                EventKind::Invoke => {
                    stats.invocations += 1;
                    if event.op.process.is_nemesis() {
                        stats.faults += 1;
                    }
                }
                EventKind::Ok => stats.ok += 1,
                EventKind::Fail => stats.fail += 1,
                EventKind::Info => stats.info += 1,
            }
        }
        stats
    }
}
