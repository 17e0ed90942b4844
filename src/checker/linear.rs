//! Wing-Gong linearizability search for a single register
//!
//! Operations are points to be placed somewhere inside their real-time
//! interval, expressed in event sequence numbers. The search repeatedly picks
//! an operation that no remaining operation must precede, applies it to the
//! register model, and backtracks when the model rejects it.
//!
//! - `ok` reads, writes and cas are required: the linearization must place them
//! - `info` writes and cas are optional: they may be placed anywhere after
//!   their invocation, or left out
//! - `fail` operations and `info` reads are dropped; they constrain nothing
//!
//! The search runs on an explicit stack and remembers every (placed set,
//! register value) configuration it has seen, so each is explored once. When a
//! key is not linearizable the failing configuration is shrunk to a minimal
//! counterexample.

use std::collections::HashSet;

use super::{describe, Anomaly, AnomalyKind, KeyCheck, Validity};
use crate::history::{Action, EventKind, OpRecord, Value};

/// Register contents; `None` is nil
type State = Option<i64>;

/// An operation taking part in the search
#[derive(Clone, Copy, Debug)]
struct Entry<'a> {
    record: &'a OpRecord,
    required: bool,
    invoke: u64,
    /// Optional operations stay open until the end of the history
    complete: u64,
}

impl Entry<'_> {
    fn is_write(&self) -> bool {
        !self.record.action.is_read()
    }

    /// Value this operation leaves in the register, if it changes it
    fn written(&self) -> Option<i64> {
        match &self.record.action {
            Action::Write { value, .. } => Some(*value),
            Action::Cas { new, .. } => Some(*new),
            _ => None,
        }
    }

    /// Value this operation needs to find in the register, if any
    fn observed(&self) -> Option<State> {
        match (&self.record.action, &self.record.value) {
            (Action::Read { .. }, Some(Value::Nil)) => Some(None),
            (Action::Read { .. }, Some(Value::Int(v))) => Some(Some(*v)),
            (Action::Cas { expected, .. }, _) => Some(Some(*expected)),
            _ => None,
        }
    }

    /// Apply to the register model; `None` if the model rejects it
    fn step(&self, state: State) -> Option<State> {
        match &self.record.action {
            Action::Write { value, .. } => Some(Some(*value)),
            Action::Cas { expected, new, .. } => (state == Some(*expected)).then_some(Some(*new)),
            Action::Read { .. } => self.observed().filter(|seen| *seen == state).map(|_| state),
            _ => None,
        }
    }
}

/// Build the entries for one key's operations
fn prepare(ops: &[OpRecord]) -> Vec<Entry<'_>> {
    let mut entries: Vec<Entry> = ops
        .iter()
        .filter_map(|record| {
            let required = match (&record.action, record.outcome) {
                (Action::Read { .. }, EventKind::Ok) => {
                    if !matches!(record.value, Some(Value::Nil | Value::Int(_))) {
                        return None;
                    }
                    true
                }
                (Action::Write { .. } | Action::Cas { .. }, EventKind::Ok) => true,
                (Action::Write { .. } | Action::Cas { .. }, EventKind::Info) => false,
                _ => return None,
            };
            Some(Entry {
                record,
                required,
                invoke: record.invoke,
                complete: if required {
                    record.complete_or_max()
                } else {
                    u64::MAX
                },
            })
        })
        .collect();

    // An optional write nobody ever observes cannot help explain anything
    let observed: HashSet<i64> = entries.iter().filter_map(|e| e.observed().flatten()).collect();
    entries.retain(|e| e.required || e.written().is_some_and(|v| observed.contains(&v)));
    entries
}

/// Fixed-size set of entry indices
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Bits(Vec<u64>);

impl Bits {
    fn new(len: usize) -> Self {
        Bits(vec![0; len.div_ceil(64)])
    }

    fn get(&self, i: usize) -> bool {
        self.0[i / 64] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }
}

/// Outcome of one search
enum Search {
    /// Every required operation was placed; ids in linearization order
    Linearizable(Vec<u64>),
    /// No order exists; the entry that could never be placed from the
    /// deepest configuration reached
    Stuck(usize),
    /// Gave up after exploring the budget
    Exhausted,
}

struct Frame {
    placed: Bits,
    state: State,
    required_placed: usize,
    candidates: Vec<usize>,
    next: usize,
}

/// Entries that may be placed next
///
/// An entry is a candidate if it was invoked before every unplaced required
/// entry completed; otherwise that entry would have to come first.
fn candidates(entries: &[Entry], placed: &Bits) -> Vec<usize> {
    let horizon = entries
        .iter()
        .enumerate()
        .filter(|(i, e)| e.required && !placed.get(*i))
        .map(|(_, e)| e.complete)
        .min()
        .unwrap_or(u64::MAX);

    let mut next: Vec<usize> = (0..entries.len())
        .filter(|&i| !placed.get(i) && entries[i].invoke < horizon)
        .collect();
    // Earlier invocations first, writes before reads
    next.sort_by(|&a, &b| {
        entries[a]
            .invoke
            .cmp(&entries[b].invoke)
            .then_with(|| entries[b].is_write().cmp(&entries[a].is_write()))
    });
    next
}

fn search(entries: &[Entry], initial: State, max_states: usize) -> (Search, usize) {
    let required = entries.iter().filter(|e| e.required).count();
    if required == 0 {
        return (Search::Linearizable(Vec::new()), 0);
    }

    let root = Bits::new(entries.len());
    let mut seen: HashSet<(Bits, State)> = HashSet::new();
    seen.insert((root.clone(), initial));
    let mut deepest = (0, root.clone());
    let mut stack = vec![Frame {
        candidates: candidates(entries, &root),
        placed: root,
        state: initial,
        required_placed: 0,
        next: 0,
    }];

    while let Some(frame) = stack.last_mut() {
        let Some(&i) = frame.candidates.get(frame.next) else {
            stack.pop();
            continue;
        };
        frame.next += 1;

        let Some(state) = entries[i].step(frame.state) else {
            continue;
        };
        let mut placed = frame.placed.clone();
        placed.set(i);
        let required_placed = frame.required_placed + usize::from(entries[i].required);

        if !seen.insert((placed.clone(), state)) {
            continue;
        }
        if seen.len() > max_states {
            return (Search::Exhausted, seen.len());
        }

        if required_placed == required {
            // Each frame's last tried candidate is the one on the current path
            let order: Vec<u64> = stack
                .iter()
                .map(|f| entries[f.candidates[f.next - 1]].record.id)
                .collect();
            return (Search::Linearizable(order), seen.len());
        }

        if required_placed > deepest.0 {
            deepest = (required_placed, placed.clone());
        }
        stack.push(Frame {
            candidates: candidates(entries, &placed),
            placed,
            state,
            required_placed,
            next: 0,
        });
    }

    // The unplaced required entry that had to go next
    let stuck = (0..entries.len())
        .filter(|&i| entries[i].required && !deepest.1.get(i))
        .min_by_key(|&i| entries[i].complete)
        .unwrap_or(0);
    (Search::Stuck(stuck), seen.len())
}

/// Whether every observed value has a possible writer among `entries`
fn self_contained(entries: &[Entry], initial: State) -> bool {
    let written: HashSet<State> = entries
        .iter()
        .filter_map(|e| e.written().map(Some))
        .chain(std::iter::once(initial))
        .collect();
    entries
        .iter()
        .filter_map(|e| e.observed())
        .all(|seen| written.contains(&seen))
}

fn violates(entries: &[Entry], subset: &[usize], initial: State, max_states: usize) -> bool {
    let trial: Vec<Entry> = subset.iter().map(|&i| entries[i]).collect();
    self_contained(&trial, initial) && matches!(search(&trial, initial, max_states).0, Search::Stuck(_))
}

/// Shrink a failing set of entries by greedy deletion
///
/// Tries dropping large chunks first, then single entries until no single
/// entry can be removed without the remainder becoming linearizable or
/// referencing a value it no longer writes.
fn minimize(entries: &[Entry], initial: State, max_states: usize) -> Vec<usize> {
    let mut keep: Vec<usize> = (0..entries.len()).collect();
    let mut chunk = (keep.len() / 2).max(1);

    loop {
        let mut removed = false;
        let mut start = 0;
        while start < keep.len() {
            let end = (start + chunk).min(keep.len());
            let trial: Vec<usize> = keep[..start].iter().chain(&keep[end..]).copied().collect();
            if !trial.is_empty() && violates(entries, &trial, initial, max_states) {
                keep = trial;
                removed = true;
            } else {
                start = end;
            }
        }

        if chunk > 1 {
            chunk /= 2;
        } else if !removed {
            return keep;
        }
    }
}

/// The operation an explanation blames, always one of `ops`
///
/// The search's stuck operation if minimization kept it, otherwise the
/// last read to complete, otherwise the last operation to complete.
fn culprit<'a>(ops: &'a [OpRecord], stuck: &'a OpRecord) -> &'a OpRecord {
    if let Some(op) = ops.iter().find(|op| op.id == stuck.id) {
        return op;
    }
    let completion = |op: &&OpRecord| op.complete.unwrap_or(u64::MAX);
    ops.iter()
        .filter(|op| op.action.is_read())
        .max_by_key(completion)
        .or_else(|| ops.iter().max_by_key(completion))
        .unwrap_or(stuck)
}

/// Check one key's operations against a linearizable register
pub(crate) fn check_key(key: &str, ops: &[OpRecord], initial: Option<i64>, max_states: usize) -> KeyCheck {
    let entries = prepare(ops);

    // A read of a value no operation could have written needs no search
    let writable: HashSet<State> = entries
        .iter()
        .filter_map(|e| e.written().map(Some))
        .chain(std::iter::once(initial))
        .collect();
    let unwritten: Vec<Anomaly> = entries
        .iter()
        .filter(|e| e.record.action.is_read())
        .filter(|e| e.observed().is_some_and(|seen| !writable.contains(&seen)))
        .map(|e| Anomaly {
            key: key.to_string(),
            kind: AnomalyKind::UnwrittenRead,
            explanation: format!("{} observed a value no operation wrote", e.record),
            ops: vec![e.record.clone()],
            faults: Vec::new(),
        })
        .collect();
    if !unwritten.is_empty() {
        return KeyCheck {
            validity: Validity::Invalid,
            anomalies: unwritten,
            ops: entries.len(),
            states: 0,
        };
    }

    let (outcome, states) = search(&entries, initial, max_states);
    let stuck = match outcome {
        Search::Linearizable(order) => {
            tracing::trace!(%key, ?order, "linearization found");
            return KeyCheck::valid(entries.len(), states);
        }
        Search::Exhausted => {
            return KeyCheck {
                validity: Validity::Indeterminate,
                anomalies: Vec::new(),
                ops: entries.len(),
                states,
            }
        }
        Search::Stuck(stuck) => stuck,
    };

    // Nothing invoked after the stuck operation completed is needed to show it
    let deadline = entries[stuck].complete;
    let prefix: Vec<Entry> = entries.iter().copied().filter(|e| e.invoke < deadline).collect();
    let base = if matches!(search(&prefix, initial, max_states).0, Search::Stuck(_)) {
        prefix
    } else {
        entries.clone()
    };

    let mut ops: Vec<OpRecord> = minimize(&base, initial, max_states)
        .into_iter()
        .map(|i| base[i].record.clone())
        .collect();
    ops.sort_by_key(|op| op.invoke);

    let culprit = culprit(&ops, entries[stuck].record);
    let context: Vec<&OpRecord> = ops.iter().filter(|op| op.id != culprit.id).collect();
    let explanation = if context.is_empty() {
        format!("{} cannot be linearized", culprit)
    } else {
        format!(
            "{} cannot be linearized after {}",
            culprit,
            describe(&context)
        )
    };

    KeyCheck {
        validity: Validity::Invalid,
        anomalies: vec![Anomaly {
            key: key.to_string(),
            kind: AnomalyKind::NonLinearizable,
            explanation,
            ops,
            faults: Vec::new(),
        }],
        ops: entries.len(),
        states,
    }
}
