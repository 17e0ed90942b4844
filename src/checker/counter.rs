//! Counter checker
//!
//! A counter starts at zero. For each successful read the checker computes the
//! range of values the counter could have held while the read was in flight:
//! increments that were acknowledged before the read began definitely count,
//! while concurrent or ambiguous increments may or may not. Definitely failed
//! increments never count.

use super::{Anomaly, AnomalyKind, KeyCheck, Validity};
use crate::history::{Action, EventKind, OpRecord, Value};

/// Range a read may observe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bounds {
    lower: i64,
    upper: i64,
}

impl Bounds {
    fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

pub(crate) fn check_key(key: &str, ops: &[OpRecord]) -> KeyCheck {
    let increments: Vec<(&OpRecord, i64)> = ops
        .iter()
        .filter(|op| op.outcome != EventKind::Fail)
        .filter_map(|op| match op.action {
            Action::Increment { delta, .. } => Some((op, delta)),
            _ => None,
        })
        .collect();
    let reads: Vec<(&OpRecord, i64)> = ops
        .iter()
        .filter(|op| op.action.is_read() && op.outcome == EventKind::Ok)
        .filter_map(|op| match op.value {
            Some(Value::Int(v)) => Some((op, v)),
            Some(Value::Nil) => Some((op, 0)),
            _ => None,
        })
        .collect();

    let mut anomalies = Vec::new();
    for (read, value) in &reads {
        let mut bounds = Bounds { lower: 0, upper: 0 };
        let mut definite = Vec::new();
        let mut possible = Vec::new();

        for (inc, delta) in &increments {
            if inc.invoke > read.complete_or_max() {
                continue;
            }
            if inc.outcome == EventKind::Ok && inc.precedes(read) {
                bounds.lower = bounds.lower.saturating_add(*delta);
                bounds.upper = bounds.upper.saturating_add(*delta);
                definite.push(*inc);
            } else {
                bounds.lower = bounds.lower.saturating_add((*delta).min(0));
                bounds.upper = bounds.upper.saturating_add((*delta).max(0));
                possible.push(*inc);
            }
        }

        if bounds.contains(*value) {
            continue;
        }
        // Cite what pins the violated bound
        let mut witnesses: Vec<OpRecord> = if *value < bounds.lower {
            definite.iter().map(|op| (*op).clone()).collect()
        } else {
            definite.iter().chain(&possible).map(|op| (*op).clone()).collect()
        };
        witnesses.push((*read).clone());
        witnesses.sort_by_key(|op| op.invoke);

        anomalies.push(Anomaly {
            key: key.to_string(),
            kind: AnomalyKind::CounterOutOfBounds,
            explanation: format!(
                "{} read {} but the counter was within [{}, {}]",
                read, value, bounds.lower, bounds.upper
            ),
            ops: witnesses,
            faults: Vec::new(),
        });
    }

    let checked = increments.len() + reads.len();
    if anomalies.is_empty() {
        KeyCheck::valid(checked, 0)
    } else {
        KeyCheck {
            validity: Validity::Invalid,
            anomalies,
            ops: checked,
            states: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{History, Operation, Process};

    fn inc(delta: i64) -> Action {
        Action::Increment {
            key: "c".to_string(),
            delta,
        }
    }

    fn read() -> Action {
        Action::Read { key: "c".to_string() }
    }

    fn p(id: u64) -> Process {
        Process::Client(id)
    }

    fn check(ops: Vec<Operation>) -> KeyCheck {
        check_key("c", &History::from_ops(ops).operations())
    }

    #[test]
    fn test_reads_within_bounds() {
        let result = check(vec![
            Operation::invoke(p(1), inc(2)),
            Operation::ok(p(1), inc(2), None),
            Operation::invoke(p(1), inc(3)),
            Operation::info(p(1), inc(3), "timed out"),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Int(5))),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Int(2))),
        ]);
        assert_eq!(result.validity, Validity::Valid);
    }

    #[test]
    fn test_read_below_acknowledged_total() {
        let result = check(vec![
            Operation::invoke(p(1), inc(1)),
            Operation::ok(p(1), inc(1), None),
            Operation::invoke(p(1), inc(1)),
            Operation::ok(p(1), inc(1), None),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Int(1))),
        ]);
        assert_eq!(result.validity, Validity::Invalid);
        let anomaly = &result.anomalies[0];
        assert_eq!(anomaly.kind, AnomalyKind::CounterOutOfBounds);
        assert_eq!(anomaly.ops.len(), 3);
    }

    #[test]
    fn test_failed_increment_does_not_count() {
        let result = check(vec![
            Operation::invoke(p(1), inc(4)),
            Operation::fail(p(1), inc(4), "rejected"),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Int(4))),
        ]);
        assert_eq!(result.validity, Validity::Invalid);
    }

    #[test]
    fn test_negative_deltas_widen_lower_bound() {
        let result = check(vec![
            Operation::invoke(p(1), inc(-3)),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Int(-3))),
            Operation::ok(p(1), inc(-3), None),
        ]);
        assert_eq!(result.validity, Validity::Valid);
    }
}
