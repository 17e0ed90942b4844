//! Add-only set checker
//!
//! For every successful read of a set key:
//! - every `ok` add that completed before the read was invoked must be present
//! - every element observed by an earlier read (one that completed before
//!   this read was invoked) must still be present
//! - every present element must have been attempted before the read completed
//!   by an add that did not definitely fail

use std::collections::{BTreeMap, BTreeSet};

use super::{Anomaly, AnomalyKind, KeyCheck, Validity};
use crate::history::{Action, EventKind, OpRecord, Value};

pub(crate) fn check_key(key: &str, ops: &[OpRecord]) -> KeyCheck {
    let adds: Vec<(&OpRecord, i64)> = ops
        .iter()
        .filter_map(|op| match op.action {
            Action::Add { element, .. } => Some((op, element)),
            _ => None,
        })
        .collect();
    let reads: Vec<(&OpRecord, BTreeSet<i64>)> = ops
        .iter()
        .filter(|op| op.action.is_read() && op.outcome == EventKind::Ok)
        .filter_map(|op| match &op.value {
            Some(Value::Set(items)) => Some((op, items.iter().copied().collect())),
            Some(Value::Nil) => Some((op, BTreeSet::new())),
            _ => None,
        })
        .collect();

    let mut anomalies = Vec::new();
    // Report each element at most once per kind
    let mut lost: BTreeSet<i64> = BTreeSet::new();
    let mut unexpected: BTreeSet<i64> = BTreeSet::new();

    for (read, contents) in &reads {
        for (add, element) in &adds {
            if add.outcome == EventKind::Ok
                && add.precedes(read)
                && !contents.contains(element)
                && lost.insert(*element)
            {
                anomalies.push(Anomaly {
                    key: key.to_string(),
                    kind: AnomalyKind::LostElement,
                    explanation: format!(
                        "element {} was acknowledged by {} but missing from {}",
                        element, add, read
                    ),
                    ops: vec![(*add).clone(), (*read).clone()],
                    faults: Vec::new(),
                });
            }
        }

        for (earlier, seen) in &reads {
            if !earlier.precedes(read) {
                continue;
            }
            for element in seen.difference(contents) {
                if lost.insert(*element) {
                    anomalies.push(Anomaly {
                        key: key.to_string(),
                        kind: AnomalyKind::LostElement,
                        explanation: format!(
                            "element {} was observed by {} but missing from {}",
                            element, earlier, read
                        ),
                        ops: vec![(*earlier).clone(), (*read).clone()],
                        faults: Vec::new(),
                    });
                }
            }
        }

        for element in contents {
            let attempted = adds.iter().any(|(add, e)| {
                e == element && add.outcome != EventKind::Fail && add.invoke < read.complete_or_max()
            });
            if !attempted && unexpected.insert(*element) {
                let mut witnesses: Vec<OpRecord> = adds
                    .iter()
                    .filter(|(_, e)| e == element)
                    .map(|(add, _)| (*add).clone())
                    .collect();
                witnesses.push((*read).clone());
                anomalies.push(Anomaly {
                    key: key.to_string(),
                    kind: AnomalyKind::UnexpectedElement,
                    explanation: format!("{} contains element {} that no add could have written", read, element),
                    ops: witnesses,
                    faults: Vec::new(),
                });
            }
        }
    }

    // Keep the report in history order
    let order: BTreeMap<u64, usize> = ops.iter().enumerate().map(|(i, op)| (op.id, i)).collect();
    anomalies.sort_by_key(|a| a.ops.last().and_then(|op| order.get(&op.id).copied()));

    if anomalies.is_empty() {
        KeyCheck::valid(adds.len() + reads.len(), 0)
    } else {
        KeyCheck {
            validity: Validity::Invalid,
            anomalies,
            ops: adds.len() + reads.len(),
            states: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{History, Operation, Process};

    fn add(element: i64) -> Action {
        Action::Add {
            key: "s".to_string(),
            element,
        }
    }

    fn read() -> Action {
        Action::Read { key: "s".to_string() }
    }

    fn p(id: u64) -> Process {
        Process::Client(id)
    }

    fn check(ops: Vec<Operation>) -> KeyCheck {
        check_key("s", &History::from_ops(ops).operations())
    }

    #[test]
    fn test_complete_reads_are_valid() {
        let result = check(vec![
            Operation::invoke(p(1), add(1)),
            Operation::ok(p(1), add(1), None),
            Operation::invoke(p(1), add(2)),
            // Concurrent read may or may not see 2
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![1]))),
            Operation::ok(p(1), add(2), None),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![1, 2]))),
        ]);
        assert_eq!(result.validity, Validity::Valid);
    }

    #[test]
    fn test_info_add_may_appear() {
        let result = check(vec![
            Operation::invoke(p(1), add(3)),
            Operation::info(p(1), add(3), "timed out"),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![3]))),
        ]);
        assert_eq!(result.validity, Validity::Valid);
    }

    #[test]
    fn test_lost_acknowledged_add() {
        let result = check(vec![
            Operation::invoke(p(1), add(1)),
            Operation::ok(p(1), add(1), None),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![]))),
        ]);
        assert_eq!(result.validity, Validity::Invalid);
        assert_eq!(result.anomalies[0].kind, AnomalyKind::LostElement);
        assert_eq!(result.anomalies[0].ops.len(), 2);
    }

    #[test]
    fn test_element_disappears_between_reads() {
        let result = check(vec![
            Operation::invoke(p(1), add(1)),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![1]))),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![]))),
            Operation::info(p(1), add(1), "timed out"),
        ]);
        assert_eq!(result.validity, Validity::Invalid);
        assert_eq!(result.anomalies.len(), 1);
        assert!(result.anomalies[0].explanation.contains("observed"));
    }

    #[test]
    fn test_failed_add_must_not_appear() {
        let result = check(vec![
            Operation::invoke(p(1), add(4)),
            Operation::fail(p(1), add(4), "rejected"),
            Operation::invoke(p(2), read()),
            Operation::ok(p(2), read(), Some(Value::Set(vec![4]))),
        ]);
        assert_eq!(result.validity, Validity::Invalid);
        assert_eq!(result.anomalies[0].kind, AnomalyKind::UnexpectedElement);
        assert_eq!(result.anomalies[0].ops.len(), 2);
    }
}
