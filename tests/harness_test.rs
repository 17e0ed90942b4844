//! End-to-end runs against the in-memory cluster

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use faultline::checker::AnomalyKind;
use faultline::client::{Client, Connection};
use faultline::error::{ClientError, HarnessFault};
use faultline::generator::{self, GeneratorExt};
use faultline::history::EventKind;
use faultline::nemesis::Fault;
use faultline::phase::Phase;
use faultline::testing::{MemoryCluster, Replication};
use faultline::{Action, Checker, Model, Process, RunStore, Test, TestConfig, Validity, Value};

fn memory_config(cluster: &MemoryCluster) -> TestConfig {
    TestConfig::default()
        .with_name("memory")
        .with_nodes(cluster.nodes())
        .with_concurrency(4)
        .with_time_limit(Duration::from_millis(400))
        .with_op_interval(Some(Duration::from_millis(2)))
        .with_barrier_grace(Duration::from_secs(2))
}

#[tokio::test]
async fn test_quorum_cluster_under_faults_is_linearizable() {
    let cluster = MemoryCluster::new(3, Model::default(), Replication::Quorum);
    let nodes = cluster.nodes();
    let config = memory_config(&cluster).with_faults(
        vec![
            Fault::majority_partition(&nodes),
            Fault::Kill { node: nodes[1].clone() },
        ],
        Duration::from_millis(40),
    );

    let report = Test::new(config, Arc::new(cluster.clone()))
        .with_database(Arc::new(cluster.clone()))
        .with_nemesis(Box::new(cluster.nemesis()))
        .run()
        .await
        .unwrap();

    assert_eq!(report.verdict.validity, Validity::Valid, "{:?}", report.verdict.anomalies);
    assert!(report.passed(), "harness faults: {:?}", report.verdict.harness_faults);
    assert!(report.verdict.stats.faults > 0);
    assert!(report.verdict.stats.ok > 0);
    // Every fault was healed before teardown
    assert!(cluster.is_healthy());
}

#[tokio::test]
async fn test_history_alternates_and_is_time_ordered() {
    let cluster = MemoryCluster::new(3, Model::default(), Replication::Quorum);
    let nodes = cluster.nodes();
    let config = memory_config(&cluster).with_faults(vec![Fault::majority_partition(&nodes)], Duration::from_millis(50));

    let report = Test::new(config, Arc::new(cluster.clone()))
        .with_database(Arc::new(cluster.clone()))
        .with_nemesis(Box::new(cluster.nemesis()))
        .run()
        .await
        .unwrap();
    let events = report.history.events();
    assert!(!events.is_empty());

    for (i, pair) in events.windows(2).enumerate() {
        assert_eq!(pair[0].index, i as u64);
        assert!(pair[0].time <= pair[1].time, "time went backwards at {}", i);
    }

    let mut open: HashMap<Process, bool> = HashMap::new();
    for event in events {
        let outstanding = open.entry(event.op.process).or_insert(false);
        if event.op.kind == EventKind::Invoke {
            assert!(!*outstanding, "double invoke at {}", event.index);
            *outstanding = true;
        } else {
            assert!(*outstanding, "completion without invoke at {}", event.index);
            *outstanding = false;
        }
    }
    // Sealed after the run, so nothing is left in flight
    assert!(open.values().all(|outstanding| !outstanding));
}

#[tokio::test]
async fn test_split_brain_loses_acknowledged_write() {
    let cluster = MemoryCluster::new(3, Model::default(), Replication::SplitBrain).with_latency(Duration::ZERO);
    let nodes = cluster.nodes();
    let partition = Fault::majority_partition(&nodes);

    // The only worker talks to n1, which lands in the minority
    let clients = generator::round_robin(vec![
        generator::once(Action::Write {
            key: "x".into(),
            value: 1,
        })
        .window(Duration::from_millis(50), Duration::from_secs(2))
        .boxed(),
        generator::once(Action::Read { key: "x".into() })
            .window(Duration::from_millis(300), Duration::from_secs(2))
            .boxed(),
    ]);
    let nemesis = generator::sequence(vec![
        Action::Fault {
            fault: partition.clone(),
        },
        Action::Fault { fault: Fault::Heal },
    ])
    .throttle(Duration::from_millis(150));
    let gen = generator::split(clients, nemesis).time_limit(Duration::from_secs(1));

    let config = memory_config(&cluster)
        .with_concurrency(1)
        .with_time_limit(Duration::from_secs(1));
    let report = Test::new(config, Arc::new(cluster.clone()))
        .with_database(Arc::new(cluster.clone()))
        .with_nemesis(Box::new(cluster.nemesis()))
        .with_generator(gen.boxed())
        .run()
        .await
        .unwrap();

    assert_eq!(report.verdict.validity, Validity::Invalid);
    assert!(!report.passed());
    let anomaly = &report.verdict.anomalies[0];
    assert_eq!(anomaly.kind, AnomalyKind::NonLinearizable);
    assert!(anomaly.ops.iter().any(|op| op.value == Some(Value::Nil)));
    assert!(anomaly
        .faults
        .iter()
        .any(|op| op.action == Action::Fault { fault: partition.clone() }));
}

/// Single register whose connections to `slow` take long in teardown
#[derive(Clone, Default)]
struct SlowTeardownClient {
    register: Arc<Mutex<Option<i64>>>,
    /// Never finish teardown instead of finishing late
    hang: bool,
}

struct SlowTeardownConnection {
    register: Arc<Mutex<Option<i64>>>,
    slow: bool,
    hang: bool,
}

#[async_trait]
impl Client for SlowTeardownClient {
    async fn open(&self, node: &str) -> Result<Box<dyn Connection>, ClientError> {
        Ok(Box::new(SlowTeardownConnection {
            register: self.register.clone(),
            slow: node == "slow",
            hang: self.hang,
        }))
    }
}

#[async_trait]
impl Connection for SlowTeardownConnection {
    async fn invoke(&mut self, action: &Action) -> Result<Option<Value>, ClientError> {
        let mut register = self.register.lock();
        match action {
            Action::Read { .. } => Ok(Some(register.map_or(Value::Nil, Value::Int))),
            Action::Write { value, .. } => {
                *register = Some(*value);
                Ok(None)
            }
            Action::Cas { expected, new, .. } if *register == Some(*expected) => {
                *register = Some(*new);
                Ok(None)
            }
            Action::Cas { .. } => Err(ClientError::Rejected("precondition failed".into())),
            other => Err(ClientError::Unsupported(other.to_string())),
        }
    }

    async fn teardown(&mut self) -> Result<(), ClientError> {
        if self.slow && self.hang {
            return std::future::pending().await;
        }
        if self.slow {
            tokio::time::sleep(Duration::from_millis(600)).await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_broken_teardown_barrier_still_checks_history() {
    let config = TestConfig::default()
        .with_nodes(vec!["fast".into(), "slow".into()])
        .with_concurrency(2)
        .with_time_limit(Duration::from_millis(200))
        .with_op_limit(20)
        .with_barrier_grace(Duration::from_millis(150));

    // Teardown ends up slower than the grace period but within the op timeout
    let report = Test::new(config, Arc::new(SlowTeardownClient::default()))
        .run()
        .await
        .unwrap();

    assert_eq!(report.verdict.validity, Validity::Valid);
    assert!(report.verdict.stats.ok > 0);
    assert!(!report.passed());
    assert!(report
        .verdict
        .harness_faults
        .iter()
        .any(|f| matches!(f, HarnessFault::BrokenBarrier { phase: Phase::Analyzing, .. })));
}

#[tokio::test]
async fn test_hung_teardown_does_not_block_the_run() {
    let config = TestConfig::default()
        .with_nodes(vec!["fast".into(), "slow".into()])
        .with_concurrency(2)
        .with_time_limit(Duration::from_millis(200))
        .with_op_timeout(Duration::from_millis(100))
        .with_barrier_grace(Duration::from_millis(150));
    let client = SlowTeardownClient {
        hang: true,
        ..Default::default()
    };

    let run = Test::new(config, Arc::new(client)).run();
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run finishes despite a hung teardown")
        .unwrap();

    assert_eq!(report.verdict.validity, Validity::Valid);
    assert!(report.verdict.stats.ok > 0);
    assert!(!report.passed());
    assert!(report.verdict.harness_faults.contains(&HarnessFault::Stalled {
        process: Process::Client(1),
        stage: "connection teardown".into(),
    }));
}

#[tokio::test]
async fn test_lost_acknowledgements_stay_linearizable() {
    let cluster = MemoryCluster::new(3, Model::default(), Replication::Quorum).with_ack_loss(0.2);
    let config = memory_config(&cluster);

    let report = Test::new(config, Arc::new(cluster.clone()))
        .with_database(Arc::new(cluster))
        .run()
        .await
        .unwrap();

    assert!(report.verdict.stats.info > 0);
    assert_eq!(report.verdict.validity, Validity::Valid, "{:?}", report.verdict.anomalies);
    assert!(report.passed(), "harness faults: {:?}", report.verdict.harness_faults);
}

#[tokio::test]
async fn test_stored_run_rechecks_to_same_verdict() {
    let cluster = MemoryCluster::new(3, Model::Set, Replication::Quorum);
    let dir = TempDir::new().unwrap();
    let config = memory_config(&cluster)
        .with_name("replay")
        .with_model(Model::Set)
        .with_store_dir(dir.path());

    let report = Test::new(config.clone(), Arc::new(cluster.clone()))
        .with_database(Arc::new(cluster))
        .run()
        .await
        .unwrap();
    assert!(report.passed());

    let store = RunStore::new(dir.path());
    let saved = store.save(&config, &report.history, &report.verdict).unwrap();
    let run = store.resolve("replay", None).unwrap();
    assert_eq!(run, saved);

    let history = store.load_history(&run).unwrap();
    assert_eq!(history, report.history);
    let stored_config = store.load_config(&run).unwrap();
    let verdict = Checker::new(stored_config.model)
        .with_config(stored_config.checker)
        .check(&history)
        .unwrap();
    let verdict = verdict.with_harness(
        report.verdict.harness_faults.clone(),
        report.verdict.harness_warnings.clone(),
    );
    assert_eq!(verdict, report.verdict);
}
