//! In-process system under test
//!
//! [`MemoryCluster`] is a replicated key-value store simulated in memory. It
//! implements [`Client`] and [`Database`], and hands out a [`MemoryNemesis`]
//! that partitions, kills and skews its nodes. It comes in two flavors:
//!
//! - [`Replication::Quorum`]: nodes cut off from the majority refuse every
//!   operation, so histories stay linearizable
//! - [`Replication::SplitBrain`]: minority nodes keep serving from a private
//!   copy that is thrown away when the partition heals, losing writes

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::checker::Model;
use crate::client::{Client, Connection, Database};
use crate::error::{ClientError, NemesisError};
use crate::history::{Action, Value};
use crate::nemesis::{Fault, Nemesis};

/// How the simulated cluster behaves under partition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replication {
    Quorum,
    SplitBrain,
}

/// Contents of one replica
#[derive(Clone, Debug, Default)]
struct Replica {
    registers: HashMap<String, i64>,
    sets: HashMap<String, BTreeSet<i64>>,
    counters: HashMap<String, i64>,
}

impl Replica {
    fn apply(&mut self, model: &Model, action: &Action) -> Result<Option<Value>, ClientError> {
        match action {
            Action::Read { key } => Ok(Some(match model {
                Model::Register { initial } => match self.registers.get(key).copied().or(*initial) {
                    Some(v) => Value::Int(v),
                    None => Value::Nil,
                },
                Model::Set => Value::Set(
                    self.sets
                        .get(key)
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default(),
                ),
                Model::Counter => Value::Int(self.counters.get(key).copied().unwrap_or(0)),
            })),
            Action::Write { key, value } => {
                self.registers.insert(key.clone(), *value);
                Ok(None)
            }
            Action::Cas { key, expected, new } => {
                let current = self.registers.get(key).copied().or(match model {
                    Model::Register { initial } => *initial,
                    _ => None,
                });
                if current != Some(*expected) {
                    return Err(ClientError::Rejected(format!(
                        "expected {} but found {}",
                        expected,
                        current.map_or("nil".to_string(), |v| v.to_string())
                    )));
                }
                self.registers.insert(key.clone(), *new);
                Ok(None)
            }
            Action::Add { key, element } => {
                self.sets.entry(key.clone()).or_default().insert(*element);
                Ok(None)
            }
            Action::Increment { key, delta } => {
                *self.counters.entry(key.clone()).or_insert(0) += delta;
                Ok(None)
            }
            Action::Fault { .. } => Err(ClientError::Unsupported(action.to_string())),
        }
    }
}

struct ClusterState {
    nodes: Vec<String>,
    /// What the majority side sees
    primary: Replica,
    /// Private copies served by minority nodes in split-brain mode
    isolated: HashMap<String, Replica>,
    partition: Option<Vec<Vec<String>>>,
    killed: BTreeSet<String>,
    skewed: HashMap<String, i64>,
    running: bool,
}

impl ClusterState {
    fn in_majority(&self, node: &str) -> bool {
        match &self.partition {
            None => true,
            Some(groups) => groups
                .iter()
                .any(|g| g.len() * 2 > self.nodes.len() && g.iter().any(|n| n == node)),
        }
    }

    fn check_node(&self, node: &str) -> Result<(), NemesisError> {
        if self.nodes.iter().any(|n| n == node) {
            Ok(())
        } else {
            Err(NemesisError::UnknownNode(node.to_string()))
        }
    }
}

/// Shared handle to a simulated cluster
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    model: Model,
    replication: Replication,
    /// Upper bound on simulated request latency
    latency: Duration,
    /// Probability that an applied operation loses its acknowledgement
    ack_loss: f64,
}

impl MemoryCluster {
    /// A cluster of `count` nodes named `n1..=count`
    pub fn new(count: usize, model: Model, replication: Replication) -> Self {
        let nodes = (1..=count).map(|i| format!("n{}", i)).collect();
        MemoryCluster {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                primary: Replica::default(),
                isolated: HashMap::new(),
                partition: None,
                killed: BTreeSet::new(),
                skewed: HashMap::new(),
                running: false,
            })),
            model,
            replication,
            latency: Duration::from_millis(2),
            ack_loss: 0.0,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_ack_loss(mut self, probability: f64) -> Self {
        self.ack_loss = probability;
        self
    }

    pub fn nodes(&self) -> Vec<String> {
        self.state.lock().nodes.clone()
    }

    /// A nemesis acting on this cluster
    pub fn nemesis(&self) -> MemoryNemesis {
        MemoryNemesis {
            cluster: self.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether no fault is currently in effect
    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        state.partition.is_none() && state.killed.is_empty() && state.skewed.is_empty()
    }

    fn execute(&self, node: &str, action: &Action) -> Result<Option<Value>, ClientError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(ClientError::Network("cluster is not running".into()));
        }
        if state.killed.contains(node) {
            return Err(ClientError::Network(format!("connection refused by {}", node)));
        }

        if state.in_majority(node) {
            return state.primary.apply(&self.model, action);
        }
        match self.replication {
            Replication::Quorum => Err(ClientError::Rejected(format!("{} cannot reach a quorum", node))),
            Replication::SplitBrain => {
                let ClusterState { primary, isolated, .. } = &mut *state;
                isolated
                    .entry(node.to_string())
                    .or_insert_with(|| primary.clone())
                    .apply(&self.model, action)
            }
        }
    }
}

#[async_trait]
impl Client for MemoryCluster {
    async fn open(&self, node: &str) -> Result<Box<dyn Connection>, ClientError> {
        if !self.state.lock().nodes.iter().any(|n| n == node) {
            return Err(ClientError::Network(format!("unknown node {}", node)));
        }
        Ok(Box::new(MemoryConnection {
            cluster: self.clone(),
            node: node.to_string(),
        }))
    }
}

#[async_trait]
impl Database for MemoryCluster {
    async fn setup(&self, _nodes: &[String]) -> Result<(), String> {
        let mut state = self.state.lock();
        state.primary = Replica::default();
        state.isolated.clear();
        state.partition = None;
        state.killed.clear();
        state.skewed.clear();
        state.running = true;
        Ok(())
    }

    async fn teardown(&self, _nodes: &[String]) -> Result<(), String> {
        self.state.lock().running = false;
        Ok(())
    }
}

/// One worker's connection to a [`MemoryCluster`] node
pub struct MemoryConnection {
    cluster: MemoryCluster,
    node: String,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn invoke(&mut self, action: &Action) -> Result<Option<Value>, ClientError> {
        let (before, after, lose_ack) = {
            let mut rng = rand::rng();
            let latency = self.cluster.latency.as_micros() as u64;
            let jitter = |rng: &mut rand::rngs::ThreadRng| Duration::from_micros(rng.random_range(0..=latency));
            (
                jitter(&mut rng),
                jitter(&mut rng),
                rng.random::<f64>() < self.cluster.ack_loss,
            )
        };

        tokio::time::sleep(before).await;
        let result = self.cluster.execute(&self.node, action);
        tokio::time::sleep(after).await;

        match result {
            Ok(_) if lose_ack => Err(ClientError::Timeout),
            other => other,
        }
    }
}

/// Fault injection against a [`MemoryCluster`]
pub struct MemoryNemesis {
    cluster: MemoryCluster,
}

#[async_trait]
impl Nemesis for MemoryNemesis {
    async fn invoke(&mut self, fault: &Fault) -> Result<Option<Value>, NemesisError> {
        let mut state = self.cluster.state.lock();
        match fault {
            Fault::Partition { groups } => {
                for node in groups.iter().flatten() {
                    state.check_node(node)?;
                }
                state.partition = Some(groups.clone());
                state.isolated.clear();
            }
            Fault::Heal => {
                // Minority copies are discarded, along with whatever they accepted
                let lost = state.isolated.len();
                state.partition = None;
                state.isolated.clear();
                if lost > 0 {
                    tracing::debug!(replicas = lost, "discarded diverged replicas");
                }
            }
            Fault::Kill { node } => {
                state.check_node(node)?;
                state.killed.insert(node.clone());
            }
            Fault::Restart { node } => {
                state.check_node(node)?;
                state.killed.remove(node);
            }
            Fault::ClockSkew { node, offset_ms } => {
                state.check_node(node)?;
                state.skewed.insert(node.clone(), *offset_ms);
            }
            Fault::ResetClock { node } => {
                state.check_node(node)?;
                state.skewed.remove(node);
            }
        }
        Ok(Some(Value::Text(fault.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(value: i64) -> Action {
        Action::Write {
            key: "x".to_string(),
            value,
        }
    }

    fn read() -> Action {
        Action::Read { key: "x".to_string() }
    }

    async fn started(replication: Replication) -> MemoryCluster {
        let cluster = MemoryCluster::new(3, Model::default(), replication).with_latency(Duration::ZERO);
        cluster.setup(&cluster.nodes()).await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_register_operations() {
        let cluster = started(Replication::Quorum).await;
        let mut conn = cluster.open("n1").await.unwrap();

        assert_eq!(conn.invoke(&read()).await.unwrap(), Some(Value::Nil));
        conn.invoke(&write(4)).await.unwrap();
        assert_eq!(conn.invoke(&read()).await.unwrap(), Some(Value::Int(4)));

        let cas = Action::Cas {
            key: "x".into(),
            expected: 3,
            new: 5,
        };
        assert!(conn.invoke(&cas).await.unwrap_err().is_definite());
    }

    #[tokio::test]
    async fn test_quorum_mode_rejects_minority() {
        let cluster = started(Replication::Quorum).await;
        let mut nemesis = cluster.nemesis();
        nemesis
            .invoke(&Fault::majority_partition(&cluster.nodes()))
            .await
            .unwrap();

        let mut minority = cluster.open("n1").await.unwrap();
        let mut majority = cluster.open("n2").await.unwrap();
        assert!(minority.invoke(&write(1)).await.unwrap_err().is_definite());
        majority.invoke(&write(2)).await.unwrap();

        nemesis.invoke(&Fault::Heal).await.unwrap();
        assert_eq!(minority.invoke(&read()).await.unwrap(), Some(Value::Int(2)));
        assert!(cluster.is_healthy());
    }

    #[tokio::test]
    async fn test_split_brain_loses_minority_writes() {
        let cluster = started(Replication::SplitBrain).await;
        let mut nemesis = cluster.nemesis();
        let mut minority = cluster.open("n1").await.unwrap();

        nemesis
            .invoke(&Fault::majority_partition(&cluster.nodes()))
            .await
            .unwrap();
        minority.invoke(&write(9)).await.unwrap();
        assert_eq!(minority.invoke(&read()).await.unwrap(), Some(Value::Int(9)));

        nemesis.invoke(&Fault::Heal).await.unwrap();
        assert_eq!(minority.invoke(&read()).await.unwrap(), Some(Value::Nil));
    }

    #[tokio::test]
    async fn test_killed_node_is_ambiguous() {
        let cluster = started(Replication::Quorum).await;
        let mut nemesis = cluster.nemesis();
        nemesis.invoke(&Fault::Kill { node: "n3".into() }).await.unwrap();

        let mut conn = cluster.open("n3").await.unwrap();
        assert!(!conn.invoke(&read()).await.unwrap_err().is_definite());

        let err = nemesis.invoke(&Fault::Kill { node: "n9".into() }).await.unwrap_err();
        assert!(matches!(err, NemesisError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_set_and_counter_reads() {
        let set = MemoryCluster::new(1, Model::Set, Replication::Quorum);
        set.setup(&set.nodes()).await.unwrap();
        let mut conn = set.open("n1").await.unwrap();
        for element in [3, 1] {
            conn.invoke(&Action::Add {
                key: "s".into(),
                element,
            })
            .await
            .unwrap();
        }
        assert_eq!(
            conn.invoke(&Action::Read { key: "s".into() }).await.unwrap(),
            Some(Value::Set(vec![1, 3]))
        );

        let counter = MemoryCluster::new(1, Model::Counter, Replication::Quorum);
        counter.setup(&counter.nodes()).await.unwrap();
        let mut conn = counter.open("n1").await.unwrap();
        conn.invoke(&Action::Increment {
            key: "c".into(),
            delta: 2,
        })
        .await
        .unwrap();
        assert_eq!(
            conn.invoke(&Action::Read { key: "c".into() }).await.unwrap(),
            Some(Value::Int(2))
        );
    }
}
