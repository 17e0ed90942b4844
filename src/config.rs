//! Test configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::checker::{CheckerConfig, Model};
use crate::error::HarnessError;
use crate::generator::{self, BoxGenerator, GeneratorExt};
use crate::nemesis::Fault;

/// Durations are written as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Kinds of fault a schedule can be built from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// Isolate a random minority
    Partition,
    /// Kill a random node
    Kill,
    /// Skew a random node's clock
    ClockSkew,
}

impl FaultKind {
    /// A concrete fault of this kind against `nodes`
    pub fn instantiate(&self, nodes: &[String]) -> Option<Fault> {
        let mut rng = rand::rng();
        match self {
            FaultKind::Partition => {
                if nodes.len() < 2 {
                    return None;
                }
                let mut shuffled = nodes.to_vec();
                shuffled.shuffle(&mut rng);
                Some(Fault::majority_partition(&shuffled))
            }
            FaultKind::Kill => nodes.choose(&mut rng).map(|node| Fault::Kill { node: node.clone() }),
            FaultKind::ClockSkew => {
                let offset_ms = rng.random_range(100..=2000) * if rng.random::<bool>() { 1 } else { -1 };
                nodes.choose(&mut rng).map(|node| Fault::ClockSkew {
                    node: node.clone(),
                    offset_ms,
                })
            }
        }
    }
}

impl std::str::FromStr for FaultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partition" => Ok(FaultKind::Partition),
            "kill" => Ok(FaultKind::Kill),
            "clock-skew" | "skew" => Ok(FaultKind::ClockSkew),
            other => Err(format!("unknown fault kind {:?}", other)),
        }
    }
}

/// Shape of the client workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Keys the workload spreads operations over
    pub keys: Vec<String>,
    /// Register model: fraction of writes
    pub write_ratio: f64,
    /// Register model: fraction of compare-and-sets
    pub cas_ratio: f64,
    /// Set and counter models: fraction of reads
    pub read_ratio: f64,
    /// Minimum gap between two client operations, across all workers
    #[serde(with = "opt_millis")]
    pub op_interval: Option<Duration>,
    /// Stop after this many client operations
    pub op_limit: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            keys: vec!["x".to_string()],
            write_ratio: 0.4,
            cas_ratio: 0.1,
            read_ratio: 0.5,
            op_interval: Some(Duration::from_millis(10)),
            op_limit: None,
        }
    }
}

/// Fault schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NemesisConfig {
    /// Faults injected in turn, each followed by its heal
    pub faults: Vec<Fault>,
    /// Gap between a fault and its heal, and between a heal and the next fault
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl Default for NemesisConfig {
    fn default() -> Self {
        NemesisConfig {
            faults: Vec::new(),
            interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for one test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Test name; runs are stored under it
    pub name: String,
    /// Node addresses (format: "host:port")
    pub nodes: Vec<String>,
    /// Number of client workers
    pub concurrency: usize,
    /// How long the active phase hands out operations (default: 10s)
    #[serde(with = "millis")]
    pub time_limit: Duration,
    /// Bound on a single client call or fault action (default: 1s)
    #[serde(with = "millis")]
    pub op_timeout: Duration,
    /// How long a phase barrier waits for stragglers (default: 5s)
    #[serde(with = "millis")]
    pub barrier_grace: Duration,
    pub model: Model,
    pub workload: WorkloadConfig,
    pub nemesis: NemesisConfig,
    pub checker: CheckerConfig,
    /// Root directory for stored runs
    pub store_dir: PathBuf,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            name: "register".to_string(),
            nodes: vec![
                "127.0.0.1:8081".to_string(),
                "127.0.0.1:8082".to_string(),
                "127.0.0.1:8083".to_string(),
            ],
            concurrency: 5,
            time_limit: Duration::from_secs(10),
            op_timeout: Duration::from_secs(1),
            barrier_grace: Duration::from_secs(5),
            model: Model::default(),
            workload: WorkloadConfig::default(),
            nemesis: NemesisConfig::default(),
            checker: CheckerConfig::default(),
            store_dir: PathBuf::from("store"),
        }
    }
}

impl TestConfig {
    /// Read a configuration from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_barrier_grace(mut self, grace: Duration) -> Self {
        self.barrier_grace = grace;
        self
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.model = model;
        self
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.workload.keys = keys;
        self
    }

    /// Set the gap between client operations; `None` removes the throttle
    pub fn with_op_interval(mut self, interval: Option<Duration>) -> Self {
        self.workload.op_interval = interval;
        self
    }

    pub fn with_op_limit(mut self, limit: u64) -> Self {
        self.workload.op_limit = Some(limit);
        self
    }

    pub fn with_faults(mut self, faults: Vec<Fault>, interval: Duration) -> Self {
        self.nemesis.faults = faults;
        self.nemesis.interval = interval;
        self
    }

    pub fn with_max_states(mut self, max_states: usize) -> Self {
        self.checker.max_states = max_states;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    /// Reject configurations a run cannot be started with
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(HarnessError::Config(format!("invalid test name {:?}", self.name)));
        }
        if self.nodes.is_empty() {
            return Err(HarnessError::Config("at least one node is required".into()));
        }
        if self.concurrency == 0 {
            return Err(HarnessError::Config("concurrency must be at least 1".into()));
        }
        if self.workload.keys.is_empty() {
            return Err(HarnessError::Config("at least one key is required".into()));
        }
        let w = &self.workload;
        let ratios = [w.write_ratio, w.cas_ratio, w.read_ratio];
        if ratios.iter().any(|r| !(0.0..=1.0).contains(r)) || w.write_ratio + w.cas_ratio > 1.0 {
            return Err(HarnessError::Config("workload ratios must lie within [0, 1]".into()));
        }
        Ok(())
    }

    /// Overall deadline after which the run is aborted
    pub fn deadline(&self) -> Duration {
        self.time_limit + self.op_timeout + self.barrier_grace
    }

    /// Past this the controller stops waiting for participants and cancels them
    ///
    /// After an abort at [`deadline`](Self::deadline) a participant still has
    /// to clear two barriers and a bounded teardown.
    pub fn join_deadline(&self) -> Duration {
        self.deadline() + 2 * self.barrier_grace + 2 * self.op_timeout
    }

    /// Build the run's generator: the model's workload for clients, the
    /// fault schedule for the nemesis, all bounded by the time limit
    pub fn generator(&self) -> BoxGenerator {
        let keys = self.workload.keys.clone();
        let workload: BoxGenerator = match self.model {
            Model::Register { .. } => {
                generator::register_workload(keys, self.workload.write_ratio, self.workload.cas_ratio).boxed()
            }
            Model::Set => generator::set_workload(keys, self.workload.read_ratio).boxed(),
            Model::Counter => generator::counter_workload(keys, self.workload.read_ratio).boxed(),
        };
        let workload = match self.workload.op_limit {
            Some(n) => workload.limit(n).boxed(),
            None => workload,
        };
        let workload = match self.workload.op_interval {
            Some(interval) => workload.throttle(interval).boxed(),
            None => workload,
        };

        let gen = if self.nemesis.faults.is_empty() {
            generator::clients_only(workload)
        } else {
            generator::split(
                workload,
                generator::nemesis_schedule(self.nemesis.faults.clone(), self.nemesis.interval),
            )
        };
        gen.time_limit(self.time_limit).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{Context, Generator, Next};
    use crate::history::{Action, Process};

    #[test]
    fn test_config_default() {
        let config = TestConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.model, Model::Register { initial: None });
        assert_eq!(config.deadline(), Duration::from_secs(16));
        config.validate().unwrap();
    }

    #[test]
    fn test_builder_methods() {
        let config = TestConfig::default()
            .with_name("set-under-partition")
            .with_concurrency(2)
            .with_model(Model::Set)
            .with_op_limit(10)
            .with_max_states(500);
        assert_eq!(config.name, "set-under-partition");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.workload.op_limit, Some(10));
        assert_eq!(config.checker.max_states, 500);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(TestConfig::default().with_concurrency(0).validate().is_err());
        assert!(TestConfig::default().with_nodes(Vec::new()).validate().is_err());
        assert!(TestConfig::default().with_name("a/b").validate().is_err());
    }

    #[test]
    fn test_json_uses_millis_and_defaults() {
        let config: TestConfig =
            serde_json::from_str(r#"{"name": "quick", "time_limit": 1500, "model": {"type": "counter"}}"#).unwrap();
        assert_eq!(config.name, "quick");
        assert_eq!(config.time_limit, Duration::from_millis(1500));
        assert_eq!(config.model, Model::Counter);
        assert_eq!(config.concurrency, 5);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["op_timeout"], 1000);
        assert_eq!(json["workload"]["op_interval"], 10);
    }

    #[test]
    fn test_generator_routes_by_process() {
        let nodes = TestConfig::default().nodes;
        let config = TestConfig::default()
            .with_model(Model::Counter)
            .with_op_interval(None)
            .with_faults(vec![Fault::majority_partition(&nodes)], Duration::from_millis(1));
        let gen = config.generator();

        let client = gen.next(&Context::new(Duration::ZERO, Process::Client(0)));
        assert!(matches!(client, Next::Op(Action::Read { .. } | Action::Increment { .. })));
        let nemesis = gen.next(&Context::new(Duration::ZERO, Process::Nemesis));
        assert!(matches!(nemesis, Next::Op(Action::Fault { .. })));

        let late = gen.next(&Context::new(Duration::from_secs(60), Process::Client(0)));
        assert!(matches!(late, Next::Exhausted));
    }

    #[test]
    fn test_fault_kinds() {
        let nodes: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        assert!(matches!(
            FaultKind::Partition.instantiate(&nodes),
            Some(Fault::Partition { .. })
        ));
        assert!(FaultKind::Partition.instantiate(&nodes[..1]).is_none());
        assert!(matches!(
            "skew".parse::<FaultKind>(),
            Ok(FaultKind::ClockSkew)
        ));
        assert!("flood".parse::<FaultKind>().is_err());
    }
}
