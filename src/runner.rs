//! Run controller
//!
//! Orchestrates one test: sets up the database, spawns the workers and the
//! fault injector, drives them through the phases, then seals the history and
//! checks it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::checker::{Checker, Verdict};
use crate::client::{Client, Database, NoopDatabase};
use crate::config::TestConfig;
use crate::error::{HarnessError, HarnessFault, HarnessWarning};
use crate::generator::BoxGenerator;
use crate::history::{History, HistoryLog, Process};
use crate::nemesis::{FaultInjector, Nemesis, NoopNemesis};
use crate::phase::{AbortSignal, Phase, PhaseBarrier};
use crate::worker::{ParticipantReport, Participants, Worker};

/// Result of a completed run
#[derive(Debug)]
pub struct RunReport {
    pub verdict: Verdict,
    pub history: History,
    pub duration: Duration,
}

impl RunReport {
    /// Valid history and no harness faults
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// A configured test, ready to run
///
/// # Example
///
/// ```ignore
/// use faultline::{Test, TestConfig};
/// use faultline::client::HttpClient;
///
/// let config = TestConfig::default().with_concurrency(3);
/// let client = HttpClient::new(config.nodes.clone(), config.op_timeout);
/// let report = Test::new(config, Arc::new(client)).run().await?;
/// assert!(report.passed());
/// ```
pub struct Test {
    config: TestConfig,
    client: Arc<dyn Client>,
    database: Arc<dyn Database>,
    nemesis: Box<dyn Nemesis>,
    generator: Option<BoxGenerator>,
    handle_interrupts: bool,
}

impl Test {
    pub fn new(config: TestConfig, client: Arc<dyn Client>) -> Self {
        Test {
            config,
            client,
            database: Arc::new(NoopDatabase),
            nemesis: Box::new(NoopNemesis),
            generator: None,
            handle_interrupts: false,
        }
    }

    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = database;
        self
    }

    pub fn with_nemesis(mut self, nemesis: Box<dyn Nemesis>) -> Self {
        self.nemesis = nemesis;
        self
    }

    /// Replace the generator the configuration would build
    pub fn with_generator(mut self, generator: BoxGenerator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Abort the run on Ctrl-C
    pub fn with_interrupts(mut self) -> Self {
        self.handle_interrupts = true;
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Run the test to completion and check its history
    ///
    /// Errors are reserved for failures that leave nothing to check. Anything
    /// that goes wrong once participants are running is recorded as a harness
    /// fault on the verdict instead.
    pub async fn run(self) -> Result<RunReport, HarnessError> {
        let start = Instant::now();
        self.config.validate()?;
        let config = &self.config;

        tracing::info!(
            test = %config.name,
            nodes = config.nodes.len(),
            concurrency = config.concurrency,
            "setting up database"
        );
        self.database
            .setup(&config.nodes)
            .await
            .map_err(HarnessError::Database)?;

        let history = Arc::new(HistoryLog::new());
        let barrier = Arc::new(PhaseBarrier::new(config.concurrency + 1, config.barrier_grace));
        barrier.expect_at(Phase::Teardown, Instant::now() + config.time_limit);
        let abort = AbortSignal::new();
        let shared = Participants {
            generator: self.generator.clone().unwrap_or_else(|| config.generator()),
            history: history.clone(),
            barrier: barrier.clone(),
            abort: abort.clone(),
            op_timeout: config.op_timeout,
        };

        let mut handles = Vec::with_capacity(config.concurrency + 1);
        for id in 0..config.concurrency {
            let node = config.nodes[id % config.nodes.len()].clone();
            let worker = Worker::new(id as u64, node, self.client.clone(), shared.clone());
            handles.push((worker.process(), tokio::spawn(worker.run())));
        }
        let injector = FaultInjector::new(self.nemesis, config.nodes.clone(), shared);
        handles.push((Process::Nemesis, tokio::spawn(injector.run())));
        tracing::debug!(participants = barrier.participants(), "participants spawned");

        let watchdog = tokio::spawn(watchdog(abort.clone(), config.deadline(), self.handle_interrupts));

        let cutoff = Instant::now() + config.join_deadline();
        let results = join_participants(handles, cutoff).await;

        let mut faults = Vec::new();
        let mut warnings = Vec::new();
        let mut invocations = 0;
        for (process, result) in results {
            match result {
                Ok(ParticipantReport {
                    invocations: n,
                    faults: f,
                    warnings: w,
                }) => {
                    invocations += n;
                    faults.extend(f);
                    warnings.extend(w);
                }
                Err(reason) => {
                    tracing::error!(%process, "participant crashed: {}", reason);
                    faults.push(HarnessFault::ParticipantCrashed { process, reason });
                }
            }
        }
        watchdog.abort();

        // Crashed participants never arrive, so the barrier may still be behind
        barrier.advance(Phase::Analyzing);
        faults.extend(barrier.faults());
        if let Some(reason) = abort.reason() {
            faults.push(HarnessFault::Aborted { reason });
        }

        let history = history.snapshot();
        tracing::info!(events = history.len(), invocations, "history sealed");

        if let Err(reason) = self.database.teardown(&config.nodes).await {
            tracing::warn!("database teardown failed: {}", reason);
            faults.push(HarnessFault::Database { reason });
        }

        let verdict = Checker::new(config.model.clone())
            .with_config(config.checker.clone())
            .check(&history)?
            .with_harness(faults, warnings);
        barrier.advance(Phase::Done);

        log_summary(&verdict.harness_faults, &verdict.harness_warnings);
        tracing::info!(
            validity = ?verdict.validity,
            ok = verdict.stats.ok,
            fail = verdict.stats.fail,
            info = verdict.stats.info,
            anomalies = verdict.anomalies.len(),
            "run checked"
        );

        Ok(RunReport {
            verdict,
            history,
            duration: start.elapsed(),
        })
    }
}

/// Wait for every participant, cancelling whichever is still running at `cutoff`
async fn join_participants(
    handles: Vec<(Process, JoinHandle<ParticipantReport>)>,
    cutoff: Instant,
) -> Vec<(Process, Result<ParticipantReport, String>)> {
    let joins = handles.into_iter().map(|(process, mut handle)| async move {
        match tokio::time::timeout_at(cutoff, &mut handle).await {
            Ok(joined) => (process, joined.map_err(|e| e.to_string())),
            Err(_) => {
                handle.abort();
                (process, Err("still running at the join deadline, cancelled".to_string()))
            }
        }
    });
    futures::future::join_all(joins).await
}

/// Trigger abort at the deadline, or on Ctrl-C if asked to
async fn watchdog(abort: AbortSignal, deadline: Duration, interrupts: bool) {
    let interrupted = async {
        if interrupts {
            if tokio::signal::ctrl_c().await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = tokio::time::sleep(deadline) => {
            tracing::warn!(?deadline, "run deadline passed, aborting");
            abort.trigger(format!("deadline of {:?} passed", deadline));
        }
        _ = interrupted => {
            tracing::warn!("interrupted, aborting");
            abort.trigger("interrupted by operator");
        }
    }
}

fn log_summary(faults: &[HarnessFault], warnings: &[HarnessWarning]) {
    for fault in faults {
        tracing::error!(?fault, "harness fault");
    }
    for warning in warnings {
        tracing::warn!(?warning, "harness warning");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{Model, Validity};
    use crate::testing::{MemoryCluster, Replication};

    fn quick_config() -> TestConfig {
        TestConfig::default()
            .with_nodes(vec!["n1".into(), "n2".into(), "n3".into()])
            .with_concurrency(3)
            .with_time_limit(Duration::from_millis(200))
            .with_barrier_grace(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_run_against_healthy_cluster() {
        let cluster = MemoryCluster::new(3, Model::default(), Replication::Quorum);
        let report = Test::new(quick_config(), Arc::new(cluster.clone()))
            .with_database(Arc::new(cluster.clone()))
            .run()
            .await
            .unwrap();

        assert_eq!(report.verdict.validity, Validity::Valid);
        assert!(report.passed(), "faults: {:?}", report.verdict.harness_faults);
        assert!(report.verdict.stats.ok > 0);
        assert!(!cluster.is_running());
    }

    #[tokio::test]
    async fn test_join_cancels_participants_past_cutoff() {
        let stuck = tokio::spawn(async {
            std::future::pending::<()>().await;
            ParticipantReport::default()
        });
        let done = tokio::spawn(async {
            ParticipantReport {
                invocations: 7,
                ..Default::default()
            }
        });
        let handles = vec![(Process::Client(0), stuck), (Process::Nemesis, done)];

        let started = Instant::now();
        let results = join_participants(handles, started + Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(results[0].0, Process::Client(0));
        assert!(results[0].1.as_ref().is_err_and(|reason| reason.contains("cancelled")));
        assert_eq!(results[1].0, Process::Nemesis);
        assert_eq!(results[1].1.as_ref().map(|r| r.invocations).ok(), Some(7));
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let cluster = MemoryCluster::new(1, Model::default(), Replication::Quorum);
        let result = Test::new(quick_config().with_concurrency(0), Arc::new(cluster)).run().await;
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }
}
