//! Client workers
//!
//! Each worker is one long-lived task with a fixed process identity and an
//! exclusively owned connection. It records every invocation and its outcome
//! to the shared history and never retries on its own.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{Client, Connection};
use crate::error::{ClientError, HarnessFault, HarnessWarning};
use crate::generator::{BoxGenerator, Context, Generator, Next};
use crate::history::{Action, EventKind, HistoryLog, Operation, Process};
use crate::phase::{AbortSignal, Phase, PhaseBarrier, PhaseWatch};

/// Pull the next action for `process`, sleeping through `Wait`s
///
/// Returns `None` when the generator is exhausted, the phase is no longer
/// active, or the run is aborted.
pub(crate) async fn next_action(
    generator: &dyn Generator,
    history: &HistoryLog,
    phase: &PhaseWatch,
    abort: &AbortSignal,
    process: Process,
    last: Option<&Operation>,
) -> Option<Action> {
    loop {
        if abort.is_triggered() || !phase.is_active() {
            return None;
        }
        let ctx = Context::new(history.elapsed(), process).with_last(last);
        match generator.next(&ctx) {
            Next::Op(action) => return Some(action),
            Next::Exhausted => return None,
            Next::Wait(wait) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = abort.triggered() => return None,
                }
            }
        }
    }
}

/// Shared run plumbing handed to every participant
#[derive(Clone)]
pub struct Participants {
    pub generator: BoxGenerator,
    pub history: Arc<HistoryLog>,
    pub barrier: Arc<PhaseBarrier>,
    pub abort: AbortSignal,
    /// Upper bound on a single client call or fault action
    pub op_timeout: Duration,
}

/// What a participant reports back to the controller
#[derive(Debug, Default)]
pub struct ParticipantReport {
    pub invocations: usize,
    pub faults: Vec<HarnessFault>,
    pub warnings: Vec<HarnessWarning>,
}

/// A client worker bound to one process identity and one node
pub struct Worker {
    process: Process,
    node: String,
    client: Arc<dyn Client>,
    shared: Participants,
}

impl Worker {
    pub fn new(id: u64, node: String, client: Arc<dyn Client>, shared: Participants) -> Self {
        Worker {
            process: Process::Client(id),
            node,
            client,
            shared,
        }
    }

    pub fn process(&self) -> Process {
        self.process
    }

    /// Run the worker through setup, active, teardown and into analyzing
    pub async fn run(self) -> ParticipantReport {
        let mut report = ParticipantReport::default();
        let barrier = self.shared.barrier.clone();

        let conn = match self.open().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::error!(process = %self.process, node = %self.node, "connection unavailable: {}", e);
                report.faults.push(HarnessFault::ClientUnavailable {
                    process: self.process,
                    reason: e.to_string(),
                });
                None
            }
        };

        barrier.wait(Phase::Active).await;

        let mut conn = conn;
        if let Some(conn) = conn.as_mut() {
            if let Err(fault) = self.active(&mut **conn, &mut report).await {
                self.shared.abort.trigger(format!("{} hit a harness fault", self.process));
                report.faults.push(fault);
            }
        }

        barrier.wait(Phase::Teardown).await;

        if let Some(conn) = conn {
            self.close(conn, &mut report).await;
        }

        barrier.wait(Phase::Analyzing).await;
        report
    }

    async fn open(&self) -> Result<Box<dyn Connection>, ClientError> {
        let opened = tokio::time::timeout(self.shared.op_timeout, async {
            let mut conn = self.client.open(&self.node).await?;
            conn.setup().await?;
            Ok::<_, ClientError>(conn)
        })
        .await;
        opened.unwrap_or(Err(ClientError::Timeout))
    }

    /// Tear down and close the connection, bounded by the operation timeout
    async fn close(&self, mut conn: Box<dyn Connection>, report: &mut ParticipantReport) {
        let timeout = self.shared.op_timeout;
        let torn_down = tokio::time::timeout(timeout, conn.teardown()).await;
        let closed = match torn_down {
            Ok(Ok(())) => tokio::time::timeout(timeout, conn.close()).await.map_err(|_| "close"),
            Ok(Err(e)) => Ok(Err(e)),
            Err(_) => Err("teardown"),
        };

        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.warnings.push(HarnessWarning::ClientTeardown {
                process: self.process,
                reason: e.to_string(),
            }),
            Err(stage) => {
                tracing::error!(process = %self.process, node = %self.node, "connection {} stalled past {:?}", stage, timeout);
                report.faults.push(HarnessFault::Stalled {
                    process: self.process,
                    stage: format!("connection {}", stage),
                });
            }
        }
    }

    /// The active-phase loop; returns only a harness fault as an error
    async fn active(
        &self,
        conn: &mut dyn Connection,
        report: &mut ParticipantReport,
    ) -> Result<(), HarnessFault> {
        let phase = self.shared.barrier.watch();
        let mut last: Option<Operation> = None;

        while let Some(action) = next_action(
            self.shared.generator.as_ref(),
            &self.shared.history,
            &phase,
            &self.shared.abort,
            self.process,
            last.as_ref(),
        )
        .await
        {
            report.invocations += 1;
            last = Some(self.execute(conn, action).await?);
        }

        tracing::debug!(process = %self.process, invocations = report.invocations, "worker done");
        Ok(())
    }

    /// Invoke one action and record both of its events
    async fn execute(&self, conn: &mut dyn Connection, action: Action) -> Result<Operation, HarnessFault> {
        let history = &self.shared.history;
        history
            .record(Operation::invoke(self.process, action.clone()))
            .map_err(|e| self.invariant(e))?;

        let outcome = tokio::time::timeout(self.shared.op_timeout, conn.invoke(&action)).await;
        let completion = match outcome {
            Ok(Ok(value)) => Operation::ok(self.process, action, value),
            Ok(Err(e)) if e.is_definite() => Operation::fail(self.process, action, e.to_string()),
            Ok(Err(e)) => Operation::info(self.process, action, e.to_string()),
            Err(_) => Operation::info(self.process, action, ClientError::Timeout.to_string()),
        };
        if completion.kind == EventKind::Info {
            tracing::debug!(process = %self.process, action = %completion.action, "ambiguous outcome");
        }

        history.record(completion).map(|e| e.op).map_err(|e| self.invariant(e))
    }

    fn invariant(&self, e: crate::error::HistoryError) -> HarnessFault {
        tracing::error!(process = %self.process, "history rejected event: {}", e);
        HarnessFault::HistoryInvariant {
            process: self.process,
            reason: e.to_string(),
        }
    }
}
