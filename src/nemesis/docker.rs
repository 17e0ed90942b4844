//! Docker-based database lifecycle and nemesis
//!
//! [`DockerCluster`] brings a Docker Compose cluster up and down around a run.
//! [`DockerNemesis`] injects faults into its containers: crashes via
//! `docker kill`/`docker start`, partitions via `iptables` inside the
//! containers, and clock skew via `date`.
//!
//! Nodes are identified by their position in the node list: the i-th node
//! (0-based) runs in container `<prefix><i + 1>`. A cluster counts as up once
//! every node answers its readiness path with a success status.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;

use super::{Fault, Nemesis};
use crate::client::Database;
use crate::error::NemesisError;
use crate::history::Value;

/// Run `docker` with `args`, failing on a non-zero exit
async fn docker(args: &[&str]) -> Result<String, NemesisError> {
    let command = format!("docker {}", args.join(" "));
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| NemesisError::Spawn {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(NemesisError::Command {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Default container name prefix; node i runs in `node-<i>`
pub const DEFAULT_CONTAINER_PREFIX: &str = "node-";

/// Default readiness endpoint
pub const DEFAULT_READY_PATH: &str = "/health";

/// Manages a Docker Compose cluster for the lifetime of a run
pub struct DockerCluster {
    compose_file: String,
    node_count: usize,
    /// Host port of node 1's client API; node i listens on `api_base_port + i - 1`
    api_base_port: u16,
    /// Path every node must answer with a success status before the run starts
    ready_path: String,
    ready_timeout: Duration,
}

impl DockerCluster {
    pub fn new(compose_file: impl Into<String>, node_count: usize) -> Self {
        DockerCluster {
            compose_file: compose_file.into(),
            node_count,
            api_base_port: 9101,
            ready_path: DEFAULT_READY_PATH.to_string(),
            ready_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_base_port(mut self, port: u16) -> Self {
        self.api_base_port = port;
        self
    }

    pub fn with_ready_check(mut self, path: impl Into<String>, timeout: Duration) -> Self {
        self.ready_path = path.into();
        self.ready_timeout = timeout;
        self
    }

    /// Host-mapped API address for node `id` (1-based)
    pub fn node_api_addr(&self, id: usize) -> String {
        format!("127.0.0.1:{}", self.api_base_port as usize + id - 1)
    }

    /// API addresses of every node, in node order
    pub fn node_addrs(&self) -> Vec<String> {
        (1..=self.node_count).map(|id| self.node_api_addr(id)).collect()
    }

    /// Poll every node's readiness path until all answer with a success status
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let Ok(client) = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build() else {
            return false;
        };

        loop {
            let mut ready = 0;
            for id in 1..=self.node_count {
                let url = format!("http://{}{}", self.node_api_addr(id), self.ready_path);
                match client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => ready += 1,
                    _ => break,
                }
            }
            if ready == self.node_count {
                tracing::info!(nodes = ready, path = %self.ready_path, "cluster ready");
                return true;
            }
            if tokio::time::Instant::now() + Duration::from_millis(200) >= deadline {
                return false;
            }
            sleep(Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl Database for DockerCluster {
    /// Tear down leftovers, then `docker compose up -d --build`
    async fn setup(&self, _nodes: &[String]) -> Result<(), String> {
        let _ = docker(&["compose", "-f", &self.compose_file, "down", "-v"]).await;
        docker(&["compose", "-f", &self.compose_file, "up", "-d", "--build"])
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!(nodes = self.node_count, "docker cluster started");

        if !self.wait_until_ready(self.ready_timeout).await {
            return Err(format!(
                "nodes not ready on {} within {:?}",
                self.ready_path, self.ready_timeout
            ));
        }
        Ok(())
    }

    async fn teardown(&self, _nodes: &[String]) -> Result<(), String> {
        docker(&["compose", "-f", &self.compose_file, "down", "-v"])
            .await
            .map_err(|e| e.to_string())?;
        tracing::info!("docker cluster stopped");
        Ok(())
    }
}

/// Injects faults into the containers of a [`DockerCluster`]
pub struct DockerNemesis {
    container_prefix: String,
    nodes: Vec<String>,
    /// Peer rules installed by the current partition: (container, peer ip)
    blocked: Vec<(String, String)>,
}

impl Default for DockerNemesis {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER_PREFIX)
    }
}

impl DockerNemesis {
    pub fn new(container_prefix: impl Into<String>) -> Self {
        DockerNemesis {
            container_prefix: container_prefix.into(),
            nodes: Vec::new(),
            blocked: Vec::new(),
        }
    }

    fn container(&self, node: &str) -> Result<String, NemesisError> {
        self.nodes
            .iter()
            .position(|n| n == node)
            .map(|i| format!("{}{}", self.container_prefix, i + 1))
            .ok_or_else(|| NemesisError::UnknownNode(node.to_string()))
    }

    /// A container's IP address on its compose network
    async fn container_ip(&self, container: &str) -> Result<String, NemesisError> {
        let ip = docker(&[
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            container,
        ])
        .await?;
        if ip.is_empty() {
            return Err(NemesisError::Command {
                command: format!("docker inspect {}", container),
                stderr: "container has no IP address".to_string(),
            });
        }
        Ok(ip)
    }

    /// Add or remove INPUT+OUTPUT DROP rules for `peer_ip` inside `container`
    async fn iptables_rule(&self, container: &str, action: &str, peer_ip: &str) -> Result<(), NemesisError> {
        docker(&["exec", container, "iptables", action, "INPUT", "-s", peer_ip, "-j", "DROP"]).await?;
        docker(&["exec", container, "iptables", action, "OUTPUT", "-d", peer_ip, "-j", "DROP"]).await?;
        Ok(())
    }

    async fn partition(&mut self, groups: &[Vec<String>]) -> Result<Option<Value>, NemesisError> {
        let mut members = Vec::new();
        for (group, nodes) in groups.iter().enumerate() {
            for node in nodes {
                let container = self.container(node)?;
                let ip = self.container_ip(&container).await?;
                members.push((group, container, ip));
            }
        }

        for (group, container, _) in &members {
            for (peer_group, _, peer_ip) in &members {
                if group != peer_group {
                    self.iptables_rule(container, "-A", peer_ip).await?;
                    self.blocked.push((container.clone(), peer_ip.clone()));
                }
            }
        }
        Ok(Some(Value::Text(format!("{} rules installed", self.blocked.len()))))
    }

    async fn heal(&mut self) -> Result<Option<Value>, NemesisError> {
        let blocked = std::mem::take(&mut self.blocked);
        let mut failed = Vec::new();
        for (container, peer_ip) in blocked {
            if let Err(e) = self.iptables_rule(&container, "-D", &peer_ip).await {
                tracing::warn!(%container, %peer_ip, "could not remove partition rule: {}", e);
                failed.push((container, peer_ip));
            }
        }

        if failed.is_empty() {
            Ok(Some(Value::Text("fully connected".to_string())))
        } else {
            let count = failed.len();
            self.blocked = failed;
            Err(NemesisError::Command {
                command: "iptables -D".to_string(),
                stderr: format!("{} rules could not be removed", count),
            })
        }
    }

    async fn skew_clock(&self, node: &str, offset_ms: i64) -> Result<Option<Value>, NemesisError> {
        let container = self.container(node)?;
        let now_ms = chrono::Utc::now().timestamp_millis() + offset_ms;
        let target = format!("@{}.{:03}", now_ms.div_euclid(1000), now_ms.rem_euclid(1000));
        docker(&["exec", &container, "date", "-s", &target]).await?;
        Ok(Some(Value::Text(format!("{} skewed {}ms", node, offset_ms))))
    }

    async fn reset_clock(&self, node: &str) -> Result<Option<Value>, NemesisError> {
        self.skew_clock(node, 0).await?;
        Ok(Some(Value::Text(format!("{} clock reset", node))))
    }
}

#[async_trait]
impl Nemesis for DockerNemesis {
    async fn setup(&mut self, nodes: &[String]) -> Result<(), NemesisError> {
        self.nodes = nodes.to_vec();
        Ok(())
    }

    async fn invoke(&mut self, fault: &Fault) -> Result<Option<Value>, NemesisError> {
        match fault {
            Fault::Partition { groups } => self.partition(groups).await,
            Fault::Heal => self.heal().await,
            Fault::Kill { node } => {
                let container = self.container(node)?;
                docker(&["kill", &container]).await?;
                Ok(Some(Value::Text(format!("killed {}", container))))
            }
            Fault::Restart { node } => {
                let container = self.container(node)?;
                docker(&["start", &container]).await?;
                Ok(Some(Value::Text(format!("started {}", container))))
            }
            Fault::ClockSkew { node, offset_ms } => self.skew_clock(node, *offset_ms).await,
            Fault::ResetClock { node } => self.reset_clock(node).await,
        }
    }

    async fn teardown(&mut self) -> Result<(), NemesisError> {
        if self.blocked.is_empty() {
            return Ok(());
        }
        self.heal().await.map(|_| ())
    }
}
