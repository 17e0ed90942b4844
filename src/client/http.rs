//! HTTP key-value client adapter
//!
//! Speaks a small JSON protocol:
//! - `GET /kv/:key` returns `{"key": ..., "value": "<int>" | null}`
//! - `POST /kv/:key` with `{"value": "<int>"}` writes a register
//! - `POST /kv/:key/cas` with `{"expected": "<int>", "new": "<int>"}`; 409 means
//!   the comparison failed
//!
//! A 503 answer means "not the leader": nothing was applied, so the adapter
//! moves on to the next node. Any transport-level error is ambiguous and is
//! returned immediately; the harness never retries those.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Client, Connection};
use crate::error::ClientError;
use crate::history::{Action, Value};

/// Response for GET /kv/:key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvGetResponse {
    key: String,
    value: Option<String>,
}

/// Request body for POST /kv/:key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSetRequest {
    value: String,
}

/// Request body for POST /kv/:key/cas
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvCasRequest {
    expected: String,
    new: String,
}

/// Error response from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    leader_hint: Option<u64>,
}

/// Opens [`HttpConnection`]s against a list of `host:port` nodes
#[derive(Debug, Clone)]
pub struct HttpClient {
    nodes: Vec<String>,
    request_timeout: Duration,
    max_redirects: usize,
}

impl HttpClient {
    pub fn new(nodes: Vec<String>, request_timeout: Duration) -> Self {
        HttpClient {
            nodes,
            request_timeout,
            max_redirects: 10,
        }
    }
}

#[async_trait]
impl Client for HttpClient {
    async fn open(&self, node: &str) -> Result<Box<dyn Connection>, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;

        // Preferred node first, the rest for leader redirection
        let mut targets = vec![node.to_string()];
        targets.extend(self.nodes.iter().filter(|n| n.as_str() != node).cloned());

        Ok(Box::new(HttpConnection {
            targets,
            http,
            max_redirects: self.max_redirects,
        }))
    }
}

/// One worker's HTTP connection
pub struct HttpConnection {
    targets: Vec<String>,
    http: reqwest::Client,
    max_redirects: usize,
}

impl HttpConnection {
    fn url(&self, target: usize, path: &str) -> String {
        format!("http://{}/kv/{}", self.targets[target], path)
    }

    /// Send a request built by `build`, following "not leader" answers
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ClientError>
    where
        F: Fn(&reqwest::Client, usize) -> reqwest::RequestBuilder,
    {
        let mut target = 0;
        let mut redirects = 0;

        loop {
            let response = build(&self.http, target).send().await.map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout
                } else {
                    ClientError::Network(e.to_string())
                }
            })?;

            if response.status() != reqwest::StatusCode::SERVICE_UNAVAILABLE {
                return Ok(response);
            }

            let error: ErrorResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Protocol(e.to_string()))?;
            redirects += 1;
            if redirects >= self.max_redirects {
                return Err(ClientError::Rejected(format!(
                    "not leader after {} attempts: {}",
                    redirects, error.error
                )));
            }
            tracing::debug!(leader_hint = ?error.leader_hint, "not leader, trying next node");
            target = (target + 1) % self.targets.len();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, ClientError> {
        let response = self
            .send(|http, target| http.get(self.url(target, key)))
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Protocol(format!(
                "unexpected status: {}",
                response.status()
            )));
        }

        let resp: KvGetResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        match resp.value {
            None => Ok(Some(Value::Nil)),
            Some(raw) => raw
                .parse::<i64>()
                .map(|v| Some(Value::Int(v)))
                .map_err(|_| ClientError::Protocol(format!("non-integer value {:?}", raw))),
        }
    }

    async fn write(&self, key: &str, value: i64) -> Result<Option<Value>, ClientError> {
        let body = KvSetRequest {
            value: value.to_string(),
        };
        let response = self
            .send(|http, target| http.post(self.url(target, key)).json(&body))
            .await?;
        if response.status().is_success() {
            Ok(None)
        } else if response.status().is_client_error() {
            Err(ClientError::Rejected(format!("status {}", response.status())))
        } else {
            Err(ClientError::Protocol(format!(
                "unexpected status: {}",
                response.status()
            )))
        }
    }

    async fn cas(&self, key: &str, expected: i64, new: i64) -> Result<Option<Value>, ClientError> {
        let body = KvCasRequest {
            expected: expected.to_string(),
            new: new.to_string(),
        };
        let path = format!("{}/cas", key);
        let response = self
            .send(|http, target| http.post(self.url(target, &path)).json(&body))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(None),
            reqwest::StatusCode::CONFLICT => {
                Err(ClientError::Rejected("compare-and-set mismatch".to_string()))
            }
            status => Err(ClientError::Protocol(format!("unexpected status: {}", status))),
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn invoke(&mut self, action: &Action) -> Result<Option<Value>, ClientError> {
        match action {
            Action::Read { key } => self.read(key).await,
            Action::Write { key, value } => self.write(key, *value).await,
            Action::Cas { key, expected, new } => self.cas(key, *expected, *new).await,
            other => Err(ClientError::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_targets_node() {
        let conn = HttpConnection {
            targets: vec!["a:1".to_string(), "b:2".to_string()],
            http: reqwest::Client::new(),
            max_redirects: 3,
        };
        assert_eq!(conn.url(0, "x"), "http://a:1/kv/x");
        assert_eq!(conn.url(1, "x/cas"), "http://b:2/kv/x/cas");
    }

    #[tokio::test]
    async fn test_unsupported_action_is_definite() {
        let client = HttpClient::new(vec!["127.0.0.1:1".to_string()], Duration::from_millis(100));
        let mut conn = client.open("127.0.0.1:1").await.unwrap();
        let err = conn
            .invoke(&Action::Add {
                key: "s".to_string(),
                element: 1,
            })
            .await
            .unwrap_err();
        assert!(err.is_definite());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_ambiguous() {
        let client = HttpClient::new(vec!["127.0.0.1:1".to_string()], Duration::from_millis(200));
        let mut conn = client.open("127.0.0.1:1").await.unwrap();
        let err = conn
            .invoke(&Action::Read {
                key: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_definite());
    }
}
