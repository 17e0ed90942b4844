//! Capability traits for the system under test
//!
//! The core only ever talks to a store through these traits. [`Client`] opens
//! one [`Connection`] per worker; [`Database`] brackets the whole run.

pub mod http;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::history::{Action, Value};

pub use http::HttpClient;

/// Factory for per-worker connections
#[async_trait]
pub trait Client: Send + Sync {
    /// Open a connection bound to `node`
    async fn open(&self, node: &str) -> Result<Box<dyn Connection>, ClientError>;
}

/// One worker's exclusive connection to the store
#[async_trait]
pub trait Connection: Send {
    /// Prepare the connection before the active phase (e.g. create tables)
    async fn setup(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Execute one operation
    ///
    /// `Ok` carries the observed value for reads and `None` or the applied
    /// value otherwise. Definite errors become `fail` events, the rest `info`.
    async fn invoke(&mut self, action: &Action) -> Result<Option<Value>, ClientError>;

    /// Undo `setup` after the active phase
    async fn teardown(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    /// Release the connection
    async fn close(self: Box<Self>) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Database lifecycle, invoked once before and once after the run
#[async_trait]
pub trait Database: Send + Sync {
    async fn setup(&self, nodes: &[String]) -> Result<(), String>;
    async fn teardown(&self, nodes: &[String]) -> Result<(), String>;
}

/// Database that is managed outside the harness
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDatabase;

#[async_trait]
impl Database for NoopDatabase {
    async fn setup(&self, _nodes: &[String]) -> Result<(), String> {
        Ok(())
    }

    async fn teardown(&self, _nodes: &[String]) -> Result<(), String> {
        Ok(())
    }
}
