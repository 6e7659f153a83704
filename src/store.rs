//! Thin wrapper over a Redis connection: key layout helpers and script
//! dispatch. The key-value store is treated as an opaque external service;
//! this module is the only place that knows it happens to be Redis.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::Connection;

use crate::error::Result;
use crate::script::{self, AcquireResult, RunningJob};

/// A handle bundling a Redis client with the key prefix and lineage flag
/// a given manager should use.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    pub prefix: String,
    pub graph_history: bool,
}

impl Store {
    pub fn new(client: redis::Client, prefix: impl Into<String>, graph_history: bool) -> Self {
        Store {
            client,
            prefix: prefix.into(),
            graph_history,
        }
    }

    /// Builds a store from the process-wide [`crate::config::Config`], failing
    /// if no default client has been configured.
    pub fn from_global_config() -> Option<Self> {
        let config = crate::config::global();
        config
            .store
            .map(|client| Store::new(client, config.prefix, config.graph_history))
    }

    pub fn connection(&self) -> redis::RedisResult<Connection> {
        self.client.get_connection()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn try_acquire_or_refresh(
        &self,
        con: &mut Connection,
        keys: &[&str],
        id: &str,
        now: f64,
        duration: u64,
        overwrite: bool,
        refresh: bool,
        edges: Vec<&str>,
    ) -> Result<AcquireResult> {
        script::try_acquire_or_refresh(
            con, keys, &self.prefix, id, now, duration, overwrite, refresh, edges,
        )
    }

    pub fn finish(
        &self,
        con: &mut Connection,
        keys: &[&str],
        id: &str,
        now: f64,
        success: bool,
    ) -> Result<()> {
        script::finish(con, keys, &self.prefix, id, now, success)
    }

    pub fn list_running(&self, con: &mut Connection, now: f64) -> Result<Vec<RunningJob>> {
        script::list_running(con, &self.prefix, now)
    }

    /// Reads the serialized key list for a specific running job id, if any.
    pub fn job_io(&self, con: &mut Connection, id: &str) -> Result<Option<Vec<String>>> {
        let key = format!("{}jobs:running:{}", self.prefix, id);
        let raw: Option<String> = redis::cmd("GET").arg(&key).query(con)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Deletes lock keys directly; used only by the administrative surface
    /// to recover from a job that died without cleanup.
    pub fn force_unlock(&self, con: &mut Connection, inputs: &[String], outputs: &[String]) -> Result<()> {
        let mut keys: Vec<String> = Vec::with_capacity(inputs.len() + outputs.len());
        keys.extend(inputs.iter().map(|i| format!("{}ilock:{}", self.prefix, i)));
        keys.extend(outputs.iter().map(|o| format!("{}olock:{}", self.prefix, o)));
        if keys.is_empty() {
            return Ok(());
        }
        redis::cmd("DEL").arg(&keys).query::<()>(con)?;
        Ok(())
    }

    /// Sets output markers directly to a synthetic identifier. Unsafe:
    /// bypasses any lock ownership check.
    pub fn create_outputs(&self, con: &mut Connection, outputs: &[String], identifier: &str) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("MSET");
        for o in outputs {
            cmd.arg(format!("{}{}", self.prefix, o)).arg(identifier);
        }
        cmd.query::<()>(con)?;
        Ok(())
    }

    /// Raw sanitized edges from `jobs:graph:input` / `jobs:graph:output`.
    pub fn raw_edges(&self, con: &mut Connection, graph: &str) -> Result<Vec<String>> {
        let key = format!("{}jobs:graph:{}", self.prefix, graph);
        let edges: Vec<String> = redis::cmd("ZRANGE").arg(&key).arg(0).arg(-1).query(con)?;
        Ok(edges)
    }
}

/// Current epoch time, in (possibly fractional) seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
