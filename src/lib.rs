//! Distributed input/output resource locking for data pipeline jobs,
//! backed by a Redis-like atomic-scripting key/value store.
//!
//! A job declares the named resources it reads (`inputs`) and writes
//! (`outputs`) before running. The store enforces multi-reader/single-writer
//! semantics per resource: many jobs may hold a read lease on the same
//! input concurrently, but only one job may hold a write lease on a given
//! output, and an output already produced by a prior job is refused unless
//! `overwrite` is set. [`ResourceManager`] is the per-job handle around
//! this lifecycle; [`admin`] exposes read-only lineage queries and unsafe
//! recovery primitives for jobs that died without releasing their locks.
//!
//! This crate never installs a `tracing` subscriber itself — wire one up
//! in your binary (`tracing_subscriber::fmt()` or similar) to see its logs.

pub mod admin;
pub mod config;
pub mod error;
pub mod id;
pub mod lineage;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod script;
pub mod signal;
pub mod store;

pub use config::Config;
pub use error::{ErrorKind, ErrorMap, FlowLockError, Result};
pub use id::NameGen;
pub use manager::{RefreshOutcome, ResourceManager};
pub use store::Store;

use std::sync::Arc;

/// Convenience constructor building a [`ResourceManager`] from the
/// process-wide [`Config`] (set via [`config::set_global`] or
/// [`Config::from_env`]), running `body` start-to-stop around it.
///
/// This is the functional equivalent of decorating a job function with a
/// resource manager: acquire the declared resources, run `body`, and
/// release them whether or not `body` succeeded.
#[allow(clippy::too_many_arguments)]
pub fn run_with_resources<T>(
    inputs: impl IntoIterator<Item = impl Into<String>>,
    outputs: impl IntoIterator<Item = impl Into<String>>,
    duration: i64,
    wait: i64,
    overwrite: bool,
    auto_refresh: bool,
    base_identifier: impl Into<String>,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let store = store::Store::from_global_config().ok_or_else(|| {
        FlowLockError::Usage("no store configured; call config::set_global first".into())
    })?;
    let graph_history = config::global().graph_history;
    let mgr: Arc<ResourceManager> = ResourceManager::new(
        inputs,
        outputs,
        duration,
        wait,
        overwrite,
        store,
        graph_history,
        base_identifier,
        None,
    );
    mgr.run_scoped(auto_refresh, body)
}
