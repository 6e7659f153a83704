//! Process-wide configuration: default store handle, key prefix, lineage flag.
//!
//! Held as an explicit struct behind a `OnceLock`-guarded `RwLock`, set once
//! via [`set_global`] and read through [`global`], rather than as
//! free-floating mutable statics scattered across the crate.

use std::sync::OnceLock;

use parking_lot::RwLock;

/// Process-wide settings, overridable per-manager for the store handle and
/// lineage flag.
#[derive(Clone)]
pub struct Config {
    /// Default Redis client used by managers that don't supply their own.
    pub store: Option<redis::Client>,
    /// Global key prefix `P` prepended to all store keys.
    pub prefix: String,
    /// Whether to record sanitized lineage edges by default.
    pub graph_history: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: None,
            prefix: String::new(),
            graph_history: true,
        }
    }
}

impl Config {
    /// Builds configuration from environment variables:
    /// `FLOWLOCK_REDIS_URL`, `FLOWLOCK_PREFIX`, `FLOWLOCK_GRAPH_HISTORY`.
    pub fn from_env() -> Self {
        let store = std::env::var("FLOWLOCK_REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        let prefix = std::env::var("FLOWLOCK_PREFIX").unwrap_or_default();
        let graph_history = std::env::var("FLOWLOCK_GRAPH_HISTORY")
            .ok()
            .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        Config {
            store,
            prefix,
            graph_history,
        }
    }
}

fn global_slot() -> &'static RwLock<Config> {
    static SLOT: OnceLock<RwLock<Config>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(Config::default()))
}

/// Installs the process-wide configuration, replacing any previous value.
pub fn set_global(config: Config) {
    *global_slot().write() = config;
}

/// Returns a clone of the current process-wide configuration.
pub fn global() -> Config {
    global_slot().read().clone()
}
