//! Process-wide registry: the set of currently-locked managers (`LOCKED`),
//! the set registered for auto-refresh (`AUTO_REFRESH`), and the singleton
//! auto-refresh scheduler handle.
//!
//! A single mutex guards all of it, matching the design note that these
//! ought to be "a single per-process registry object with explicit
//! init/teardown" rather than free-floating globals.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::info;

use crate::manager::ResourceManager;
use crate::scheduler::Scheduler;

struct Registry {
    locked: HashMap<u64, Arc<ResourceManager>>,
    auto_refresh: HashMap<u64, Arc<ResourceManager>>,
    scheduler: Option<Scheduler>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            locked: HashMap::new(),
            auto_refresh: HashMap::new(),
            scheduler: None,
        }
    }
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::new()))
}

pub(crate) fn has_any_locked() -> bool {
    !registry().lock().locked.is_empty()
}

pub(crate) fn mark_locked(mgr: Arc<ResourceManager>) {
    registry().lock().locked.insert(mgr.serial(), mgr);
}

pub(crate) fn unmark_locked(serial: u64) {
    registry().lock().locked.remove(&serial);
}

pub(crate) fn register_auto_refresh(mgr: Arc<ResourceManager>) {
    let mut reg = registry().lock();
    reg.auto_refresh.insert(mgr.serial(), mgr);
    if reg.scheduler.as_ref().map(|s| !s.is_alive()).unwrap_or(true) {
        reg.scheduler = Some(Scheduler::spawn());
    }
}

pub(crate) fn unregister_auto_refresh(serial: u64) {
    registry().lock().auto_refresh.remove(&serial);
}

/// Snapshot of managers currently registered for auto-refresh, used by the
/// scheduler thread (which must not hold the registry lock while it sleeps
/// or calls back into user code via `refresh`).
pub(crate) fn auto_refresh_snapshot() -> Vec<Arc<ResourceManager>> {
    registry().lock().auto_refresh.values().cloned().collect()
}

pub(crate) fn drop_from_auto_refresh(serial: u64) {
    registry().lock().auto_refresh.remove(&serial);
}

/// Stops every still-locked manager, marking each `failed`. Used on
/// process-exit cleanup; swallows nothing itself (stop() never fails
/// user-visibly) but callers invoking this from a signal handler should
/// keep it quick.
pub fn stop_all_locked(failed: bool) {
    let snapshot: Vec<Arc<ResourceManager>> = registry().lock().locked.values().cloned().collect();
    if !snapshot.is_empty() {
        info!(count = snapshot.len(), "stopping still-locked jobs on process exit");
    }
    for mgr in snapshot {
        mgr.stop(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn test_store() -> Store {
        Store::new(redis::Client::open("redis://127.0.0.1/").unwrap(), "", true)
    }

    #[test]
    fn mark_and_unmark_locked_round_trip() {
        let mgr = ResourceManager::new(
            Vec::<String>::new(),
            Vec::<String>::new(),
            60,
            0,
            true,
            test_store(),
            true,
            "test.registry",
            None,
        );
        assert!(!has_any_locked());
        mark_locked(mgr.clone());
        assert!(has_any_locked());
        unmark_locked(mgr.serial());
        assert!(!has_any_locked());
    }
}
