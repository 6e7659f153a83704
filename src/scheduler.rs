//! The auto-refresh scheduler: a single background worker, lazily started
//! on first registration, shared across all managers in the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::error;

use crate::registry;

/// Upper bound on the scheduler's idle poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Target refresh cadence per manager.
const REFRESH_PERIOD: Duration = Duration::from_secs(1);

pub(crate) struct Scheduler {
    alive: Arc<AtomicBool>,
    // Kept only to join on drop in tests; the worker is a daemon thread in
    // practice and the process may exit while it's still sleeping.
    _handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn spawn() -> Self {
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_thread = alive.clone();
        let handle = std::thread::spawn(move || {
            run(&alive_for_thread);
        });
        Scheduler {
            alive,
            _handle: Some(handle),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn run(alive: &AtomicBool) {
    loop {
        let mut candidates: Vec<_> = registry::auto_refresh_snapshot()
            .into_iter()
            .filter(|m| {
                if m.last_refreshed().is_none() {
                    registry::drop_from_auto_refresh(m.serial());
                    false
                } else {
                    true
                }
            })
            .collect();

        if candidates.is_empty() {
            break;
        }

        candidates.sort_by_key(|m| m.last_refreshed());
        let most_overdue = candidates.remove(0);
        let target = most_overdue.last_refreshed().expect("filtered above") + REFRESH_PERIOD;
        let now = Instant::now();
        if target > now {
            std::thread::sleep((target - now).min(POLL_INTERVAL));
            continue;
        }

        if let Err(e) = most_overdue.refresh_inner(false, true) {
            error!(error = %e, "exception while automatically refreshing");
        }

        if !most_overdue.is_running() {
            registry::drop_from_auto_refresh(most_overdue.serial());
        }
    }
    alive.store(false, Ordering::SeqCst);
}
