//! The per-job `ResourceManager`: owns declared inputs/outputs, the lease
//! duration, the wait budget, and the Idle/Running state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, FlowLockError, Result};
use crate::id::{build_identifier, random_component};
use crate::registry;
use crate::script;
use crate::store::{now_secs, Store};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// How often `start()` logs that it is still waiting.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound on the sleep between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// `refresh()` is a no-op unless this long has elapsed since the last refresh.
const REFRESH_MIN_INTERVAL: Duration = Duration::from_secs(1);

struct ManagerState {
    inputs: Vec<String>,
    outputs: Vec<String>,
    duration: u64,
    wait: u64,
    overwrite: bool,
    store: Store,
    base_identifier: String,
    random: u64,
    suffix: Option<String>,
    graph_history: bool,
    last_refreshed: Option<Instant>,
    auto_refresh: bool,
}

impl ManagerState {
    fn is_running(&self) -> bool {
        self.last_refreshed.is_some()
    }

    fn identifier(&self) -> String {
        build_identifier(&self.base_identifier, self.random, self.suffix.as_deref())
    }
}

/// A single pipeline job's declared inputs/outputs and lock lifecycle.
///
/// `start`/`refresh`/`stop` are serialized per-manager by an internal
/// reentrant mutex held across the whole call, not just while touching
/// `ManagerState` — `refresh` can call `stop` on a lost-lock failure, so
/// the transition lock must tolerate the same thread re-entering it.
/// Callers share a `ResourceManager` across threads via `Arc` (returned by
/// [`ResourceManager::new`]) — the scheduler and the process-exit registry
/// both need to hold a reference to a still-running manager.
pub struct ResourceManager {
    serial: u64,
    self_ref: Weak<ResourceManager>,
    state: Mutex<ManagerState>,
    transition: ReentrantMutex<()>,
}

/// The outcome of a `refresh()` call: which (if any) locks were found
/// missing and re-established, or lost outright.
#[derive(Debug, Default, Clone)]
pub struct RefreshOutcome {
    pub err: crate::error::ErrorMap,
    pub temp: crate::error::ErrorMap,
}

impl RefreshOutcome {
    fn has_losses(&self) -> bool {
        !self.err.is_empty() || !self.temp.is_empty()
    }
}

impl ResourceManager {
    /// Creates an idle manager. `duration` and `wait` are accepted as `i64`
    /// and clamped to `>= 0`, mirroring callers that compute these values
    /// from possibly-negative arithmetic.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        duration: i64,
        wait: i64,
        overwrite: bool,
        store: Store,
        graph_history: bool,
        base_identifier: impl Into<String>,
        suffix: Option<String>,
    ) -> Arc<Self> {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak| ResourceManager {
            serial,
            self_ref: weak.clone(),
            transition: ReentrantMutex::new(()),
            state: Mutex::new(ManagerState {
                inputs: inputs.into_iter().map(Into::into).collect(),
                outputs: outputs.into_iter().map(Into::into).collect(),
                duration: duration.max(0) as u64,
                wait: wait.max(0) as u64,
                overwrite,
                store,
                base_identifier: base_identifier.into(),
                random: random_component(),
                suffix,
                graph_history,
                last_refreshed: None,
                auto_refresh: false,
            }),
        })
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    fn arc(&self) -> Arc<ResourceManager> {
        self.self_ref
            .upgrade()
            .expect("ResourceManager is always held behind an Arc")
    }

    /// The effective identifier: `<base>.<random>[.<suffix>]`.
    pub fn identifier(&self) -> String {
        self.state.lock().identifier()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }

    pub(crate) fn auto_refresh_enabled(&self) -> bool {
        self.state.lock().auto_refresh
    }

    pub(crate) fn last_refreshed(&self) -> Option<Instant> {
        self.state.lock().last_refreshed
    }

    /// Regenerates the random suffix from a new base identifier. Only
    /// valid while idle.
    pub fn regenerate_identifier(&self, base_identifier: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_running() {
            return Err(FlowLockError::Usage(
                "can't set the identifier after starting".into(),
            ));
        }
        state.base_identifier = base_identifier.into();
        state.random = random_component();
        Ok(())
    }

    /// Sets the optional identifier suffix. Only valid while idle.
    pub fn set_suffix(&self, suffix: Option<String>) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_running() {
            return Err(FlowLockError::Usage(
                "can't set the suffix after starting".into(),
            ));
        }
        state.suffix = suffix;
        Ok(())
    }

    pub fn add_inputs(&self, more: impl IntoIterator<Item = impl Into<String>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_running() {
            return Err(FlowLockError::Usage("can't add inputs after starting".into()));
        }
        state.inputs.extend(more.into_iter().map(Into::into));
        Ok(())
    }

    pub fn add_outputs(&self, more: impl IntoIterator<Item = impl Into<String>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_running() {
            return Err(FlowLockError::Usage("can't add outputs after starting".into()));
        }
        state.outputs.extend(more.into_iter().map(Into::into));
        Ok(())
    }

    /// Probes whether the job could start right now, without acquiring
    /// anything (`duration=0`).
    pub fn can_run(&self) -> Result<bool> {
        let state = self.state.lock();
        if state.is_running() {
            return Err(FlowLockError::Usage("already started".into()));
        }
        let id = state.identifier();
        let keys = script::key_list(&state.inputs, &state.outputs);
        let mut con = state.store.connection()?;
        let result = state.store.try_acquire_or_refresh(
            &mut con,
            &keys,
            &id,
            now_secs(),
            0,
            state.overwrite,
            false,
            vec!["", ""],
        )?;
        Ok(result.ok)
    }

    /// Repeatedly attempts acquisition until success or the wait budget is
    /// exceeded, then makes one final attempt before giving up.
    pub fn start(&self, auto_refresh: bool) -> Result<()> {
        let _guard = self.transition.lock();

        {
            let state = self.state.lock();
            if state.is_running() {
                return Ok(());
            }
        }

        if registry::has_any_locked() {
            warn!(
                "starting a job while another job is already locked in this process is a recipe for deadlocks"
            );
        }

        let wait = Duration::from_secs(self.state.lock().wait);
        let deadline = Instant::now() + wait;
        let mut last_reported = Instant::now()
            .checked_sub(REPORT_INTERVAL)
            .unwrap_or_else(Instant::now);

        info!("trying to start job");
        loop {
            let outcome = self.try_once(false)?;
            if outcome.ok {
                self.mark_started(auto_refresh);
                return Ok(());
            }
            if outcome.err.contains_key(&ErrorKind::OutputExists) {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            if last_reported.elapsed() >= REPORT_INTERVAL {
                info!(err = ?outcome.err, "still waiting to start job");
                last_reported = Instant::now();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        }

        // One final attempt before giving up.
        let outcome = self.try_once(false)?;
        if outcome.ok {
            self.mark_started(auto_refresh);
            return Ok(());
        }

        info!(err = ?outcome.err, "failed to start job");
        Err(FlowLockError::ResourceUnavailable(outcome.err))
    }

    fn mark_started(&self, auto_refresh: bool) {
        {
            let mut state = self.state.lock();
            state.last_refreshed = Some(Instant::now());
            state.auto_refresh = auto_refresh;
        }
        info!("starting job");
        let me = self.arc();
        registry::mark_locked(me.clone());
        if auto_refresh {
            registry::register_auto_refresh(me);
        }
    }

    fn try_once(&self, refresh: bool) -> Result<script::AcquireResult> {
        let state = self.state.lock();
        let id = state.identifier();
        let keys = script::key_list(&state.inputs, &state.outputs);
        let sanitized_inputs: Vec<String> = state.inputs.iter().map(|s| crate::lineage::sanitize(s)).collect();
        let sanitized_outputs: Vec<String> = state.outputs.iter().map(|s| crate::lineage::sanitize(s)).collect();
        let sanitized_id = crate::lineage::sanitize(&id);
        let edges = script::build_edges(
            &sanitized_inputs,
            &sanitized_outputs,
            &sanitized_id,
            !refresh && state.graph_history,
        );
        let mut con = state.store.connection()?;
        state.store.try_acquire_or_refresh(
            &mut con,
            &keys,
            &id,
            now_secs(),
            state.duration,
            state.overwrite,
            refresh,
            edges,
        )
    }

    /// Extends leases while the job runs. No-op if called within
    /// [`REFRESH_MIN_INTERVAL`] of the previous successful refresh.
    pub fn refresh(&self, lost_lock_fail: bool) -> Result<RefreshOutcome> {
        self.refresh_inner(lost_lock_fail, false)
    }

    pub(crate) fn refresh_inner(&self, lost_lock_fail: bool, inside_auto_refresh: bool) -> Result<RefreshOutcome> {
        let _guard = self.transition.lock();

        let should_refresh = {
            let state = self.state.lock();
            state.is_running()
                && state
                    .last_refreshed
                    .map(|t| t.elapsed() > REFRESH_MIN_INTERVAL)
                    .unwrap_or(false)
        };
        if !should_refresh {
            return Ok(RefreshOutcome::default());
        }

        debug!("refreshing job locks");
        let result = self.try_once(true)?;
        let outcome = RefreshOutcome {
            err: result.err,
            temp: result.temp,
        };

        if outcome.has_losses() {
            if lost_lock_fail {
                let auto = inside_auto_refresh && self.state.lock().auto_refresh;
                self.stop(true);
                if !auto {
                    return Err(FlowLockError::ResourceUnavailable(outcome.err));
                }
            }
            warn!(err = ?outcome.err, temp = ?outcome.temp, "lock(s) lost due to timeout");
        }

        self.state.lock().last_refreshed = Some(Instant::now());
        Ok(outcome)
    }

    /// Stops the job if running, releasing locks. If `failed`, outputs are
    /// not committed. Idempotent and never fails user-visibly.
    pub fn stop(&self, failed: bool) {
        let _guard = self.transition.lock();

        let was_running = {
            let mut state = self.state.lock();
            if !state.is_running() {
                return;
            }
            let id = state.identifier();
            let keys = script::key_list(&state.inputs, &state.outputs);
            info!(failed, "stopping job");
            if let Ok(mut con) = state.store.connection() {
                if let Err(e) = state.store.finish(&mut con, &keys, &id, now_secs(), !failed) {
                    warn!(error = %e, "finish script failed; locks rely on TTL expiry");
                }
            } else {
                warn!("could not connect to store to finish job; locks rely on TTL expiry");
            }
            state.last_refreshed = None;
            state.auto_refresh = false;
            true
        };
        if was_running {
            registry::unmark_locked(self.serial);
            registry::unregister_auto_refresh(self.serial);
        }
    }

    /// Starts the job, then runs `body`, then stops it — failed if `body`
    /// returned `Err`. Guarantees `stop` runs on every exit path out of
    /// `body`, success or failure, without requiring the caller to set up
    /// their own scope guard.
    pub fn run_scoped<T>(&self, auto_refresh: bool, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.start(auto_refresh)?;
        let result = body();
        self.stop(result.is_err());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::new(redis::Client::open("redis://127.0.0.1/").unwrap(), "", true)
    }

    #[test]
    fn new_manager_is_idle() {
        let mgr = ResourceManager::new(
            Vec::<String>::new(),
            Vec::<String>::new(),
            60,
            0,
            true,
            test_store(),
            true,
            "test.job",
            None,
        );
        assert!(!mgr.is_running());
        assert!(mgr.identifier().starts_with("test.job."));
    }

    #[test]
    fn add_inputs_and_outputs_before_start() {
        let mgr = ResourceManager::new(
            vec!["a".to_string()],
            Vec::<String>::new(),
            60,
            0,
            true,
            test_store(),
            true,
            "test.job",
            None,
        );
        mgr.add_inputs(vec!["b"]).unwrap();
        mgr.add_outputs(vec!["c"]).unwrap();
        let state = mgr.state.lock();
        assert_eq!(state.inputs, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(state.outputs, vec!["c".to_string()]);
    }

    #[test]
    fn identifier_includes_suffix() {
        let mgr = ResourceManager::new(
            Vec::<String>::new(),
            Vec::<String>::new(),
            60,
            0,
            true,
            test_store(),
            true,
            "test.job",
            Some("retry".to_string()),
        );
        assert!(mgr.identifier().ends_with(".retry"));
    }

    #[test]
    fn negative_duration_and_wait_clamp_to_zero() {
        let mgr = ResourceManager::new(
            Vec::<String>::new(),
            Vec::<String>::new(),
            -5,
            -5,
            true,
            test_store(),
            true,
            "test.job",
            None,
        );
        let state = mgr.state.lock();
        assert_eq!(state.duration, 0);
        assert_eq!(state.wait, 0);
    }
}
