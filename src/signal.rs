//! Process-exit cleanup: on SIGTERM/SIGINT, every manager still in the
//! `LOCKED` registry is stopped with `failed=true` before the process
//! continues toward termination.
//!
//! `signal_hook::low_level::register` lets multiple independent actions
//! coexist per signal, so installing ours never silently replaces a
//! handler some other library in the process already registered, and
//! callers don't need to manually chain to a previous handler themselves.

use std::io;

use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::warn;

use crate::registry;

/// Installs handlers for `SIGTERM` and `SIGINT` that stop every still-held
/// manager (`failed=true`) before the signal is allowed to take its
/// default action. Safe to call more than once; each call adds another
/// independent registration.
pub fn install() -> io::Result<()> {
    unsafe {
        signal_hook::low_level::register(SIGTERM, on_signal)?;
        signal_hook::low_level::register(SIGINT, on_signal)?;
    }
    Ok(())
}

fn on_signal() {
    // Signal-safety is best-effort here: taking a `parking_lot::Mutex` and
    // running a Redis round-trip inside a signal handler isn't strictly
    // async-signal-safe, but the cleanup must observe a consistent view of
    // the registry, and the alternative (leaking locks until their TTL
    // expires) is worse for anything with a long lease.
    warn!("caught termination signal; stopping all locked jobs");
    registry::stop_all_locked(true);
}
