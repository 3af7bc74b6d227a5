#![allow(unsafe_code)]

//! Deferred delivery of termination signals around critical sections.
//!
//! A [`SignalDeferral`] scope bumps a process-wide counter. While the
//! counter is non-zero, the installed handler only records the signal;
//! the last scope to exit re-raises it. Outside any scope the handler
//! runs the registered flush hook (the active cache uses this to close
//! its output streams) and then emulates the default disposition.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::low_level;
use tracing::debug;

static DEFER_DEPTH: AtomicUsize = AtomicUsize::new(0);
static PENDING: AtomicI32 = AtomicI32::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static FLUSH_HOOK: Mutex<Option<Box<dyn FnMut() + Send>>> = Mutex::new(None);

/// Installs the deferring handler for SIGINT and SIGTERM. Idempotent.
pub fn install() {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    for signal in [SIGINT, SIGTERM] {
        // The closure runs in signal-handler context. It touches the
        // atomics, a try_lock, and the hook; the hook shares the same
        // constraint the handler does.
        let result = unsafe { low_level::register(signal, move || handle(signal)) };
        if let Err(err) = result {
            debug!(signal, %err, "unable to install signal handler");
        }
    }
}

/// Registers the callback run when a signal fires outside any deferral
/// scope. The previous hook is replaced.
pub fn set_flush_hook(hook: Box<dyn FnMut() + Send>) {
    *FLUSH_HOOK.lock() = Some(hook);
}

/// Removes the flush hook, restoring plain default-disposition exits.
pub fn clear_flush_hook() {
    *FLUSH_HOOK.lock() = None;
}

fn handle(signal: i32) {
    if DEFER_DEPTH.load(Ordering::SeqCst) > 0 {
        PENDING.store(signal, Ordering::SeqCst);
        return;
    }
    if let Some(mut guard) = FLUSH_HOOK.try_lock() {
        if let Some(hook) = guard.as_mut() {
            hook();
        }
    }
    let _ = low_level::emulate_default_handler(signal);
}

/// Scope guard that postpones SIGINT/SIGTERM until it is dropped.
///
/// Scopes nest; the signal is re-raised when the outermost one exits.
pub struct SignalDeferral(());

impl SignalDeferral {
    /// Enters a deferral scope.
    pub fn new() -> Self {
        DEFER_DEPTH.fetch_add(1, Ordering::SeqCst);
        Self(())
    }
}

impl Default for SignalDeferral {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalDeferral {
    fn drop(&mut self) {
        if DEFER_DEPTH.fetch_sub(1, Ordering::SeqCst) == 1 {
            let pending = PENDING.swap(0, Ordering::SeqCst);
            if pending != 0 {
                debug!(signal = pending, "re-raising deferred signal");
                let _ = low_level::raise(pending);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn pending_for_test() -> i32 {
    PENDING.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn defer_depth_for_test() -> usize {
    DEFER_DEPTH.load(Ordering::SeqCst)
}
