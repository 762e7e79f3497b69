//! Idle-session reclamation.
//!
//! A background thread scans the session table every `cleanup_interval`
//! and reclaims sessions idle longer than `session_timeout`: queue entry
//! removed, active slot returned, model state released, accelerator cache
//! flushed, and the queue pumped so waiters fill the freed capacity.
//!
//! Reclamation is not cooperative. A propagation running for a reaped
//! session finds the state slot empty on its next frame and terminates
//! with `SessionExpired`. Model-state release always happens after the
//! admission lock has been dropped, so device-memory teardown never blocks
//! bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::api::Core;
use crate::driver;

/// Poll granularity for prompt shutdown of the reaper thread.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Handle to the background reaper thread.
pub struct ReaperHandle {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for its thread to exit.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Spawn the periodic scan loop.
pub(crate) fn spawn(core: Arc<Core>) -> ReaperHandle {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let interval = core.config.cleanup_interval;
    tracing::info!(interval_secs = interval.as_secs(), "reaper started");

    let handle = thread::spawn(move || {
        while flag.load(Ordering::SeqCst) {
            let deadline = Instant::now() + interval;
            while flag.load(Ordering::SeqCst) && Instant::now() < deadline {
                thread::sleep(STOP_POLL.min(deadline - Instant::now()));
            }
            if !flag.load(Ordering::SeqCst) {
                break;
            }
            tick(&core);
        }
        tracing::debug!("reaper loop exited");
    });

    ReaperHandle {
        running,
        handle: Some(handle),
    }
}

/// One reclamation pass. Returns how many sessions were reclaimed.
pub(crate) fn tick(core: &Arc<Core>) -> usize {
    let timeout = core.config.session_timeout;
    let expired = core.admission.collect_idle(timeout);
    if expired.is_empty() {
        return 0;
    }

    tracing::info!(count = expired.len(), "reaping idle sessions");
    let mut queue_changed = false;
    let mut freed_slot = false;

    for session in &expired {
        let idle_secs = session.idle_for().as_secs_f64();
        let outcome = core.admission.evict(&session.id);
        queue_changed |= outcome.queue_changed;
        freed_slot |= outcome.freed_slot;

        // Drop the model state outside the admission lock.
        if let Some(row) = outcome.session
            && let Some(state) = row.take_state()
        {
            drop(state);
            tracing::info!(
                session_id = %row.id,
                idle_secs,
                "released model state of idle session"
            );
        }
    }

    core.collect_garbage();
    tracing::info!(
        reclaimed = expired.len(),
        stats = %core.admission.session_stats(),
        "cleanup finished"
    );

    if queue_changed || freed_slot {
        driver::pump(core);
    }
    expired.len()
}
