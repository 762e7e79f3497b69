//! Session rows and the in-memory session table.
//!
//! A session is the unit of admission: one interactive tracking context
//! bound to one video. Its row is the *sole owner* of the model state
//! handle — every other component addresses the session by id and
//! re-resolves the row, so there is exactly one place device memory can
//! leak from, and deleting the row releases it.
//!
//! ## Lifecycle
//!
//! ```text
//! submit (capacity free)  -> processing
//! submit (capacity full)  -> queued
//! queued   --pump-->         processing
//! processing --close-->      completed   (state released)
//! processing --init error--> error       (slot freed)
//! any --idle timeout-->      completed   (state released, row pruned later)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::backend::InferenceState;
use crate::types::{SessionStatus, StartSessionRequest, VideoMetadata};

/// Seconds since the Unix epoch, as the wire and queue file carry it.
pub(crate) fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A single tracking session.
///
/// Bookkeeping fields (`status`, queue membership) are mutated under the
/// admission controller's lock; the remaining fields use interior
/// mutability so heartbeats and cancellation never contend with admission.
pub struct Session {
    /// Opaque stable identifier (UUID-shaped string).
    pub id: String,
    /// Location the model backend reads frames from.
    pub video_path: String,
    pub video_metadata: Option<VideoMetadata>,
    /// Arrival time, seconds since the Unix epoch (persisted for queued rows).
    pub enqueue_time: f64,
    status: RwLock<SessionStatus>,
    /// Set at admission; drives the processing-time estimate.
    processing_start: RwLock<Option<f64>>,
    last_active: RwLock<Instant>,
    /// Cooperative cancellation flag read between propagation frames.
    canceled: AtomicBool,
    /// Whether decoded frames were kept in host memory at init.
    offload_frames: AtomicBool,
    /// Model state handle. `None` before init completes and after release.
    state: Mutex<Option<Box<dyn InferenceState>>>,
}

impl Session {
    pub fn new(id: &str, request: &StartSessionRequest, enqueue_time: f64) -> Self {
        Session {
            id: id.to_string(),
            video_path: request.path.clone(),
            video_metadata: request.video_metadata.clone(),
            enqueue_time,
            status: RwLock::new(SessionStatus::Queued),
            processing_start: RwLock::new(None),
            last_active: RwLock::new(Instant::now()),
            canceled: AtomicBool::new(false),
            offload_frames: AtomicBool::new(true),
            state: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SessionStatus) {
        tracing::debug!(
            session_id = %self.id,
            old_status = %*self.status.read(),
            new_status = %status,
            "status transition"
        );
        *self.status.write() = status;
    }

    /// Record admission: status `processing` and the start-of-processing time.
    pub fn mark_processing(&self, now: f64) {
        self.set_status(SessionStatus::Processing);
        *self.processing_start.write() = Some(now);
    }

    pub fn processing_start(&self) -> Option<f64> {
        *self.processing_start.read()
    }

    /// Refresh `last_active_time`; called on every successful operation.
    pub fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    /// How long since the session was last touched.
    pub fn idle_for(&self) -> Duration {
        self.last_active.read().elapsed()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn set_canceled(&self, canceled: bool) {
        self.canceled.store(canceled, Ordering::SeqCst);
    }

    pub fn set_offload_frames(&self, offload: bool) {
        self.offload_frames.store(offload, Ordering::SeqCst);
    }

    pub fn offload_frames(&self) -> bool {
        self.offload_frames.load(Ordering::SeqCst)
    }

    /// Store the model state handle produced by initialisation.
    pub fn put_state(&self, state: Box<dyn InferenceState>) {
        *self.state.lock() = Some(state);
    }

    /// Take ownership of the model state, leaving the row stateless.
    ///
    /// The caller drops the handle *outside* the admission lock so device
    /// memory release never blocks bookkeeping.
    pub fn take_state(&self) -> Option<Box<dyn InferenceState>> {
        self.state.lock().take()
    }

    pub fn has_state(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Exclusive access to the model state slot. Lock order: the inference
    /// mutex is acquired before this, never while holding the admission lock.
    pub fn state(&self) -> &Mutex<Option<Box<dyn InferenceState>>> {
        &self.state
    }

    /// One-line diagnostic fragment for session-stats logging.
    ///
    /// Uses `try_lock` so a propagation mid-step never blocks logging.
    pub fn describe(&self) -> String {
        let body = match self.state.try_lock() {
            Some(guard) => match guard.as_ref() {
                Some(state) => format!(
                    "{} frames, {} objects",
                    state.num_frames(),
                    state.object_ids().len()
                ),
                None => "no state".to_string(),
            },
            None => "state busy".to_string(),
        };
        let frames = if self.offload_frames() {
            "offloaded"
        } else {
            "on device"
        };
        format!(
            "'{}' ({body}, last active: {:.1}s ago, frames: {frames})",
            self.id,
            self.idle_for().as_secs_f64()
        )
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("video_path", &self.video_path)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Registry of live and queued sessions plus the active-id set whose
/// cardinality gates admission.
///
/// The table owns no locks: it lives inside the admission controller's
/// single bookkeeping mutex, so membership of the map, the active set, and
/// the wait queue always mutate atomically with respect to each other.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<String, Arc<Session>>,
    active: HashSet<String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Arc<Session>) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Session>> {
        self.active.remove(id);
        self.sessions.remove(id)
    }

    /// Add the id to the active set; false if it was already there.
    pub fn mark_active(&mut self, id: &str) -> bool {
        self.active.insert(id.to_string())
    }

    /// Drop the id from the active set; false if it was not active.
    pub fn unmark_active(&mut self, id: &str) -> bool {
        self.active.remove(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains(id)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Clone out every row for lock-free iteration by the caller.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> StartSessionRequest {
        StartSessionRequest {
            session_id: None,
            path: path.to_string(),
            video_metadata: None,
            keep_frames_on_gpu: false,
        }
    }

    #[test]
    fn new_session_is_queued_and_stateless() {
        let s = Session::new("s1", &request("/v.mp4"), 1_000.0);
        assert_eq!(s.status(), SessionStatus::Queued);
        assert!(!s.has_state());
        assert!(!s.is_canceled());
        assert!(s.offload_frames());
    }

    #[test]
    fn mark_processing_records_start_time() {
        let s = Session::new("s1", &request("/v.mp4"), 1_000.0);
        s.mark_processing(1_001.5);
        assert_eq!(s.status(), SessionStatus::Processing);
        assert_eq!(s.processing_start(), Some(1_001.5));
    }

    #[test]
    fn table_active_set_tracks_membership() {
        let mut table = SessionTable::new();
        table.insert(Arc::new(Session::new("a", &request("/a"), 0.0)));
        table.insert(Arc::new(Session::new("b", &request("/b"), 0.0)));

        assert!(table.mark_active("a"));
        assert!(!table.mark_active("a"));
        assert_eq!(table.active_len(), 1);

        table.remove("a");
        assert_eq!(table.active_len(), 0);
        assert!(table.get("a").is_none());
        assert!(table.get("b").is_some());
    }

    #[test]
    fn take_state_empties_the_slot() {
        let s = Session::new("s1", &request("/v.mp4"), 0.0);
        assert!(s.take_state().is_none());
    }
}
