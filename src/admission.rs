//! Admission control: bounded concurrency and the durable FIFO wait queue.
//!
//! One controller owns the single bookkeeping lock covering the pending
//! queue, the active-id set, and the session table. Holding them under one
//! mutex keeps the core invariants atomic:
//!
//! - the active set never exceeds `max_concurrent_sessions`,
//! - an id is in at most one of {queue, active set},
//! - promotion is strict FIFO (position `i + 1` never admits before `i`),
//! - the on-disk queue image matches the in-memory queue at every
//!   mutation boundary.
//!
//! The lock is held only for bookkeeping and queue-file persistence, never
//! across a model call. Admission work itself (model-state initialisation)
//! is returned to the caller as [`Admission`] values to launch on fresh
//! threads — continuations are never run recursively under the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::session::{Session, SessionTable, unix_time};
use crate::store::{QueueEntry, QueueStore};
use crate::types::{
    QueueStatusResponse, SessionStatus, StartSessionRequest, StartSessionResponse,
};

/// A session the controller just promoted to `processing`. The caller owns
/// launching its model-state initialisation on a fresh thread.
pub(crate) struct Admission {
    pub session: Arc<Session>,
    pub request: StartSessionRequest,
}

/// What [`AdmissionController::close`] found and changed.
pub(crate) struct CloseOutcome {
    /// The id existed somewhere: queue, active set, or table.
    pub known: bool,
    /// A queue entry was removed (the image was re-persisted).
    pub queue_changed: bool,
    /// The id held an active slot that is now free.
    pub freed_slot: bool,
    pub session: Option<Arc<Session>>,
}

/// What evicting one idle session changed.
pub(crate) struct EvictOutcome {
    pub queue_changed: bool,
    pub freed_slot: bool,
    /// Row whose model state must be released by the caller, outside the lock.
    pub session: Option<Arc<Session>>,
}

struct AdmissionState {
    queue: VecDeque<QueueEntry>,
    table: SessionTable,
}

/// Enforces the concurrency cap, persists the wait queue, and admits
/// waiters in arrival order.
pub struct AdmissionController {
    state: Mutex<AdmissionState>,
    store: QueueStore,
    max_concurrent: usize,
    /// Exponentially smoothed admission-to-ready time, seconds.
    avg_processing_time: Mutex<f64>,
}

impl AdmissionController {
    /// Build the controller and replay the persisted queue.
    ///
    /// Each recovered entry becomes a `queued` row with its original
    /// `enqueue_time`. Active sessions are *not* restored — their model
    /// state died with the previous process. The first
    /// [`pump`](Self::pump) is the facade's responsibility, after the
    /// model backend is ready.
    pub fn new(config: &Config, store: QueueStore) -> Self {
        let entries = store.load().unwrap_or_else(|e| {
            tracing::error!(error = %e, "queue recovery failed, starting empty");
            Vec::new()
        });

        let mut state = AdmissionState {
            queue: VecDeque::new(),
            table: SessionTable::new(),
        };
        for entry in entries {
            if state.table.contains(&entry.session_id) {
                tracing::warn!(session_id = %entry.session_id, "duplicate queue record skipped");
                continue;
            }
            let session = Arc::new(Session::new(
                &entry.session_id,
                &entry.request,
                entry.enqueue_time,
            ));
            state.table.insert(session);
            state.queue.push_back(entry);
        }
        if !state.queue.is_empty() {
            tracing::info!(restored = state.queue.len(), "recovered pending sessions");
        }

        AdmissionController {
            state: Mutex::new(state),
            store,
            max_concurrent: config.max_concurrent_sessions,
            avg_processing_time: Mutex::new(config.initial_avg_processing_time),
        }
    }

    /// Decide admission for a start request.
    ///
    /// Idempotent for known ids: a `processing` or `completed` session is
    /// returned unchanged, and a `queued` session reports its current
    /// position instead of being enqueued twice. An `error` session is
    /// treated as a fresh submission so the client can retry.
    pub(crate) fn submit(
        &self,
        request: StartSessionRequest,
    ) -> (StartSessionResponse, Option<Admission>) {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = unix_time();

        let mut st = self.state.lock();

        if let Some(existing) = st.table.get(&session_id) {
            match existing.status() {
                SessionStatus::Processing | SessionStatus::Completed => {
                    tracing::info!(session_id = %session_id, status = %existing.status(), "resubmit of live session");
                    return (
                        StartSessionResponse {
                            session_id,
                            queued: false,
                            queue_position: 0,
                            estimated_wait_time: 0,
                        },
                        None,
                    );
                }
                SessionStatus::Queued => {
                    let position = queue_position(&st.queue, &session_id).unwrap_or(0);
                    let wait = self.estimate_wait(position);
                    tracing::info!(session_id = %session_id, position, "resubmit of queued session");
                    return (
                        StartSessionResponse {
                            session_id,
                            queued: true,
                            queue_position: position,
                            estimated_wait_time: wait,
                        },
                        None,
                    );
                }
                // A failed admission may be retried from scratch.
                SessionStatus::Error | SessionStatus::NotFound => {
                    st.table.remove(&session_id);
                }
            }
        }

        let session = Arc::new(Session::new(&session_id, &request, now));

        if st.table.active_len() < self.max_concurrent {
            session.mark_processing(now);
            st.table.insert(session.clone());
            st.table.mark_active(&session_id);
            tracing::info!(
                session_id = %session_id,
                active = st.table.active_len(),
                max = self.max_concurrent,
                "session admitted"
            );
            drop(st);
            return (
                StartSessionResponse {
                    session_id,
                    queued: false,
                    queue_position: 0,
                    estimated_wait_time: 0,
                },
                Some(Admission { session, request }),
            );
        }

        st.table.insert(session);
        st.queue.push_back(QueueEntry {
            session_id: session_id.clone(),
            request,
            enqueue_time: now,
        });
        let position = st.queue.len();
        let wait = self.estimate_wait(position);
        self.persist_locked(&st);
        tracing::info!(
            session_id = %session_id,
            position,
            estimated_wait_secs = wait,
            "session queued"
        );

        (
            StartSessionResponse {
                session_id,
                queued: true,
                queue_position: position,
                estimated_wait_time: wait,
            },
            None,
        )
    }

    /// Remove an id from the queue and the active set.
    ///
    /// The caller releases the row's model state outside the lock and, when
    /// a slot or queue position opened up, pumps on a fresh thread.
    pub(crate) fn close(&self, session_id: &str) -> CloseOutcome {
        let mut st = self.state.lock();

        let mut queue_changed = false;
        if let Some(pos) = st.queue.iter().position(|e| e.session_id == session_id) {
            st.queue.remove(pos);
            queue_changed = true;
            tracing::info!(session_id, position = pos + 1, "removed from queue");
        }

        let freed_slot = st.table.unmark_active(session_id);
        let session = st.table.get(session_id);
        if let Some(row) = &session {
            row.set_status(SessionStatus::Completed);
        }

        if queue_changed {
            self.persist_locked(&st);
        }

        CloseOutcome {
            known: queue_changed || freed_slot || session.is_some(),
            queue_changed,
            freed_slot,
            session,
        }
    }

    /// Admit queued sessions while capacity allows, in strict FIFO order.
    ///
    /// Defensive: a popped id that is somehow already active, or whose row
    /// has vanished, is skipped and the loop continues. Idempotent: with no
    /// intervening state change a second call admits nothing.
    pub(crate) fn pump(&self) -> Vec<Admission> {
        let mut admitted = Vec::new();
        let mut st = self.state.lock();
        let mut popped_any = false;

        while st.table.active_len() < self.max_concurrent {
            let Some(entry) = st.queue.pop_front() else {
                break;
            };
            popped_any = true;

            if st.table.is_active(&entry.session_id) {
                tracing::warn!(session_id = %entry.session_id, "queued id already active, skipping");
                continue;
            }
            let Some(session) = st.table.get(&entry.session_id) else {
                tracing::warn!(session_id = %entry.session_id, "queued id has no session row, skipping");
                continue;
            };

            session.mark_processing(unix_time());
            st.table.mark_active(&entry.session_id);
            tracing::info!(
                session_id = %entry.session_id,
                active = st.table.active_len(),
                remaining = st.queue.len(),
                "promoted from queue"
            );
            admitted.push(Admission {
                session,
                request: entry.request,
            });
        }

        if popped_any {
            self.persist_locked(&st);
        }
        admitted
    }

    /// Report where an id stands: its status, queue position, and wait.
    pub fn status(&self, session_id: &str) -> QueueStatusResponse {
        let st = self.state.lock();

        let Some(session) = st.table.get(session_id) else {
            return QueueStatusResponse {
                session_id: session_id.to_string(),
                status: SessionStatus::NotFound,
                position: -1,
                estimated_wait_time: -1,
            };
        };

        let status = session.status();
        if status != SessionStatus::Queued {
            return QueueStatusResponse {
                session_id: session_id.to_string(),
                status,
                position: 0,
                estimated_wait_time: 0,
            };
        }

        let position = queue_position(&st.queue, session_id).unwrap_or(0);
        let wait = self.estimate_wait(position);
        QueueStatusResponse {
            session_id: session_id.to_string(),
            status: SessionStatus::Queued,
            position: position as i64,
            estimated_wait_time: wait as i64,
        }
    }

    /// Point lookup of a session row.
    pub(crate) fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.state.lock().table.get(session_id)
    }

    /// Mark a failed admission: the slot is freed and the row keeps status
    /// `error` so the client can observe (and later retry) the failure.
    pub(crate) fn fail_admission(&self, session_id: &str) -> bool {
        let mut st = self.state.lock();
        let freed = st.table.unmark_active(session_id);
        if let Some(session) = st.table.get(session_id) {
            session.set_status(SessionStatus::Error);
        }
        freed
    }

    /// Fold one observed admission-to-ready time into the estimate.
    pub(crate) fn observe_processing_time(&self, observed_secs: f64) -> f64 {
        let mut avg = self.avg_processing_time.lock();
        *avg = 0.7 * *avg + 0.3 * observed_secs;
        *avg
    }

    pub fn avg_processing_time(&self) -> f64 {
        *self.avg_processing_time.lock()
    }

    /// Rows idle longer than the timeout, for the reaper.
    pub(crate) fn collect_idle(&self, timeout: std::time::Duration) -> Vec<Arc<Session>> {
        self.state
            .lock()
            .table
            .snapshot()
            .into_iter()
            .filter(|s| s.idle_for() > timeout)
            .collect()
    }

    /// Evict one expired id from queue, active set, and (for rows already
    /// terminal) the table itself.
    pub(crate) fn evict(&self, session_id: &str) -> EvictOutcome {
        let mut st = self.state.lock();

        let mut queue_changed = false;
        if let Some(pos) = st.queue.iter().position(|e| e.session_id == session_id) {
            st.queue.remove(pos);
            queue_changed = true;
        }
        let freed_slot = st.table.unmark_active(session_id);

        let session = match st.table.get(session_id) {
            Some(row) => match row.status() {
                // Already reclaimed earlier; this pass prunes the row.
                SessionStatus::Completed | SessionStatus::Error => {
                    st.table.remove(session_id);
                    tracing::debug!(session_id, "pruned terminal session row");
                    None
                }
                _ => {
                    row.set_status(SessionStatus::Completed);
                    Some(row)
                }
            },
            None => None,
        };

        if queue_changed {
            self.persist_locked(&st);
        }

        EvictOutcome {
            queue_changed,
            freed_slot,
            session,
        }
    }

    /// Persist the queue image from inside the bookkeeping lock.
    ///
    /// Availability over durability: a failed save is logged and the
    /// admission decision stands.
    fn persist_locked(&self, st: &AdmissionState) {
        let entries: Vec<QueueEntry> = st.queue.iter().cloned().collect();
        if let Err(e) = self.store.save(&entries) {
            tracing::warn!(error = %e, "queue persistence failed, continuing");
        }
    }

    fn estimate_wait(&self, position: usize) -> u64 {
        (position as f64 * self.avg_processing_time()) as u64
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().table.active_len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// One-line summary of live sessions for lifecycle logging.
    pub(crate) fn session_stats(&self) -> String {
        let rows = self.state.lock().table.snapshot();
        let parts: Vec<String> = rows.iter().map(|s| s.describe()).collect();
        format!("live sessions: [{}]", parts.join(", "))
    }

    /// Validate a persistence round-trip of the current queue (diagnostics).
    pub fn verify_persisted_queue(&self) -> Result<bool> {
        let st = self.state.lock();
        let on_disk = self.store.load()?;
        let matches = on_disk.len() == st.queue.len()
            && on_disk
                .iter()
                .zip(st.queue.iter())
                .all(|(a, b)| a.session_id == b.session_id);
        Ok(matches)
    }
}

fn queue_position(queue: &VecDeque<QueueEntry>, session_id: &str) -> Option<usize> {
    queue
        .iter()
        .position(|e| e.session_id == session_id)
        .map(|i| i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max: usize, dir: &std::path::Path) -> AdmissionController {
        let config = Config {
            max_concurrent_sessions: max,
            ..Config::default()
        };
        let store = QueueStore::new(dir.join("queue_data.json")).unwrap();
        AdmissionController::new(&config, store)
    }

    fn request(id: &str) -> StartSessionRequest {
        StartSessionRequest {
            session_id: Some(id.to_string()),
            path: format!("/videos/{id}.mp4"),
            video_metadata: None,
            keep_frames_on_gpu: false,
        }
    }

    #[test]
    fn admits_up_to_capacity_then_queues_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(2, dir.path());

        let (a, adm_a) = ctl.submit(request("a"));
        let (b, adm_b) = ctl.submit(request("b"));
        assert!(!a.queued && !b.queued);
        assert!(adm_a.is_some() && adm_b.is_some());

        let (c, adm_c) = ctl.submit(request("c"));
        let (d, adm_d) = ctl.submit(request("d"));
        assert!(c.queued && d.queued);
        assert!(adm_c.is_none() && adm_d.is_none());
        assert_eq!(c.queue_position, 1);
        assert_eq!(d.queue_position, 2);
        assert_eq!(c.estimated_wait_time, 60);
        assert_eq!(d.estimated_wait_time, 120);
    }

    #[test]
    fn resubmit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());

        ctl.submit(request("a"));
        let (again, adm) = ctl.submit(request("a"));
        assert!(!again.queued);
        assert!(adm.is_none());
        assert_eq!(ctl.active_len(), 1);

        ctl.submit(request("b"));
        let (b_again, adm) = ctl.submit(request("b"));
        assert!(b_again.queued);
        assert!(adm.is_none());
        assert_eq!(b_again.queue_position, 1);
        assert_eq!(ctl.queue_len(), 1);
    }

    #[test]
    fn close_of_queued_session_preserves_relative_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());

        ctl.submit(request("a"));
        ctl.submit(request("b"));
        ctl.submit(request("c"));
        ctl.submit(request("d"));

        let outcome = ctl.close("c");
        assert!(outcome.known && outcome.queue_changed);
        assert!(!outcome.freed_slot);

        assert_eq!(ctl.status("b").position, 1);
        assert_eq!(ctl.status("d").position, 2);
    }

    #[test]
    fn close_frees_slot_and_pump_promotes_fifo_head() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(2, dir.path());

        ctl.submit(request("a"));
        ctl.submit(request("b"));
        ctl.submit(request("c"));
        ctl.submit(request("d"));

        let outcome = ctl.close("a");
        assert!(outcome.freed_slot);

        let admitted = ctl.pump();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].session.id, "c");
        assert_eq!(ctl.status("c").status, SessionStatus::Processing);
        assert_eq!(ctl.status("d").position, 1);
    }

    #[test]
    fn pump_is_idempotent_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());

        ctl.submit(request("a"));
        ctl.submit(request("b"));
        ctl.close("a");

        assert_eq!(ctl.pump().len(), 1);
        assert!(ctl.pump().is_empty());
        assert!(ctl.pump().is_empty());
    }

    #[test]
    fn status_of_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());
        let s = ctl.status("missing");
        assert_eq!(s.status, SessionStatus::NotFound);
        assert_eq!(s.position, -1);
        assert_eq!(s.estimated_wait_time, -1);
    }

    #[test]
    fn restart_recovers_queued_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ctl = controller(2, dir.path());
            ctl.submit(request("a"));
            ctl.submit(request("b"));
            ctl.submit(request("c"));
            ctl.submit(request("d"));
        }

        let ctl = controller(2, dir.path());
        // Active sessions died with the process; only the queue came back.
        assert_eq!(ctl.status("a").status, SessionStatus::NotFound);
        assert_eq!(ctl.status("c").status, SessionStatus::Queued);
        assert_eq!(ctl.status("c").position, 1);
        assert_eq!(ctl.status("d").position, 2);

        let admitted = ctl.pump();
        let ids: Vec<_> = admitted.iter().map(|a| a.session.id.as_str()).collect();
        assert_eq!(ids, ["c", "d"]);
    }

    #[test]
    fn persisted_image_tracks_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());

        ctl.submit(request("a"));
        ctl.submit(request("b"));
        ctl.submit(request("c"));
        assert!(ctl.verify_persisted_queue().unwrap());

        ctl.close("b");
        assert!(ctl.verify_persisted_queue().unwrap());

        ctl.close("a");
        ctl.pump();
        assert!(ctl.verify_persisted_queue().unwrap());
    }

    #[test]
    fn smoothing_converges_toward_observations() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());
        assert_eq!(ctl.avg_processing_time(), 60.0);

        let updated = ctl.observe_processing_time(10.0);
        assert!((updated - 45.0).abs() < 1e-9);
        ctl.observe_processing_time(10.0);
        assert!(ctl.avg_processing_time() < 45.0);
    }

    #[test]
    fn failed_admission_frees_slot_and_marks_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(1, dir.path());

        ctl.submit(request("a"));
        assert!(ctl.fail_admission("a"));
        assert_eq!(ctl.active_len(), 0);
        assert_eq!(ctl.status("a").status, SessionStatus::Error);

        // An errored id may be resubmitted from scratch.
        let (resp, adm) = ctl.submit(request("a"));
        assert!(!resp.queued);
        assert!(adm.is_some());
    }
}
