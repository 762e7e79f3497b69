//! Request entry points binding admission, driver, and reaper together.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::admission::AdmissionController;
use crate::backend::{InferenceState, MemoryStats, ModelBackend};
use crate::codec::{CocoRleCodec, MaskCodec};
use crate::config::{Config, Device};
use crate::driver::{self, Direction, PropagationStream};
use crate::error::{Error, Result};
use crate::reaper::{self, ReaperHandle};
use crate::session::Session;
use crate::store::QueueStore;
use crate::types::{
    AddMaskRequest, AddPointsRequest, CancelPropagateInVideoRequest,
    CancelPropagateResponse, ClearPointsInFrameRequest, ClearPointsInVideoRequest,
    ClearPointsInVideoResponse, CloseSessionRequest, CloseSessionResponse,
    PropagateData, PropagateInVideoRequest, QueueStatusRequest, QueueStatusResponse,
    RemoveObjectRequest, RemoveObjectResponse, StartSessionRequest,
    StartSessionResponse,
};

/// Shared internals of the session core.
///
/// `backend` *is* the inference lock: every model call goes through this
/// mutex, serialising access to the non-thread-safe model. The admission
/// controller's own lock is never held while this one is taken.
pub(crate) struct Core {
    pub config: Config,
    pub device: Device,
    pub backend: Mutex<Box<dyn ModelBackend>>,
    pub codec: Box<dyn MaskCodec>,
    pub admission: AdmissionController,
}

impl Core {
    /// Advisory accelerator cache flush; idempotent, no-op on CPU.
    pub fn flush_accelerator(&self) {
        self.backend.lock().flush_cache();
    }

    /// General reclamation after session teardown: garbage collection
    /// followed by a cache flush.
    pub fn collect_garbage(&self) {
        let mut backend = self.backend.lock();
        backend.collect_garbage();
        backend.flush_cache();
    }

    pub fn memory_stats(&self) -> Option<MemoryStats> {
        self.backend.lock().memory_stats()
    }
}

/// High-level session API facade.
///
/// Owns the admission controller, the model backend behind the inference
/// mutex, and the mask codec. One instance is constructed at startup and
/// passed into request handlers; there is no ambient global state.
pub struct SessionApi {
    core: Arc<Core>,
}

impl SessionApi {
    /// Build the core with the default COCO RLE codec.
    pub fn new(backend: Box<dyn ModelBackend>, config: Config) -> Result<Self> {
        Self::with_codec(backend, Box::new(CocoRleCodec), config)
    }

    /// Build the core with a custom mask codec.
    ///
    /// Replays the persisted queue and pumps exactly once at the end of
    /// construction, when the backend is ready to initialise sessions.
    pub fn with_codec(
        backend: Box<dyn ModelBackend>,
        codec: Box<dyn MaskCodec>,
        config: Config,
    ) -> Result<Self> {
        let device = backend.device();
        let store = QueueStore::new(config.queue_path.clone())?;
        let admission = AdmissionController::new(&config, store);

        let core = Arc::new(Core {
            config,
            device,
            backend: Mutex::new(backend),
            codec,
            admission,
        });

        driver::pump(&core);

        Ok(SessionApi { core })
    }

    /// Request a tracking session: admit immediately when a slot is free,
    /// otherwise append to the wait queue.
    pub fn start_session(&self, request: StartSessionRequest) -> StartSessionResponse {
        let (response, admission) = self.core.admission.submit(request);
        if let Some(admission) = admission {
            driver::launch(&self.core, vec![admission]);
        }
        response
    }

    /// Close a session: remove it from queue and active set, release its
    /// model state, and admit the next waiter.
    pub fn close_session(&self, request: CloseSessionRequest) -> CloseSessionResponse {
        let session_id = &request.session_id;
        let outcome = self.core.admission.close(session_id);

        if !outcome.known {
            tracing::warn!(
                session_id,
                stats = %self.core.admission.session_stats(),
                "close of unknown session"
            );
            return CloseSessionResponse { success: false };
        }

        // Release device memory outside the admission lock.
        if let Some(session) = &outcome.session
            && let Some(state) = session.take_state()
        {
            let before = self.core.memory_stats();
            drop(state);
            self.core.collect_garbage();
            match (before, self.core.memory_stats()) {
                (Some(before), Some(after)) => tracing::info!(
                    session_id,
                    memory_before = %before,
                    memory_after = %after,
                    stats = %self.core.admission.session_stats(),
                    "session closed"
                ),
                _ => tracing::info!(
                    session_id,
                    stats = %self.core.admission.session_stats(),
                    "session closed"
                ),
            }
        } else {
            tracing::info!(session_id, "session closed before it held model state");
        }

        if outcome.queue_changed || outcome.freed_slot {
            driver::pump(&self.core);
        }

        CloseSessionResponse { success: true }
    }

    /// Where a session stands: status, queue position, estimated wait.
    pub fn queue_status(&self, request: QueueStatusRequest) -> QueueStatusResponse {
        self.core.admission.status(&request.session_id)
    }

    /// Add point prompts on one frame and return that frame's masks.
    pub fn add_points(&self, request: AddPointsRequest) -> Result<PropagateData> {
        if request.points.len() != request.labels.len() {
            return Err(Error::InvalidArgument(format!(
                "{} points but {} labels",
                request.points.len(),
                request.labels.len()
            )));
        }

        let session = self.resolve(&request.session_id)?;
        let frame = self.with_model(&session, |backend, state| {
            backend.add_prompts(
                state,
                request.frame_index,
                request.object_id,
                &request.points,
                &request.labels,
                request.clear_old_points,
            )
        })?;
        self.core.flush_accelerator();
        Ok(driver::encode_frame(self.core.codec.as_ref(), frame))
    }

    /// Add a mask prompt on one frame, overwriting point prompts there.
    pub fn add_mask(&self, request: AddMaskRequest) -> Result<PropagateData> {
        let mask = self.core.codec.decode(&request.mask)?;
        let session = self.resolve(&request.session_id)?;
        tracing::info!(
            session_id = %request.session_id,
            frame_index = request.frame_index,
            object_id = request.object_id,
            "add mask"
        );
        let frame = self.with_model(&session, |backend, state| {
            backend.add_mask(state, request.frame_index, request.object_id, &mask)
        })?;
        Ok(driver::encode_frame(self.core.codec.as_ref(), frame))
    }

    /// Remove all prompts for one object on one frame.
    pub fn clear_points_in_frame(
        &self,
        request: ClearPointsInFrameRequest,
    ) -> Result<PropagateData> {
        let session = self.resolve(&request.session_id)?;
        tracing::info!(
            session_id = %request.session_id,
            frame_index = request.frame_index,
            object_id = request.object_id,
            "clear prompts in frame"
        );
        let frame = self.with_model(&session, |backend, state| {
            backend.clear_frame(state, request.frame_index, request.object_id)
        })?;
        Ok(driver::encode_frame(self.core.codec.as_ref(), frame))
    }

    /// Remove every prompt across the whole video.
    pub fn clear_points_in_video(
        &self,
        request: ClearPointsInVideoRequest,
    ) -> Result<ClearPointsInVideoResponse> {
        let session = self.resolve(&request.session_id)?;
        tracing::info!(session_id = %request.session_id, "clear prompts in video");
        self.with_model(&session, |backend, state| backend.reset_prompts(state))?;
        Ok(ClearPointsInVideoResponse { success: true })
    }

    /// Drop an object from tracking. Returns updated masks for every frame
    /// the object had touched, in the order the backend produced them.
    pub fn remove_object(&self, request: RemoveObjectRequest) -> Result<RemoveObjectResponse> {
        let session = self.resolve(&request.session_id)?;
        tracing::info!(
            session_id = %request.session_id,
            object_id = request.object_id,
            "remove object"
        );
        let frames = self.with_model(&session, |backend, state| {
            backend.remove_object(state, request.object_id)
        })?;
        let results = frames
            .into_iter()
            .map(|frame| driver::encode_frame(self.core.codec.as_ref(), frame))
            .collect();
        Ok(RemoveObjectResponse { results })
    }

    /// Start streaming propagation over the video.
    ///
    /// The returned stream yields one element per frame, forward from the
    /// start frame and then backward (per the requested direction), and
    /// ends cleanly on cancellation or consumer drop.
    pub fn propagate_in_video(
        &self,
        request: PropagateInVideoRequest,
    ) -> Result<PropagationStream> {
        let direction = Direction::parse(request.direction.as_deref())?;
        let session = self.resolve(&request.session_id)?;
        if !session.has_state() {
            return Err(Error::SessionExpired(request.session_id));
        }
        Ok(driver::open_stream(
            self.core.clone(),
            session,
            request.start_frame_index,
            direction,
        ))
    }

    /// Ask a running propagation to stop at its next frame boundary.
    pub fn cancel_propagate_in_video(
        &self,
        request: CancelPropagateInVideoRequest,
    ) -> Result<CancelPropagateResponse> {
        let session = self.resolve(&request.session_id)?;
        if !session.has_state() {
            return Err(Error::SessionExpired(request.session_id));
        }
        session.set_canceled(true);
        tracing::info!(session_id = %session.id, "propagation cancel requested");
        Ok(CancelPropagateResponse { success: true })
    }

    /// Run one idle-session reclamation pass immediately.
    ///
    /// The background reaper calls this on its own schedule; embedders and
    /// tests may drive it directly. Returns how many sessions were reclaimed.
    pub fn reap_idle_sessions(&self) -> usize {
        reaper::tick(&self.core)
    }

    /// Start the background reaper thread.
    pub fn spawn_reaper(&self) -> ReaperHandle {
        reaper::spawn(self.core.clone())
    }

    /// The admission controller, for status introspection.
    pub fn admission(&self) -> &AdmissionController {
        &self.core.admission
    }

    fn resolve(&self, session_id: &str) -> Result<Arc<Session>> {
        self.core
            .admission
            .lookup(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Run one synchronous model call under the inference mutex.
    ///
    /// Resolves the state slot after taking the mutex, so an id reclaimed
    /// in the meantime fails with `SessionExpired`. Heartbeats on entry;
    /// on backend failure, logs and flushes the cache before propagating.
    fn with_model<R>(
        &self,
        session: &Session,
        op: impl FnOnce(&mut dyn ModelBackend, &mut dyn InferenceState) -> Result<R>,
    ) -> Result<R> {
        let mut backend = self.core.backend.lock();
        let mut slot = session.state().lock();
        let state = slot
            .as_deref_mut()
            .ok_or_else(|| Error::SessionExpired(session.id.clone()))?;
        session.touch();

        match op(&mut **backend, state) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "model operation failed");
                backend.flush_cache();
                Err(e)
            }
        }
    }
}
