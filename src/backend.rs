//! Model backend interface.
//!
//! The segmentation model is an external collaborator: a stateful,
//! non-thread-safe engine holding one opaque inference state per session.
//! Every call into a [`ModelBackend`] is serialised by the core's single
//! inference mutex; implementations may assume they are never entered
//! concurrently.
//!
//! ## Implementing a backend
//!
//! 1. Define a state type and implement [`InferenceState`] for it.
//! 2. Implement [`ModelBackend`], downcasting the state handle via
//!    [`InferenceState::as_any_mut`] in each call.
//! 3. Hand the boxed backend to
//!    [`SessionApi::new`](crate::api::SessionApi::new).
//!
//! Propagation is exposed as a resumable cursor rather than a borrowed
//! iterator: [`begin_pass`](ModelBackend::begin_pass) arms a directional
//! sweep inside the state, and [`next_masks`](ModelBackend::next_masks)
//! steps it one frame at a time. The driver re-acquires the inference lock
//! around each step, so cancellation and reaping stay observable between
//! frames.

use std::any::Any;

use crate::codec::BitMask;
use crate::config::Device;
use crate::error::Result;

/// Opaque per-session model state created by [`ModelBackend::init_state`].
///
/// Owned by the session row; dropped on close, reap, or init failure.
/// Dropping must release any device memory the state holds.
pub trait InferenceState: Send {
    /// Downcast hook for the owning backend.
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send);

    /// Number of video frames this state covers.
    fn num_frames(&self) -> usize;

    /// Ids of the objects currently tracked.
    fn object_ids(&self) -> Vec<i64>;
}

/// Binary masks for every tracked object on one frame, already moved off
/// the accelerator.
#[derive(Debug, Clone)]
pub struct FrameMasks {
    pub frame_index: u32,
    /// `(object_id, mask)` pairs in the order the model produced them.
    pub masks: Vec<(i64, BitMask)>,
}

/// Accelerator memory usage snapshot, in MiB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub allocated_mb: u64,
    pub reserved_mb: u64,
}

impl std::fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} MiB used, {} MiB reserved",
            self.allocated_mb, self.reserved_mb
        )
    }
}

/// Stateful per-session segmentation engine.
///
/// The model is the scarce resource: it is not thread-safe and every method
/// here runs under the core's inference mutex.
pub trait ModelBackend: Send {
    /// Load a video and build fresh inference state for it.
    ///
    /// `offload_frames` keeps decoded frame tensors in host memory rather
    /// than on the accelerator, bounding device-memory fragmentation.
    fn init_state(
        &mut self,
        video_path: &str,
        offload_frames: bool,
    ) -> Result<Box<dyn InferenceState>>;

    /// Add point prompts on one frame, returning that frame's masks.
    fn add_prompts(
        &mut self,
        state: &mut dyn InferenceState,
        frame_index: u32,
        object_id: i64,
        points: &[[f32; 2]],
        labels: &[u32],
        clear_old_points: bool,
    ) -> Result<FrameMasks>;

    /// Add a mask prompt on one frame, overwriting any point prompts there.
    fn add_mask(
        &mut self,
        state: &mut dyn InferenceState,
        frame_index: u32,
        object_id: i64,
        mask: &BitMask,
    ) -> Result<FrameMasks>;

    /// Remove all prompts for `object_id` on one frame.
    fn clear_frame(
        &mut self,
        state: &mut dyn InferenceState,
        frame_index: u32,
        object_id: i64,
    ) -> Result<FrameMasks>;

    /// Remove every prompt across the whole video.
    fn reset_prompts(&mut self, state: &mut dyn InferenceState) -> Result<()>;

    /// Drop an object from tracking, returning updated masks for every
    /// frame the object had touched.
    fn remove_object(
        &mut self,
        state: &mut dyn InferenceState,
        object_id: i64,
    ) -> Result<Vec<FrameMasks>>;

    /// Arm a directional propagation sweep starting at `start_frame_index`.
    fn begin_pass(
        &mut self,
        state: &mut dyn InferenceState,
        start_frame_index: u32,
        reverse: bool,
    ) -> Result<()>;

    /// Step the armed sweep one frame; `None` when the pass is exhausted.
    fn next_masks(
        &mut self,
        state: &mut dyn InferenceState,
    ) -> Result<Option<FrameMasks>>;

    /// Ask the accelerator to release cached allocations. Advisory and
    /// idempotent; a no-op on CPU backends.
    fn flush_cache(&mut self);

    /// Trigger general memory reclamation after session teardown.
    fn collect_garbage(&mut self) {}

    /// Device this backend computes on.
    fn device(&self) -> Device;

    /// Current accelerator memory usage, when the device exposes it.
    fn memory_stats(&self) -> Option<MemoryStats> {
        None
    }
}
