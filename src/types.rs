//! Request and response shapes for the session API.
//!
//! These mirror the wire protocol field-for-field; transport and parsing
//! live in the embedding server, which hands fully-formed requests to
//! [`SessionApi`](crate::api::SessionApi). All shapes derive serde so the
//! pending queue can snapshot a [`StartSessionRequest`] verbatim.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session as reported by `queue_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting in the FIFO for a free slot.
    Queued,
    /// Admitted; model state is being (or has been) initialised.
    Processing,
    /// Closed by the client or reclaimed after going idle.
    Completed,
    /// Model-state initialisation failed.
    Error,
    /// The id is unknown to the session table (wire-only; never stored).
    NotFound,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Queued => write!(f, "queued"),
            SessionStatus::Processing => write!(f, "processing"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::NotFound => write!(f, "not_found"),
        }
    }
}

/// Optional per-video metadata supplied by the client at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub fps: f32,
    #[serde(default)]
    pub frame_count: u32,
}

/// COCO run-length encoded binary mask.
///
/// `size` is `[height, width]`; `counts` is the compressed ASCII run-length
/// string produced by [`MaskCodec::encode`](crate::codec::MaskCodec::encode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RleMask {
    pub size: [u32; 2],
    pub counts: String,
}

/// Request to start (or resume polling for) a tracking session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Client-supplied id; the server mints one when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Location the model backend reads video frames from.
    pub path: String,
    #[serde(default)]
    pub video_metadata: Option<VideoMetadata>,
    /// Keep decoded frames on the accelerator instead of host memory.
    /// Honoured only on the primary accelerator device.
    #[serde(default)]
    pub keep_frames_on_gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    /// True when the session was appended to the wait queue.
    pub queued: bool,
    /// 1-based queue position; 0 when admitted immediately.
    pub queue_position: usize,
    /// Estimated wait in whole seconds; 0 when admitted immediately.
    pub estimated_wait_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    /// 1-based queue position; 0 for non-queued states, -1 for `not_found`.
    pub position: i64,
    /// Estimated wait in whole seconds; -1 for `not_found`.
    pub estimated_wait_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPointsRequest {
    pub session_id: String,
    pub frame_index: u32,
    pub object_id: i64,
    /// `[x, y]` pairs in frame pixel coordinates.
    pub points: Vec<[f32; 2]>,
    /// 1 for foreground clicks, 0 for background clicks.
    pub labels: Vec<u32>,
    #[serde(default)]
    pub clear_old_points: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMaskRequest {
    pub session_id: String,
    pub frame_index: u32,
    pub object_id: i64,
    pub mask: RleMask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearPointsInFrameRequest {
    pub session_id: String,
    pub frame_index: u32,
    pub object_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearPointsInVideoRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearPointsInVideoResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveObjectRequest {
    pub session_id: String,
    pub object_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveObjectResponse {
    /// Updated masks for every frame the object had touched, in the order
    /// the backend produced them.
    pub results: Vec<PropagateData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateInVideoRequest {
    pub session_id: String,
    pub start_frame_index: u32,
    /// `forward`, `backward`, or `both` (default).
    #[serde(default)]
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPropagateInVideoRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPropagateResponse {
    pub success: bool,
}

/// Mask for one tracked object on one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMask {
    pub object_id: i64,
    pub mask: RleMask,
}

/// Per-frame result element of edits and propagation streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagateData {
    pub frame_index: u32,
    pub results: Vec<ObjectMask>,
}
