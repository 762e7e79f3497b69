//! # seginfer — session core for interactive video-segmentation servers
//!
//! A Rust library implementing the session admission, queueing, and
//! lifecycle core of a video-segmentation inference server. Clients
//! request interactive tracking sessions against an expensive
//! device-resident model; this crate decides which sessions run
//! immediately, which wait in a durable FIFO, and when idle sessions are
//! reclaimed so device memory does not leak.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Embedding server (HTTP/WS adapter, not here) │
//! ├───────────────────────────────────────────────┤
//! │  SessionApi     — public facade, orchestrator │
//! │  Admission      — concurrency cap, FIFO queue │
//! ├───────────────────────────────────────────────┤
//! │  Driver         — init + streaming propagation│
//! │  Reaper         — idle-session reclamation    │
//! │  Session        — rows, table, model-state own│
//! ├───────────────────────────────────────────────┤
//! │  QueueStore     — durable queue image (JSON)  │
//! │  MaskCodec      — COCO RLE ↔ bitmap           │
//! │  ModelBackend   — external segmentation model │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency model
//!
//! Request handlers run on arbitrary threads. Two locks with disjoint
//! duties coordinate them: the admission controller's bookkeeping mutex
//! (queue, active set, session rows — held only for bookkeeping and
//! queue-file persistence) and the inference mutex wrapping the model
//! backend (the model is not thread-safe). The bookkeeping lock is never
//! held while the inference lock is taken. Streaming propagation runs on
//! worker threads that re-acquire the inference lock per frame, so
//! cancellation and reaping stay observable between frames.
//!
//! ## Quick start
//!
//! ```no_run
//! use seginfer::{Config, SessionApi};
//! use seginfer::types::StartSessionRequest;
//!
//! # fn backend() -> Box<dyn seginfer::ModelBackend> { unimplemented!() }
//! let api = SessionApi::new(backend(), Config::default()).unwrap();
//! let reaper = api.spawn_reaper();
//!
//! let response = api.start_session(StartSessionRequest {
//!     session_id: None,
//!     path: "/videos/demo.mp4".into(),
//!     video_metadata: None,
//!     keep_frames_on_gpu: false,
//! });
//! println!("queued: {} (position {})", response.queued, response.queue_position);
//!
//! reaper.stop();
//! ```
//!
//! ## Crate layout
//!
//! - [`api`] — [`SessionApi`] facade binding the components together.
//! - [`admission`] — [`AdmissionController`]: concurrency cap, FIFO wait
//!   queue, restart recovery.
//! - [`driver`] — session initialisation and [`PropagationStream`].
//! - [`reaper`] — periodic idle-timeout scan and [`ReaperHandle`].
//! - [`session`] — [`Session`] rows and the [`SessionTable`] registry.
//! - [`store`] — [`QueueStore`], the persisted queue image.
//! - [`codec`] — [`MaskCodec`] trait and the COCO RLE implementation.
//! - [`backend`] — [`ModelBackend`] and [`InferenceState`] interfaces.
//! - [`config`] — [`Config`], device and checkpoint selection.
//! - [`types`] — wire request/response shapes.
//! - [`error`] — [`Error`] enum and [`Result`] alias.

pub mod admission;
pub mod api;
pub mod backend;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod reaper;
pub mod session;
pub mod store;
pub mod types;

pub use admission::AdmissionController;
pub use api::SessionApi;
pub use backend::{FrameMasks, InferenceState, MemoryStats, ModelBackend};
pub use codec::{BitMask, CocoRleCodec, MaskCodec};
pub use config::{Config, Device, ModelSize, select_device};
pub use driver::{Direction, PropagationStream};
pub use error::{Error, Result};
pub use reaper::ReaperHandle;
pub use session::{Session, SessionTable};
pub use store::{QueueEntry, QueueStore};
pub use types::SessionStatus;
