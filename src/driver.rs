//! Session initialisation and streaming propagation.
//!
//! The driver has two duties on behalf of the admission controller:
//!
//! - **Initialisation** — when a session is admitted, build its model state
//!   on a fresh thread. Success feeds the processing-time estimate; failure
//!   marks the session `error`, frees the slot, and pumps the queue.
//! - **Streaming** — [`PropagationStream`] runs the model over a range of
//!   frames on a worker thread, yielding one [`PropagateData`] per frame
//!   through a rendezvous channel. The consumer pulls at its own pace;
//!   dropping the stream is observed as a failed send and triggers the
//!   same cleanup as a natural end.
//!
//! Every backend call re-acquires the inference mutex and re-resolves the
//! session's state slot, so a reaper that cleared the state mid-stream
//! surfaces as [`Error::SessionExpired`] on the next frame rather than a
//! use-after-free, and cancellation is observed between frames.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use crate::admission::Admission;
use crate::api::Core;
use crate::backend::FrameMasks;
use crate::codec::MaskCodec;
use crate::config::Device;
use crate::error::{Error, Result};
use crate::session::{Session, unix_time};
use crate::types::{ObjectMask, PropagateData};

/// Frames between advisory accelerator cache flushes during streaming.
const CACHE_FLUSH_INTERVAL: u32 = 10;

/// Which way to sweep the video from the start frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    /// Forward first, then backward.
    Both,
}

impl Direction {
    /// Parse the wire value; `None` defaults to [`Both`](Self::Both).
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("both") => Ok(Direction::Both),
            Some("forward") => Ok(Direction::Forward),
            Some("backward") => Ok(Direction::Backward),
            Some(other) => Err(Error::InvalidArgument(format!(
                "invalid propagation direction: {other}"
            ))),
        }
    }

    /// The `reverse` flags of the sweeps to run, in order.
    fn passes(self) -> &'static [bool] {
        match self {
            Direction::Forward => &[false],
            Direction::Backward => &[true],
            Direction::Both => &[false, true],
        }
    }
}

/// Launch model-state initialisation for each admission on its own thread.
pub(crate) fn launch(core: &Arc<Core>, admissions: Vec<Admission>) {
    for admission in admissions {
        let core = core.clone();
        thread::spawn(move || initialize(core, admission));
    }
}

/// Pump the queue and launch whatever got admitted.
///
/// Continuations always run on fresh threads; nothing here recurses.
pub(crate) fn pump(core: &Arc<Core>) {
    let admissions = core.admission.pump();
    launch(core, admissions);
}

fn initialize(core: Arc<Core>, admission: Admission) {
    let Admission { session, request } = admission;

    // Frames stay in host memory by default on every device; only an
    // explicit opt-in on the primary accelerator keeps them resident.
    let offload = !(request.keep_frames_on_gpu && core.device == Device::Cuda);
    session.set_offload_frames(offload);

    let built = {
        let mut backend = core.backend.lock();
        backend.init_state(&session.video_path, offload)
    };

    match built {
        Ok(state) => {
            session.put_state(state);
            session.touch();
            if let Some(started) = session.processing_start() {
                let observed = unix_time() - started;
                let avg = core.admission.observe_processing_time(observed);
                tracing::info!(
                    session_id = %session.id,
                    processing_secs = observed,
                    avg_processing_secs = avg,
                    "session ready"
                );
            }
        }
        Err(e) => {
            tracing::error!(session_id = %session.id, error = %e, "session initialisation failed");
            core.admission.fail_admission(&session.id);
            core.flush_accelerator();
            pump(&core);
        }
    }
}

/// How a propagation worker finished.
#[derive(Debug)]
enum StreamEnd {
    /// Both sweeps ran to their natural end.
    Finished,
    /// The session's cancel flag was observed between frames.
    Canceled,
    /// The consumer dropped the stream before it was exhausted.
    Abandoned,
}

/// Lazy stream of per-frame propagation results.
///
/// Backed by a worker thread and a rendezvous channel: the next frame is
/// not computed until the previous one has been taken. Dropping the stream
/// stops the worker at its next send.
pub struct PropagationStream {
    rx: mpsc::Receiver<Result<PropagateData>>,
}

impl std::fmt::Debug for PropagationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationStream").finish_non_exhaustive()
    }
}

impl Iterator for PropagationStream {
    type Item = Result<PropagateData>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Spawn the propagation worker for one session.
pub(crate) fn open_stream(
    core: Arc<Core>,
    session: Arc<Session>,
    start_frame_index: u32,
    direction: Direction,
) -> PropagationStream {
    let (tx, rx) = mpsc::sync_channel::<Result<PropagateData>>(0);

    thread::spawn(move || {
        let memory_before = core.memory_stats();
        tracing::info!(
            session_id = %session.id,
            start_frame_index,
            ?direction,
            "propagation started"
        );

        let mut frames = 0u32;
        let end = run_stream(&core, &session, start_frame_index, direction, &tx, &mut frames);

        // Cache flush on every exit path: end, cancel, error, abandonment.
        core.flush_accelerator();

        match end {
            Ok(end) => {
                tracing::info!(
                    session_id = %session.id,
                    frames,
                    outcome = ?end,
                    "propagation ended"
                );
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, frames, error = %e, "propagation failed");
                let _ = tx.send(Err(e));
            }
        }

        if let (Some(before), Some(after)) = (memory_before, core.memory_stats()) {
            tracing::info!(
                session_id = %session.id,
                memory_before = %before,
                memory_after = %after,
                "propagation memory"
            );
        }
    });

    PropagationStream { rx }
}

fn run_stream(
    core: &Arc<Core>,
    session: &Arc<Session>,
    start_frame_index: u32,
    direction: Direction,
    tx: &mpsc::SyncSender<Result<PropagateData>>,
    frames: &mut u32,
) -> Result<StreamEnd> {
    session.set_canceled(false);
    session.touch();

    for &reverse in direction.passes() {
        {
            let mut backend = core.backend.lock();
            let mut slot = session.state().lock();
            let state = slot
                .as_deref_mut()
                .ok_or_else(|| Error::SessionExpired(session.id.clone()))?;
            backend.begin_pass(state, start_frame_index, reverse)?;
        }

        loop {
            if session.is_canceled() {
                return Ok(StreamEnd::Canceled);
            }

            let step = {
                let mut backend = core.backend.lock();
                let mut slot = session.state().lock();
                let Some(state) = slot.as_deref_mut() else {
                    return Err(Error::SessionExpired(session.id.clone()));
                };
                backend.next_masks(state)?
            };
            let Some(frame) = step else {
                break;
            };

            // Encode off the accelerator, outside both locks.
            let data = encode_frame(core.codec.as_ref(), frame);

            *frames += 1;
            if *frames % CACHE_FLUSH_INTERVAL == 0 {
                core.flush_accelerator();
            }
            session.touch();

            if tx.send(Ok(data)).is_err() {
                return Ok(StreamEnd::Abandoned);
            }
        }
    }

    Ok(StreamEnd::Finished)
}

/// Encode one frame's binary masks to RLE, dropping the raw bitmaps.
pub(crate) fn encode_frame(codec: &dyn MaskCodec, frame: FrameMasks) -> PropagateData {
    let results = frame
        .masks
        .into_iter()
        .map(|(object_id, mask)| ObjectMask {
            object_id,
            mask: codec.encode(&mask),
        })
        .collect();
    PropagateData {
        frame_index: frame.frame_index,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_defaults_to_both() {
        assert_eq!(Direction::parse(None).unwrap(), Direction::Both);
        assert_eq!(Direction::parse(Some("both")).unwrap(), Direction::Both);
    }

    #[test]
    fn direction_parses_single_sweeps() {
        assert_eq!(Direction::parse(Some("forward")).unwrap(), Direction::Forward);
        assert_eq!(
            Direction::parse(Some("backward")).unwrap(),
            Direction::Backward
        );
    }

    #[test]
    fn direction_rejects_unknown_values() {
        assert!(matches!(
            Direction::parse(Some("sideways")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn passes_order_forward_then_backward() {
        assert_eq!(Direction::Both.passes(), &[false, true]);
        assert_eq!(Direction::Forward.passes(), &[false]);
        assert_eq!(Direction::Backward.passes(), &[true]);
    }
}
