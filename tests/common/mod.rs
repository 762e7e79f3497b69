//! Shared test support: a scripted in-memory model backend.
#![allow(dead_code)]

use std::any::Any;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use seginfer::backend::{FrameMasks, InferenceState, ModelBackend};
use seginfer::codec::BitMask;
use seginfer::config::Device;
use seginfer::error::{Error, Result};
use seginfer::types::StartSessionRequest;
use seginfer::{Config, SessionApi};

/// Counters and switches shared between a test and its backend.
#[derive(Default)]
pub struct Shared {
    /// Paths passed to `init_state`, in call order.
    pub init_order: Mutex<Vec<String>>,
    /// Video paths whose `init_state` must fail.
    pub fail_init_paths: Mutex<BTreeSet<String>>,
    /// When set, every edit operation fails.
    pub fail_ops: AtomicBool,
    /// Artificial `init_state` latency, for holding sessions in the queue.
    pub init_delay: Mutex<Duration>,
    pub flushes: AtomicUsize,
    pub collects: AtomicUsize,
    /// Live `FakeState` handles; tracks model-state release.
    pub live_states: AtomicIsize,
}

pub struct FakeState {
    shared: Arc<Shared>,
    num_frames: u32,
    objects: Vec<i64>,
    pass: Option<Pass>,
}

struct Pass {
    next: i64,
    reverse: bool,
}

impl Drop for FakeState {
    fn drop(&mut self) {
        self.shared.live_states.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceState for FakeState {
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send) {
        self
    }

    fn num_frames(&self) -> usize {
        self.num_frames as usize
    }

    fn object_ids(&self) -> Vec<i64> {
        self.objects.clone()
    }
}

pub struct FakeBackend {
    shared: Arc<Shared>,
    device: Device,
    num_frames: u32,
}

impl FakeBackend {
    pub fn new(num_frames: u32) -> (Self, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        (
            FakeBackend {
                shared: shared.clone(),
                device: Device::Cpu,
                num_frames,
            },
            shared,
        )
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    fn check_ops(&self) -> Result<()> {
        if self.shared.fail_ops.load(Ordering::SeqCst) {
            Err(Error::Backend("scripted edit failure".into()))
        } else {
            Ok(())
        }
    }

    /// One tiny mask per tracked object on the given frame.
    fn frame_masks(state: &FakeState, frame_index: u32) -> FrameMasks {
        let masks = state
            .objects
            .iter()
            .map(|&object_id| {
                let mut mask = BitMask::zeros(4, 4);
                mask.set(frame_index % 4, (object_id.unsigned_abs() as u32) % 4, 1);
                (object_id, mask)
            })
            .collect();
        FrameMasks { frame_index, masks }
    }
}

fn downcast(state: &mut dyn InferenceState) -> &mut FakeState {
    state
        .as_any_mut()
        .downcast_mut::<FakeState>()
        .expect("state built by FakeBackend")
}

impl ModelBackend for FakeBackend {
    fn init_state(
        &mut self,
        video_path: &str,
        _offload_frames: bool,
    ) -> Result<Box<dyn InferenceState>> {
        let delay = *self.shared.init_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.shared.init_order.lock().push(video_path.to_string());
        if self.shared.fail_init_paths.lock().contains(video_path) {
            return Err(Error::Backend(format!("cannot load {video_path}")));
        }
        self.shared.live_states.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeState {
            shared: self.shared.clone(),
            num_frames: self.num_frames,
            objects: Vec::new(),
            pass: None,
        }))
    }

    fn add_prompts(
        &mut self,
        state: &mut dyn InferenceState,
        frame_index: u32,
        object_id: i64,
        _points: &[[f32; 2]],
        _labels: &[u32],
        _clear_old_points: bool,
    ) -> Result<FrameMasks> {
        self.check_ops()?;
        let state = downcast(state);
        if !state.objects.contains(&object_id) {
            state.objects.push(object_id);
        }
        Ok(Self::frame_masks(state, frame_index))
    }

    fn add_mask(
        &mut self,
        state: &mut dyn InferenceState,
        frame_index: u32,
        object_id: i64,
        _mask: &BitMask,
    ) -> Result<FrameMasks> {
        self.check_ops()?;
        let state = downcast(state);
        if !state.objects.contains(&object_id) {
            state.objects.push(object_id);
        }
        Ok(Self::frame_masks(state, frame_index))
    }

    fn clear_frame(
        &mut self,
        state: &mut dyn InferenceState,
        frame_index: u32,
        _object_id: i64,
    ) -> Result<FrameMasks> {
        self.check_ops()?;
        let state = downcast(state);
        Ok(Self::frame_masks(state, frame_index))
    }

    fn reset_prompts(&mut self, state: &mut dyn InferenceState) -> Result<()> {
        self.check_ops()?;
        downcast(state).objects.clear();
        Ok(())
    }

    fn remove_object(
        &mut self,
        state: &mut dyn InferenceState,
        object_id: i64,
    ) -> Result<Vec<FrameMasks>> {
        self.check_ops()?;
        let state = downcast(state);
        state.objects.retain(|&id| id != object_id);
        // Updated results for the first three frames the object had touched.
        Ok((0..3.min(state.num_frames))
            .map(|frame| Self::frame_masks(state, frame))
            .collect())
    }

    fn begin_pass(
        &mut self,
        state: &mut dyn InferenceState,
        start_frame_index: u32,
        reverse: bool,
    ) -> Result<()> {
        let state = downcast(state);
        state.pass = Some(Pass {
            next: start_frame_index as i64,
            reverse,
        });
        Ok(())
    }

    fn next_masks(&mut self, state: &mut dyn InferenceState) -> Result<Option<FrameMasks>> {
        let state = downcast(state);
        let Some(pass) = state.pass.as_mut() else {
            return Ok(None);
        };
        let exhausted = if pass.reverse {
            pass.next < 0
        } else {
            pass.next >= state.num_frames as i64
        };
        if exhausted {
            state.pass = None;
            return Ok(None);
        }
        let frame = pass.next as u32;
        pass.next += if pass.reverse { -1 } else { 1 };
        Ok(Some(Self::frame_masks(state, frame)))
    }

    fn flush_cache(&mut self) {
        self.shared.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn collect_garbage(&mut self) {
        self.shared.collects.fetch_add(1, Ordering::SeqCst);
    }

    fn device(&self) -> Device {
        self.device
    }
}

/// Install a subscriber once so `tracing` output shows up in test logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Build an API over a fake backend, persisting its queue under `dir`.
pub fn build_api(dir: &Path, max_concurrent: usize, num_frames: u32) -> (SessionApi, Arc<Shared>) {
    let config = Config {
        max_concurrent_sessions: max_concurrent,
        queue_path: dir.join("queue_data.json"),
        ..Config::default()
    };
    build_api_with(config, num_frames)
}

pub fn build_api_with(config: Config, num_frames: u32) -> (SessionApi, Arc<Shared>) {
    init_tracing();
    let (backend, shared) = FakeBackend::new(num_frames);
    let api = SessionApi::new(Box::new(backend), config).expect("construct api");
    (api, shared)
}

pub fn start_request(id: &str) -> StartSessionRequest {
    StartSessionRequest {
        session_id: Some(id.to_string()),
        path: format!("/videos/{id}.mp4"),
        video_metadata: None,
        keep_frames_on_gpu: false,
    }
}

/// Poll until `cond` holds or the timeout elapses; returns the final check.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Wait until a session's model state is initialised and ready for edits.
///
/// Probes with `clear_points_in_video`, which is a no-op on a session that
/// has no prompts yet and fails with `SessionExpired` until init completes.
pub fn wait_ready(api: &SessionApi, id: &str) -> bool {
    wait_until(Duration::from_secs(2), || {
        api.clear_points_in_video(seginfer::types::ClearPointsInVideoRequest {
            session_id: id.to_string(),
        })
        .is_ok()
    })
}
