//! Core configuration and startup-time environment selection.
//!
//! The admission limits and reaper cadence live in [`Config`]. Device and
//! checkpoint selection are startup-time constants read once from the
//! environment:
//!
//! - `SAM2_DEMO_FORCE_CPU_DEVICE=1` forces the CPU device even when an
//!   accelerator is present.
//! - `MODEL_SIZE` ∈ {`tiny`, `small`, `base_plus`, `large`} selects the
//!   checkpoint (default `base_plus`).

use std::path::PathBuf;
use std::time::Duration;

/// Default cap on concurrently admitted sessions.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 5;

/// Default idle timeout before a session is reclaimed.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default reaper scan period.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Initial (and post-restart) estimate of admission-to-ready time, seconds.
pub const DEFAULT_AVG_PROCESSING_TIME: f64 = 60.0;

/// Default location of the persisted queue image.
pub const DEFAULT_QUEUE_PATH: &str = "./data/queue/queue_data.json";

/// Tunables for admission, reaping, and queue persistence.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on sessions in `processing` state at once.
    pub max_concurrent_sessions: usize,
    /// A session idle longer than this is reclaimed by the reaper.
    pub session_timeout: Duration,
    /// How often the reaper scans for idle sessions.
    pub cleanup_interval: Duration,
    /// Seed for the smoothed admission-to-ready estimate, in seconds.
    pub initial_avg_processing_time: f64,
    /// Path of the JSON file holding the pending queue.
    pub queue_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            initial_avg_processing_time: DEFAULT_AVG_PROCESSING_TIME,
            queue_path: PathBuf::from(DEFAULT_QUEUE_PATH),
        }
    }
}

/// Compute device the model backend runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Primary accelerator.
    Cuda,
    /// Secondary accelerator (Apple Metal).
    Mps,
    /// Host CPU fallback.
    Cpu,
}

impl Device {
    /// Whether this device has an accelerator cache worth flushing.
    pub fn is_accelerator(self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cuda => write!(f, "cuda"),
            Device::Mps => write!(f, "mps"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

/// Select the compute device from availability flags and the environment.
///
/// Order: primary accelerator if available, then the secondary one, then
/// CPU. `SAM2_DEMO_FORCE_CPU_DEVICE=1` short-circuits to CPU.
pub fn select_device(cuda_available: bool, mps_available: bool) -> Device {
    let force_cpu =
        std::env::var("SAM2_DEMO_FORCE_CPU_DEVICE").is_ok_and(|v| v == "1");
    let device = pick_device(cuda_available, mps_available, force_cpu);
    if force_cpu {
        tracing::info!("forcing CPU device");
    }
    tracing::info!(%device, "using device");
    device
}

fn pick_device(cuda_available: bool, mps_available: bool, force_cpu: bool) -> Device {
    if force_cpu {
        Device::Cpu
    } else if cuda_available {
        Device::Cuda
    } else if mps_available {
        Device::Mps
    } else {
        Device::Cpu
    }
}

/// Model checkpoint size, selected once at startup via `MODEL_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSize {
    Tiny,
    Small,
    BasePlus,
    Large,
}

impl ModelSize {
    /// Parse from the `MODEL_SIZE` environment variable, defaulting to
    /// [`BasePlus`](Self::BasePlus) for unset or unrecognised values.
    pub fn from_env() -> Self {
        match std::env::var("MODEL_SIZE").as_deref() {
            Ok("tiny") => ModelSize::Tiny,
            Ok("small") => ModelSize::Small,
            Ok("large") => ModelSize::Large,
            _ => ModelSize::BasePlus,
        }
    }

    /// Relative checkpoint path for this size.
    pub fn checkpoint_path(self) -> &'static str {
        match self {
            ModelSize::Tiny => "checkpoints/sam2.1_hiera_tiny.pt",
            ModelSize::Small => "checkpoints/sam2.1_hiera_small.pt",
            ModelSize::BasePlus => "checkpoints/sam2.1_hiera_base_plus.pt",
            ModelSize::Large => "checkpoints/sam2.1_hiera_large.pt",
        }
    }

    /// Relative model-config path for this size.
    pub fn model_config(self) -> &'static str {
        match self {
            ModelSize::Tiny => "configs/sam2.1/sam2.1_hiera_t.yaml",
            ModelSize::Small => "configs/sam2.1/sam2.1_hiera_s.yaml",
            ModelSize::BasePlus => "configs/sam2.1/sam2.1_hiera_b+.yaml",
            ModelSize::Large => "configs/sam2.1/sam2.1_hiera_l.yaml",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_order_prefers_cuda() {
        assert_eq!(pick_device(true, true, false), Device::Cuda);
        assert_eq!(pick_device(true, false, false), Device::Cuda);
    }

    #[test]
    fn device_falls_back_to_mps_then_cpu() {
        assert_eq!(pick_device(false, true, false), Device::Mps);
        assert_eq!(pick_device(false, false, false), Device::Cpu);
    }

    #[test]
    fn forced_cpu_wins_over_accelerators() {
        assert_eq!(pick_device(true, true, true), Device::Cpu);
    }

    #[test]
    fn checkpoint_paths_match_sizes() {
        assert_eq!(
            ModelSize::Tiny.checkpoint_path(),
            "checkpoints/sam2.1_hiera_tiny.pt"
        );
        assert_eq!(
            ModelSize::BasePlus.model_config(),
            "configs/sam2.1/sam2.1_hiera_b+.yaml"
        );
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_sessions, 5);
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.initial_avg_processing_time, 60.0);
    }
}
