pub mod bus;
pub mod capture;
pub mod display;
pub mod error;
pub mod session;
pub mod tracking;

use std::path::PathBuf;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use bus::{Delivery, Event, EventBus, EventName};
pub use error::ConfigError;
pub use session::{Command, SessionController, SessionState};
pub use tracking::TrackerBroker;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub tracking: TrackingConfig,
    pub session: SessionConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Video loaded at startup
    pub path: Option<PathBuf>,
    pub idle_poll_ms: u64,
    /// Decoded frames waiting for the control thread
    pub frame_queue: usize,
    /// Length of the generated demo clip, 0 to disable it
    pub synthetic_frames: u64,
    pub synthetic_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub listen_address: String,
    pub handshake_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub init_ack_timeout_ms: u64,
    pub max_parallel_dispatch: usize,
    /// Frames of results each tracker keeps
    pub result_window: usize,
    pub max_trackers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            idle_poll_ms: 10,
            frame_queue: 4,
            synthetic_frames: 0,
            synthetic_fps: 10.0,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".into(),
            handshake_timeout_ms: 5000,
            reply_timeout_ms: 5000,
            init_ack_timeout_ms: 5000,
            max_parallel_dispatch: 16,
            result_window: 100_000,
            max_trackers: 10,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 50,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

impl Config {
    /// Defaults, then `$ARTEMIS_CONFIG` (or `artemis.toml` if present), then
    /// `ARTEMIS__SECTION__KEY` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("ARTEMIS_CONFIG").unwrap_or_else(|_| "artemis".into());

        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("ARTEMIS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// Performance figures of a tracking session
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub real_fps: f64,
    pub frames_tracked: u64,
    pub dispatch_failures: u64,
    pub avg_dispatch_ms: f64,
    pub connected_trackers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                "[tracking]\nmax_trackers = 3\n[session]\ntick_interval_ms = 20\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.tracking.max_trackers, 3);
        assert_eq!(config.tracking.listen_address, "127.0.0.1:8080");
        assert_eq!(config.session.tick_interval_ms, 20);
        assert_eq!(config.source.frame_queue, 4);
        assert_eq!((config.display.width, config.display.height), (1280, 720));
    }

    #[test]
    fn defaults_survive_a_round_trip_through_the_loader() {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).unwrap())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.tracking.result_window, 100_000);
        assert!(config.source.path.is_none());
        assert_eq!(config.source.synthetic_fps, 10.0);
    }
}
