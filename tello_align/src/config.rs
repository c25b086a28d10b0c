// THEORY:
// All tunable numbers live here, in one immutable `Settings` value that is
// loaded from YAML and validated once. Nothing downstream re-checks these
// invariants: a driver built from a validated `AlignmentConfig` can assume
// `distance_min < distance_max` and friends for the whole flight.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a flight session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub link: LinkConfig,
    pub alignment: AlignmentConfig,
    pub marker: MarkerConfig,
    pub video: VideoConfig,
    /// Relative moves flown between takeoff and alignment, one command per entry
    /// (for example `"forward 100"` or `"cw 90"`).
    pub script: Vec<String>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link.validate()?;
        self.alignment.validate()?;
        self.marker.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Command address of the vehicle.
    pub drone_addr: SocketAddr,
    /// Local UDP port replies are sent back to.
    pub local_port: u16,
    pub response_timeout_ms: u64,
    /// Interval of the `command` keep-alive; the vehicle leaves SDK mode after
    /// roughly 15 s of silence.
    pub keep_alive_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            drone_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 10, 1), 8889)),
            local_port: 8889,
            response_timeout_ms: 7000,
            keep_alive_secs: 5,
        }
    }
}

impl LinkConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.response_timeout_ms == 0 {
            return invalid("link.response_timeout_ms must be positive");
        }
        if self.keep_alive_secs == 0 {
            return invalid("link.keep_alive_secs must be positive");
        }
        Ok(())
    }
}

/// Thresholds and speeds of the alignment state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Seconds Seek may spend without seeing the marker before giving up.
    pub timeout_secs: f64,
    /// Consecutive frames without a marker that are tolerated before the
    /// machine falls back to Seek.
    pub missed_frame_limit: u32,
    /// Pixel radius around the image centre that counts as centered.
    pub centered_radius: f64,
    /// Exclusive band for the estimated distance to the marker.
    pub distance_min: f64,
    pub distance_max: f64,
    /// Exclusive band for the left/right edge ratio of the marker.
    pub ratio_min: f64,
    pub ratio_max: f64,
    /// Yaw rate commanded while searching.
    pub search_yaw: i32,
    pub center_speed: i32,
    pub approach_speed: i32,
    pub strafe_speed: i32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10.0,
            missed_frame_limit: 10,
            centered_radius: 50.0,
            distance_min: 0.8,
            distance_max: 1.0,
            ratio_min: 0.95,
            ratio_max: 1.05,
            search_yaw: 40,
            center_speed: 10,
            approach_speed: 10,
            strafe_speed: 20,
        }
    }
}

impl AlignmentConfig {
    /// The Seek timeout. Saturates for values `validate` rejects.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match Duration::try_from_secs_f64(self.timeout_secs) {
            Ok(timeout) if !timeout.is_zero() => {}
            _ => return invalid("alignment.timeout_secs must be a positive number of seconds"),
        }
        if !(self.centered_radius.is_finite() && self.centered_radius > 0.0) {
            return invalid("alignment.centered_radius must be positive");
        }
        if !(self.distance_min > 0.0 && self.distance_min < self.distance_max) {
            return invalid(format!(
                "alignment distance band ({}, {}) is empty or non-positive",
                self.distance_min, self.distance_max
            ));
        }
        if !(self.ratio_min > 0.0 && self.ratio_min < self.ratio_max) {
            return invalid(format!(
                "alignment ratio band ({}, {}) is empty or non-positive",
                self.ratio_min, self.ratio_max
            ));
        }
        // A negative search yaw turns the search counter-clockwise.
        if !(1..=100).contains(&self.search_yaw.abs()) {
            return invalid("alignment.search_yaw must be within 1..=100 in magnitude");
        }
        for (name, speed) in [
            ("center_speed", self.center_speed),
            ("approach_speed", self.approach_speed),
            ("strafe_speed", self.strafe_speed),
        ] {
            if !(1..=100).contains(&speed) {
                return invalid(format!("alignment.{name} must be within 1..=100"));
            }
        }
        Ok(())
    }
}

/// Inclusive HSV box in OpenCV scale: hue 0..=180, saturation and value 0..=255.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HsvRange {
    pub low: [u8; 3],
    pub high: [u8; 3],
}

impl HsvRange {
    pub const fn new(low: [u8; 3], high: [u8; 3]) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|i| self.low[i] <= hsv[i] && hsv[i] <= self.high[i])
    }

    fn is_empty(&self) -> bool {
        (0..3).any(|i| self.low[i] > self.high[i])
    }
}

/// Appearance of the nested-square marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub outer: HsvRange,
    pub inner: HsvRange,
    /// Smallest blob, in pixels, accepted as a marker square.
    pub min_area: u32,
    /// Camera constant: distance = factor / mean vertical edge length in pixels.
    pub distance_factor: f64,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            // fuchsia
            outer: HsvRange::new([118, 129, 37], [177, 255, 255]),
            // blue
            inner: HsvRange::new([106, 94, 44], [138, 255, 255]),
            min_area: 400,
            distance_factor: 88.7,
        }
    }
}

impl MarkerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.outer.is_empty() || self.inner.is_empty() {
            return invalid("marker colour ranges must have low <= high in every channel");
        }
        if self.min_area == 0 {
            return invalid("marker.min_area must be positive");
        }
        if !(self.distance_factor.is_finite() && self.distance_factor > 0.0) {
            return invalid("marker.distance_factor must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Directory of still frames replayed as the camera feed.
    pub frames_dir: Option<PathBuf>,
    pub frame_interval_ms: u64,
    pub looping: bool,
    /// Capacity of the broadcast bus feeding external viewers.
    pub display_capacity: usize,
    /// PNG file the display rewrites with every frame it presents.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            frames_dir: None,
            frame_interval_ms: 33,
            looping: true,
            display_capacity: 2,
            snapshot_path: None,
        }
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}
