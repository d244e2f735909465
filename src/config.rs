use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::DetectionFilter;
use crate::engine::EngineConfig;
use crate::storage::RetryPolicy;
use crate::tracker::TrackerConfig;

const DEFAULT_DB_PATH: &str = "visitors.db";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_CONF_THRESHOLD: f32 = 0.4;
const DEFAULT_MIN_WIDTH: f32 = 30.0;
const DEFAULT_MIN_HEIGHT: f32 = 60.0;
const DEFAULT_EXIT_CHECK_INTERVAL_MS: u64 = 1000;
const DEFAULT_LINE_POSITION: f32 = 0.5;
const DEFAULT_EXPORT_PATH: &str = "visitors_export.json";
const DEFAULT_AUTO_SAVE_SECS: u64 = 300;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_SOURCE_PATH: &str = "detections.jsonl";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CounterConfigFile {
    db_path: Option<String>,
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    tracking: Option<TrackingConfigFile>,
    reid: Option<ReidConfigFile>,
    counting_line: Option<CountingLineConfigFile>,
    export: Option<ExportConfigFile>,
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    conf_threshold: Option<f32>,
    min_width: Option<f32>,
    min_height: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    max_disappeared: Option<u32>,
    max_distance: Option<f32>,
    exit_timeout_secs: Option<f64>,
    exit_check_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReidConfigFile {
    enabled: Option<bool>,
    similarity_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct CountingLineConfigFile {
    enabled: Option<bool>,
    position: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ExportConfigFile {
    enabled: Option<bool>,
    path: Option<PathBuf>,
    auto_save_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub db_path: String,
    pub camera: CameraSettings,
    pub detection: DetectionFilter,
    pub tracking: TrackingSettings,
    pub reid: ReidSettings,
    pub counting_line: CountingLineSettings,
    pub export: ExportSettings,
    pub api: ApiSettings,
    pub source_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub max_disappeared: u32,
    pub max_distance: f32,
    pub exit_timeout: Duration,
    pub exit_check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ReidSettings {
    pub enabled: bool,
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct CountingLineSettings {
    pub enabled: bool,
    pub position: f32,
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub auto_save_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub enabled: bool,
    pub addr: String,
}

impl Default for CounterConfig {
    fn default() -> Self {
        // An empty file section list resolves every field to its default.
        Self::from_file(CounterConfigFile::default())
    }
}

impl CounterConfig {
    /// File (`COUNTER_CONFIG`), then environment, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("COUNTER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CounterConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        let reid = file.reid.unwrap_or_default();
        let line = file.counting_line.unwrap_or_default();
        let export = file.export.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let tracker_defaults = TrackerConfig::default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            camera: CameraSettings {
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_CAMERA_FPS),
            },
            detection: DetectionFilter {
                conf_threshold: detection.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD),
                min_width: detection.min_width.unwrap_or(DEFAULT_MIN_WIDTH),
                min_height: detection.min_height.unwrap_or(DEFAULT_MIN_HEIGHT),
            },
            tracking: TrackingSettings {
                max_disappeared: tracking
                    .max_disappeared
                    .unwrap_or(tracker_defaults.max_disappeared),
                max_distance: tracking
                    .max_distance
                    .unwrap_or(tracker_defaults.max_distance),
                exit_timeout: tracking
                    .exit_timeout_secs
                    .map(secs_to_duration)
                    .unwrap_or(tracker_defaults.exit_timeout),
                exit_check_interval: Duration::from_millis(
                    tracking
                        .exit_check_interval_ms
                        .unwrap_or(DEFAULT_EXIT_CHECK_INTERVAL_MS),
                ),
            },
            reid: ReidSettings {
                enabled: reid.enabled.unwrap_or(true),
                similarity_threshold: reid
                    .similarity_threshold
                    .unwrap_or(crate::reid::DEFAULT_SIMILARITY_THRESHOLD),
            },
            counting_line: CountingLineSettings {
                enabled: line.enabled.unwrap_or(true),
                position: line.position.unwrap_or(DEFAULT_LINE_POSITION),
            },
            export: ExportSettings {
                enabled: export.enabled.unwrap_or(true),
                path: export
                    .path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_PATH)),
                auto_save_interval: Duration::from_secs(
                    export
                        .auto_save_interval_secs
                        .unwrap_or(DEFAULT_AUTO_SAVE_SECS),
                ),
            },
            api: ApiSettings {
                enabled: api.enabled.unwrap_or(true),
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            },
            source_path: file
                .source
                .and_then(|source| source.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_PATH)),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("COUNTER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(source) = std::env::var("COUNTER_SOURCE") {
            if !source.trim().is_empty() {
                self.source_path = PathBuf::from(source);
            }
        }
        if let Ok(addr) = std::env::var("COUNTER_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(path) = std::env::var("COUNTER_EXPORT_PATH") {
            if !path.trim().is_empty() {
                self.export.path = PathBuf::from(path);
            }
        }
        if let Ok(timeout) = std::env::var("COUNTER_EXIT_TIMEOUT_SECS") {
            let seconds: f64 = timeout.trim().parse().map_err(|_| {
                anyhow!("COUNTER_EXIT_TIMEOUT_SECS must be a number of seconds")
            })?;
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(anyhow!("COUNTER_EXIT_TIMEOUT_SECS must be a number of seconds"));
            }
            self.tracking.exit_timeout = secs_to_duration(seconds);
        }
        Ok(())
    }

    /// Re-run validation after command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.camera.fps == 0 {
            return Err(anyhow!("camera fps must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.counting_line.position) {
            return Err(anyhow!(
                "counting_line.position must be within [0, 1], got {}",
                self.counting_line.position
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.conf_threshold) {
            return Err(anyhow!(
                "detection.conf_threshold must be within [0, 1], got {}",
                self.detection.conf_threshold
            ));
        }
        if self.tracking.max_distance.is_nan() || self.tracking.max_distance <= 0.0 {
            return Err(anyhow!("tracking.max_distance must be greater than zero"));
        }
        if self.tracking.exit_timeout.is_zero() {
            return Err(anyhow!("tracking.exit_timeout_secs must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.reid.similarity_threshold) {
            return Err(anyhow!(
                "reid.similarity_threshold must be within [0, 1], got {}",
                self.reid.similarity_threshold
            ));
        }
        if self.export.enabled && self.export.auto_save_interval.is_zero() {
            return Err(anyhow!("export.auto_save_interval_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            filter: self.detection,
            tracker: TrackerConfig {
                max_disappeared: self.tracking.max_disappeared,
                max_distance: self.tracking.max_distance,
                exit_timeout: self.tracking.exit_timeout,
            },
            frame_width: self.camera.width,
            line_position: self.counting_line.position,
            counting_enabled: self.counting_line.enabled,
            exit_check_interval: self.tracking.exit_check_interval,
            reid_threshold: self.reid.similarity_threshold,
            retry: RetryPolicy::default(),
        }
    }
}

fn secs_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

fn read_config_file(path: &Path) -> Result<CounterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
