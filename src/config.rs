use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::service::ServiceOptions;
use crate::session::SessionOptions;
use crate::transport::{ReadPolicy, SerialSettings};

const DEFAULT_DEVICE: &str = "/dev/stm32_cam_1";
const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_READ_TIMEOUT_DS: u8 = 20;
const DEFAULT_DB_PATH: &str = "./camera.db";
const DEFAULT_CAMERA_ID: i64 = 1;
const DEFAULT_OUTPUT: &str = "../images/live/live.bmp";
const DEFAULT_IDLE_POLL_MS: u64 = 100;
const DEFAULT_OPEN_BACKOFF_MS: u64 = 1_000;
const DEFAULT_STOP_GRACE_MS: u64 = 50;
const DEFAULT_READ_RETRIES: u32 = 500;
const DEFAULT_RETRY_PAUSE_MS: u64 = 1;

#[derive(Debug, Deserialize, Default)]
struct LivePreviewConfigFile {
    serial: Option<SerialConfigFile>,
    control: Option<ControlConfigFile>,
    output: Option<OutputConfigFile>,
    timing: Option<TimingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SerialConfigFile {
    device: Option<String>,
    baud_rate: Option<u32>,
    read_timeout_ds: Option<u8>,
    read_retries: Option<u32>,
    retry_pause_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ControlConfigFile {
    db_path: Option<String>,
    camera_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct TimingConfigFile {
    idle_poll_ms: Option<u64>,
    open_backoff_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LivePreviewConfig {
    pub serial: SerialSettings,
    pub read_retries: u32,
    pub retry_pause: Duration,
    pub db_path: String,
    pub camera_id: i64,
    pub output_path: PathBuf,
    pub idle_poll: Duration,
    pub open_backoff: Duration,
    pub stop_grace: Duration,
    pub max_frames: Option<u64>,
}

impl LivePreviewConfig {
    /// Load from `LIVE_PREVIEW_CONFIG` (if set) plus environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVE_PREVIEW_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (if any) plus environment overrides.
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

    fn from_file(file: LivePreviewConfigFile) -> Self {
        let serial = file.serial.unwrap_or_default();
        let control = file.control.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let timing = file.timing.unwrap_or_default();
        Self {
            serial: SerialSettings {
                path: serial.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
                baud_rate: serial.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
                read_timeout_ds: serial.read_timeout_ds.unwrap_or(DEFAULT_READ_TIMEOUT_DS),
            },
            read_retries: serial.read_retries.unwrap_or(DEFAULT_READ_RETRIES),
            retry_pause: Duration::from_millis(
                serial.retry_pause_ms.unwrap_or(DEFAULT_RETRY_PAUSE_MS),
            ),
            db_path: control
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            camera_id: control.camera_id.unwrap_or(DEFAULT_CAMERA_ID),
            output_path: output
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            idle_poll: Duration::from_millis(timing.idle_poll_ms.unwrap_or(DEFAULT_IDLE_POLL_MS)),
            open_backoff: Duration::from_millis(
                timing.open_backoff_ms.unwrap_or(DEFAULT_OPEN_BACKOFF_MS),
            ),
            stop_grace: Duration::from_millis(
                timing.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS),
            ),
            max_frames: None,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("LIVE_PREVIEW_DEVICE") {
            if !device.trim().is_empty() {
                self.serial.path = device;
            }
        }
        if let Ok(db_path) = std::env::var("LIVE_PREVIEW_DB_PATH") {
            if !db_path.trim().is_empty() {
                self.db_path = db_path;
            }
        }
        if let Ok(camera_id) = std::env::var("LIVE_PREVIEW_CAMERA_ID") {
            self.camera_id = camera_id
                .trim()
                .parse()
                .map_err(|_| anyhow!("LIVE_PREVIEW_CAMERA_ID must be an integer"))?;
        }
        if let Ok(output) = std::env::var("LIVE_PREVIEW_OUTPUT") {
            if !output.trim().is_empty() {
                self.output_path = PathBuf::from(output);
            }
        }
        if let Ok(poll) = std::env::var("LIVE_PREVIEW_IDLE_POLL_MS") {
            let millis: u64 = poll.trim().parse().map_err(|_| {
                anyhow!("LIVE_PREVIEW_IDLE_POLL_MS must be an integer number of milliseconds")
            })?;
            self.idle_poll = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.serial.path.trim().is_empty() {
            return Err(anyhow!("serial device path must not be empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("baud rate must be greater than zero"));
        }
        if self.serial.read_timeout_ds == 0 {
            return Err(anyhow!("read timeout must be at least one decisecond"));
        }
        if self.read_retries == 0 {
            return Err(anyhow!("read retry budget must be greater than zero"));
        }
        if self.retry_pause.is_zero() {
            return Err(anyhow!("retry pause must be at least one millisecond"));
        }
        self.stall_limit()?;
        if self.idle_poll.is_zero() {
            return Err(anyhow!("idle poll interval must be greater than zero"));
        }
        if self.output_path.file_name().is_none() {
            return Err(anyhow!(
                "output path {} must name a file",
                self.output_path.display()
            ));
        }
        Ok(())
    }

    /// Retry budget for frame reads. A silent link is declared dead after one
    /// full port timeout plus the empty-read budget.
    pub fn read_policy(&self) -> Result<ReadPolicy> {
        Ok(ReadPolicy {
            max_empty_reads: self.read_retries,
            pause: self.retry_pause,
            stall_limit: self.stall_limit()?,
        })
    }

    fn stall_limit(&self) -> Result<Duration> {
        self.retry_pause
            .checked_mul(self.read_retries)
            .and_then(|budget| self.serial.read_timeout().checked_add(budget))
            .ok_or_else(|| {
                anyhow!(
                    "read retry budget overflows: {} retries x {:?} pause",
                    self.read_retries,
                    self.retry_pause
                )
            })
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            idle_poll: self.idle_poll,
            open_backoff: self.open_backoff,
            session: SessionOptions {
                stop_grace: self.stop_grace,
                max_frames: self.max_frames,
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<LivePreviewConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
