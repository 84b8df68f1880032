use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 64;
pub const DEFAULT_EVENT_HISTORY_CAPACITY: usize = 16;

/// How channel numbers passed to the controller are interpreted.
#[derive(Debug, Default, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NamingMode {
    /// Physical header position, translated through the pin mapping.
    #[default]
    Logical,
    /// Kernel GPIO number, used verbatim.
    Hardware,
}

impl NamingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamingMode::Logical => "logical",
            NamingMode::Hardware => "hardware",
        }
    }
}

impl FromStr for NamingMode {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logical" | "board" | "mode_rpi" => Ok(NamingMode::Logical),
            "hardware" | "bcm" | "mode_bcm" => Ok(NamingMode::Hardware),
            other => Err(GpioError::InvalidArgument(format!(
                "unknown naming mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for NamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    /// Text the kernel expects in the `direction` file.
    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "input" => Ok(Direction::Input),
            "out" | "output" => Ok(Direction::Output),
            other => Err(GpioError::InvalidArgument(format!(
                "unknown direction '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sysfs())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ControllerConfig {
    pub sysfs_root: PathBuf,
    pub naming_mode: NamingMode,
    pub poll_interval_ms: u64,
    /// Change events buffered per subscriber. A subscriber further behind
    /// than this loses the oldest events (logged as a lag); the retained
    /// history is unaffected.
    pub broadcast_capacity: usize,
    pub event_history_capacity: usize,
    /// Header position to kernel GPIO number. `None` uses the built-in
    /// 40-pin table; a `null` entry marks a power or ground position.
    pub pin_mapping: Option<FxHashMap<u32, Option<u32>>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            naming_mode: NamingMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            event_history_capacity: DEFAULT_EVENT_HISTORY_CAPACITY,
            pin_mapping: None,
        }
    }
}

impl ControllerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, GpioError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.poll_interval_ms == 0 {
            return Err(GpioError::Config("poll_interval_ms must be positive".into()));
        }
        if self.broadcast_capacity == 0 {
            return Err(GpioError::Config(
                "broadcast_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
