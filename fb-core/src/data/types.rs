//! Core data types for Fanbind
//!
//! Snapshot types produced by the enumerator and the mapping types that flow
//! from detection into the control loop. Snapshots are rebuilt on every scan
//! and never patched in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::{pwm, temperature};
use crate::hw::{Actuator, HardwareFingerprint};

/// Milliseconds since the Unix epoch
pub(crate) fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Temperature in thousandths of a degree Celsius, as exposed by hwmon
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Millidegrees(pub i32);

impl Millidegrees {
    pub fn celsius(self) -> f32 {
        self.0 as f32 / temperature::MILLIDEGREE_DIVISOR
    }

    pub fn from_celsius(celsius: f32) -> Self {
        Self((celsius * temperature::MILLIDEGREE_DIVISOR).round() as i32)
    }

    /// Whether the reading is inside the range a working sensor reports
    pub fn is_plausible(self) -> bool {
        let c = self.celsius();
        (temperature::MIN_PLAUSIBLE..=temperature::MAX_PLAUSIBLE).contains(&c)
    }
}

impl fmt::Display for Millidegrees {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°C", self.celsius())
    }
}

/// Value of a `pwmN_enable` node
///
/// Drivers disagree on what values above 2 mean, so the raw value of any
/// automatic mode is kept for restoration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnableMode {
    Disabled,
    Manual,
    Automatic(u8),
}

impl EnableMode {
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            v if v == pwm::enable::DISABLED as i64 => Some(Self::Disabled),
            v if v == pwm::enable::MANUAL as i64 => Some(Self::Manual),
            v if (pwm::enable::AUTOMATIC as i64..=u8::MAX as i64).contains(&v) => {
                Some(Self::Automatic(v as u8))
            }
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Disabled => pwm::enable::DISABLED,
            Self::Manual => pwm::enable::MANUAL,
            Self::Automatic(raw) => raw,
        }
    }
}

/// Which kind of hwmon channel a fingerprint refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Temp,
    Fan,
    Pwm,
}

impl ChannelKind {
    /// sysfs file prefix for this kind (`temp`, `fan`, `pwm`)
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Temp => "temp",
            Self::Fan => "fan",
            Self::Pwm => "pwm",
        }
    }
}

/// Hardware monitoring chip with its channels
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Chip {
    pub name: String,
    pub path: PathBuf,
    pub temperatures: Vec<TemperatureChannel>,
    pub fans: Vec<FanChannel>,
    pub pwms: Vec<PwmChannel>,
}

/// Temperature input channel
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TemperatureChannel {
    pub name: String,
    pub index: u32,
    pub input_path: PathBuf,
    pub label: Option<String>,
    pub value: Millidegrees,
    pub read_at_ms: u64,
}

/// Fan tachometer channel
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FanChannel {
    pub name: String,
    pub index: u32,
    pub input_path: PathBuf,
    pub label: Option<String>,
    /// 0 means stalled
    pub rpm: u32,
}

/// PWM output channel
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PwmChannel {
    pub name: String,
    pub index: u32,
    pub label: Option<String>,
    pub duty: u8,
    pub enable: Option<EnableMode>,
    pub actuator: Actuator,
}

impl PwmChannel {
    pub fn pwm_path(&self) -> &Path {
        self.actuator.pwm_path()
    }
}

/// One enumeration pass over the hwmon tree
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct HardwareSnapshot {
    pub chips: Vec<Chip>,
    pub taken_at_ms: u64,
}

/// A point on a fan curve
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub temperature: f32,
    pub duty_percent: f32,
}

impl CurvePoint {
    pub const fn new(temperature: f32, duty_percent: f32) -> Self {
        Self {
            temperature,
            duty_percent,
        }
    }
}

/// Where a mapping candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    /// Measured by driving the PWM and watching tachometers
    Probe,
    /// Guessed from channel indices and labels
    Heuristic,
}

/// Pairing of one PWM output to one fan tachometer
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FanMapping {
    pub pwm: HardwareFingerprint,
    pub fan: HardwareFingerprint,
    pub confidence: f32,
    pub response_latency_ms: Option<u32>,
    /// Lowest probed duty at which the fan still turned
    pub min_duty: Option<u8>,
    pub max_rpm: u32,
    pub rpm_delta: u32,
    pub baseline_variance: f32,
    #[serde(default)]
    pub temp_sources: Vec<HardwareFingerprint>,
    pub source: MappingSource,
}
