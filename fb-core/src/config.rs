//! Engine configuration
//!
//! JSON file, every section optional. Missing fields take the defaults from
//! [`crate::constants`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::constants::{confidence, paths, probe, timing};
use crate::data::validate_file_size;
use crate::error::{FanbindError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the hwmon class tree
    pub hwmon_root: PathBuf,
    /// Upper bound for any single sysfs read or write
    pub io_timeout_ms: u64,
    /// Upper bound for one enumeration of the hwmon tree
    pub enumerate_timeout_ms: u64,
    pub control: ControlConfig,
    pub probe: ProbeConfig,
    pub scorer: ScorerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub period_ms: u64,
    /// Attempts per sensor read before the channel falls back
    pub read_retry_budget: u32,
    /// Lifetime of a manual PWM override when the caller gives none
    pub override_ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Duty sequence driven on each PWM (low, mid, high, low)
    pub levels: Vec<u8>,
    /// Subset replayed to confirm the response is repeatable
    pub validation_levels: Vec<u8>,
    /// Duty every PWM rests at while another one is probed
    pub park_duty: u8,
    pub hold_ms: u64,
    pub settle_ms: u64,
    pub sample_interval_ms: u64,
    pub baseline_samples: usize,
    pub min_rpm_delta: u32,
    pub noise_factor: f32,
    /// RPM at or below which a fan counts as stopped
    pub stall_rpm: u32,
    pub read_retry_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub repeatability_weight: f32,
    pub magnitude_weight: f32,
    pub monotonicity_weight: f32,
    pub snr_saturation: f32,
    pub delta_saturation_rpm: f32,
    pub noise_floor_rpm: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hwmon_root: PathBuf::from(paths::HWMON_BASE),
            io_timeout_ms: timing::IO_TIMEOUT.as_millis() as u64,
            enumerate_timeout_ms: timing::ENUMERATE_TIMEOUT.as_millis() as u64,
            control: ControlConfig::default(),
            probe: ProbeConfig::default(),
            scorer: ScorerConfig::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period_ms: timing::CONTROL_PERIOD.as_millis() as u64,
            read_retry_budget: probe::READ_RETRY_BUDGET,
            override_ttl_ms: timing::OVERRIDE_TTL.as_millis() as u64,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            levels: probe::LEVELS.to_vec(),
            validation_levels: probe::VALIDATION_LEVELS.to_vec(),
            park_duty: probe::PARK_DUTY,
            hold_ms: timing::PROBE_HOLD.as_millis() as u64,
            settle_ms: timing::PROBE_SETTLE.as_millis() as u64,
            sample_interval_ms: timing::PROBE_SAMPLE_INTERVAL.as_millis() as u64,
            baseline_samples: probe::BASELINE_SAMPLES,
            min_rpm_delta: probe::MIN_RPM_DELTA,
            noise_factor: probe::NOISE_FACTOR,
            stall_rpm: probe::STALL_RPM,
            read_retry_budget: probe::READ_RETRY_BUDGET,
        }
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            repeatability_weight: confidence::REPEATABILITY_WEIGHT,
            magnitude_weight: confidence::MAGNITUDE_WEIGHT,
            monotonicity_weight: confidence::MONOTONICITY_WEIGHT,
            snr_saturation: confidence::SNR_SATURATION,
            delta_saturation_rpm: confidence::DELTA_SATURATION_RPM,
            noise_floor_rpm: confidence::NOISE_FLOOR_RPM,
        }
    }
}

impl EngineConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        validate_file_size(path)?;
        let content = fs::read_to_string(path).map_err(|source| FanbindError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        debug!(path = ?path, "Loaded engine config");
        Ok(config)
    }

    /// Load the config if the file exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn enumerate_timeout(&self) -> Duration {
        Duration::from_millis(self.enumerate_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_timeout_ms == 0 {
            return Err(FanbindError::config("io_timeout_ms", "must be greater than zero"));
        }
        if self.enumerate_timeout_ms == 0 {
            return Err(FanbindError::config(
                "enumerate_timeout_ms",
                "must be greater than zero",
            ));
        }
        self.control.validate()?;
        self.probe.validate()?;
        if self.io_timeout_ms >= self.probe.hold_ms {
            return Err(FanbindError::config(
                "io_timeout_ms",
                "must be shorter than probe.hold_ms",
            ));
        }
        self.scorer.validate()
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn override_ttl(&self) -> Duration {
        Duration::from_millis(self.override_ttl_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.period_ms == 0 {
            return Err(FanbindError::config("control.period_ms", "must be greater than zero"));
        }
        if self.read_retry_budget == 0 {
            return Err(FanbindError::config(
                "control.read_retry_budget",
                "must allow at least one attempt",
            ));
        }
        if Duration::from_millis(self.override_ttl_ms) < timing::MIN_OVERRIDE_TTL {
            return Err(FanbindError::config(
                "control.override_ttl_ms",
                format!("must be at least {:?}", timing::MIN_OVERRIDE_TTL),
            ));
        }
        Ok(())
    }
}

impl ProbeConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(FanbindError::config("probe.levels", "must not be empty"));
        }
        if self.validation_levels.iter().any(|l| !self.levels.contains(l)) {
            return Err(FanbindError::config(
                "probe.validation_levels",
                "every validation level must also be a probe level",
            ));
        }
        if self.hold_ms == 0 || self.sample_interval_ms == 0 {
            return Err(FanbindError::config(
                "probe.hold_ms",
                "hold and sample interval must be greater than zero",
            ));
        }
        if self.sample_interval_ms > self.hold_ms {
            return Err(FanbindError::config(
                "probe.sample_interval_ms",
                "must not exceed probe.hold_ms",
            ));
        }
        if self.baseline_samples == 0 {
            return Err(FanbindError::config("probe.baseline_samples", "must be at least 1"));
        }
        if !self.noise_factor.is_finite() || self.noise_factor < 0.0 {
            return Err(FanbindError::config("probe.noise_factor", "must be a non-negative number"));
        }
        if self.read_retry_budget == 0 {
            return Err(FanbindError::config(
                "probe.read_retry_budget",
                "must allow at least one attempt",
            ));
        }
        Ok(())
    }
}

impl ScorerConfig {
    fn validate(&self) -> Result<()> {
        let weights = [
            ("scorer.repeatability_weight", self.repeatability_weight),
            ("scorer.magnitude_weight", self.magnitude_weight),
            ("scorer.monotonicity_weight", self.monotonicity_weight),
        ];
        for (field, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(FanbindError::config(field, "weights must be non-negative"));
            }
        }
        if weights.iter().map(|(_, w)| w).sum::<f32>() <= 0.0 {
            return Err(FanbindError::config("scorer", "at least one weight must be positive"));
        }
        for (field, value) in [
            ("scorer.snr_saturation", self.snr_saturation),
            ("scorer.delta_saturation_rpm", self.delta_saturation_rpm),
            ("scorer.noise_floor_rpm", self.noise_floor_rpm),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(FanbindError::config(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}
