//! PWM actuators
//!
//! A closed set of actuator variants chosen once, at enumeration time, from
//! the chip model. Every variant exposes the same capability: read and write
//! the duty, read and write the enable mode, and describe its limits.
//!
//! GPU drivers (amdgpu, radeon, nouveau) publish their own duty window via
//! `pwmN_min`/`pwmN_max`; commands are clamped into that window before they
//! reach the hardware.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::pwm;
use crate::data::{validate_pwm_value, EnableMode};
use crate::error::{FanbindError, Result};
use crate::hw::io::SensorIo;

/// Chip models whose PWM outputs are driven as GPU actuators
const GPU_CHIP_MODELS: &[&str] = &["amdgpu", "radeon", "nouveau"];

/// Generic hwmon PWM output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwmonPwm {
    pub pwm_path: PathBuf,
    pub enable_path: Option<PathBuf>,
}

/// GPU fan PWM output with a driver-defined duty window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuPwm {
    pub pwm_path: PathBuf,
    pub enable_path: Option<PathBuf>,
    pub min_duty: u8,
    pub max_duty: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Actuator {
    Hwmon(HwmonPwm),
    Gpu(GpuPwm),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorKind {
    GenericPwm,
    GpuPwm,
}

/// What an actuator can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorCapabilities {
    pub kind: ActuatorKind,
    /// Whether the output has a `pwmN_enable` mode switch
    pub has_enable: bool,
    pub min_duty: u8,
    pub max_duty: u8,
}

impl Actuator {
    /// Select the actuator variant for a PWM output of the given chip
    pub fn for_chip(chip_model: &str, chip_path: &Path, pwm_name: &str) -> Self {
        let pwm_path = chip_path.join(pwm_name);
        let enable_path = chip_path.join(format!("{}_enable", pwm_name));
        let enable_path = enable_path.exists().then_some(enable_path);

        if GPU_CHIP_MODELS.contains(&chip_model) {
            let min_duty = read_limit(&chip_path.join(format!("{}_min", pwm_name)))
                .unwrap_or(pwm::MIN_VALUE);
            let max_duty = read_limit(&chip_path.join(format!("{}_max", pwm_name)))
                .unwrap_or(pwm::MAX_VALUE);
            let (min_duty, max_duty) = if min_duty <= max_duty {
                (min_duty, max_duty)
            } else {
                (pwm::MIN_VALUE, pwm::MAX_VALUE)
            };
            Self::Gpu(GpuPwm {
                pwm_path,
                enable_path,
                min_duty,
                max_duty,
            })
        } else {
            Self::Hwmon(HwmonPwm {
                pwm_path,
                enable_path,
            })
        }
    }

    pub fn pwm_path(&self) -> &Path {
        match self {
            Self::Hwmon(a) => &a.pwm_path,
            Self::Gpu(a) => &a.pwm_path,
        }
    }

    pub fn enable_path(&self) -> Option<&Path> {
        match self {
            Self::Hwmon(a) => a.enable_path.as_deref(),
            Self::Gpu(a) => a.enable_path.as_deref(),
        }
    }

    pub fn capabilities(&self) -> ActuatorCapabilities {
        match self {
            Self::Hwmon(a) => ActuatorCapabilities {
                kind: ActuatorKind::GenericPwm,
                has_enable: a.enable_path.is_some(),
                min_duty: pwm::MIN_VALUE,
                max_duty: pwm::MAX_VALUE,
            },
            Self::Gpu(a) => ActuatorCapabilities {
                kind: ActuatorKind::GpuPwm,
                has_enable: a.enable_path.is_some(),
                min_duty: a.min_duty,
                max_duty: a.max_duty,
            },
        }
    }

    /// Clamp a duty command into this actuator's window
    pub fn clamp_duty(&self, duty: u8) -> u8 {
        let caps = self.capabilities();
        duty.clamp(caps.min_duty, caps.max_duty)
    }

    pub fn read_duty(&self, io: &dyn SensorIo) -> Result<u8> {
        let path = self.pwm_path();
        let raw = io.read_value(path)?;
        validate_pwm_value(raw).map_err(|e| FanbindError::unreadable(path, e.to_string()))
    }

    /// Write a duty value, returning what was actually commanded after clamping
    pub fn write_duty(&self, io: &dyn SensorIo, duty: u8) -> Result<u8> {
        let clamped = self.clamp_duty(duty);
        io.write_value(self.pwm_path(), clamped as i64)?;
        Ok(clamped)
    }

    /// Current enable mode, or `None` for outputs without a mode switch
    pub fn read_enable(&self, io: &dyn SensorIo) -> Result<Option<EnableMode>> {
        let Some(path) = self.enable_path() else {
            return Ok(None);
        };
        let raw = io.read_value(path)?;
        EnableMode::from_raw(raw)
            .map(Some)
            .ok_or_else(|| FanbindError::unreadable(path, format!("unknown enable mode {}", raw)))
    }

    /// Switch the enable mode; a no-op for outputs without a mode switch
    pub fn write_enable(&self, io: &dyn SensorIo, mode: EnableMode) -> Result<()> {
        match self.enable_path() {
            Some(path) => io.write_value(path, mode.raw() as i64),
            None => Ok(()),
        }
    }
}

fn read_limit(path: &Path) -> Option<u8> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(pwm::clamp_raw)
}
