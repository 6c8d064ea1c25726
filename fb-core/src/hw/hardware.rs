//! Hardware enumeration for hwmon devices
//!
//! # Sensor Types
//!
//! - **Temperature**: `tempN_input` files (millidegrees Celsius)
//! - **Fan**: `fanN_input` files (RPM)
//! - **PWM**: `pwmN` files (0-255 duty cycle), with optional `pwmN_enable`
//!
//! Enumeration is read-only. A channel that cannot be read is left out of
//! the snapshot; one bad attribute never aborts the scan.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

use crate::constants::paths;
use crate::data::{
    timestamp_ms, Chip, EnableMode, FanChannel, HardwareSnapshot,
    Millidegrees, PwmChannel, TemperatureChannel,
};
use crate::error::Result;
use crate::hw::actuator::Actuator;
use crate::hw::io::{SensorIo, SysfsIo};

/// Anything that can produce a hardware snapshot
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<HardwareSnapshot>;
}

/// Walks a hwmon class directory and builds snapshots
#[derive(Debug, Clone)]
pub struct Enumerator {
    root: PathBuf,
}

impl Default for Enumerator {
    fn default() -> Self {
        Self::new(paths::HWMON_BASE)
    }
}

impl Enumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate all hwmon chips and their channels
    pub fn snapshot(&self) -> Result<HardwareSnapshot> {
        if !self.root.is_dir() {
            warn!(root = ?self.root, "No hwmon tree found");
            return Ok(HardwareSnapshot {
                chips: Vec::new(),
                taken_at_ms: timestamp_ms(),
            });
        }

        debug!("Scanning hwmon chips in {:?}", self.root);
        let mut chips = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            trace!("Checking hwmon device: {:?}", path);

            match read_chip(&path) {
                Some(chip) => {
                    info!(
                        chip = %chip.name,
                        temps = chip.temperatures.len(),
                        fans = chip.fans.len(),
                        pwms = chip.pwms.len(),
                        "Found hwmon chip"
                    );
                    chips.push(chip);
                }
                None => trace!("Skipped {:?} (no usable channels)", path),
            }
        }

        chips.sort_by(|a, b| a.path.cmp(&b.path));
        info!("Total hwmon chips found: {}", chips.len());

        Ok(HardwareSnapshot {
            chips,
            taken_at_ms: timestamp_ms(),
        })
    }
}

impl SnapshotSource for Enumerator {
    fn snapshot(&self) -> Result<HardwareSnapshot> {
        Enumerator::snapshot(self)
    }
}

fn read_chip(chip_path: &Path) -> Option<Chip> {
    let name = fs::read_to_string(chip_path.join("name"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            chip_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })?;

    let entries = match fs::read_dir(chip_path) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = ?chip_path, error = %e, "Chip directory unreadable");
            return None;
        }
    };

    let mut files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    files.sort();

    let mut temperatures = Vec::new();
    let mut fans = Vec::new();
    let mut pwms = Vec::new();

    for file in &files {
        if let Some(index) = channel_index(file, "temp", "_input") {
            temperatures.extend(read_temperature(chip_path, index));
        } else if let Some(index) = channel_index(file, "fan", "_input") {
            fans.extend(read_fan(chip_path, index));
        } else if let Some(index) = channel_index(file, "pwm", "") {
            pwms.extend(read_pwm(&name, chip_path, index));
        }
    }

    temperatures.sort_by_key(|t: &TemperatureChannel| t.index);
    fans.sort_by_key(|f: &FanChannel| f.index);
    pwms.sort_by_key(|p: &PwmChannel| p.index);

    if temperatures.is_empty() && fans.is_empty() && pwms.is_empty() {
        return None;
    }

    Some(Chip {
        name,
        path: chip_path.to_path_buf(),
        temperatures,
        fans,
        pwms,
    })
}

/// Channel number of `<prefix><N><suffix>`, e.g. `fan3_input` -> 3
pub(crate) fn channel_index(file: &str, prefix: &str, suffix: &str) -> Option<u32> {
    let digits = file.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn read_label(chip_path: &Path, base: &str) -> Option<String> {
    fs::read_to_string(chip_path.join(format!("{}_label", base)))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_temperature(chip_path: &Path, index: u32) -> Option<TemperatureChannel> {
    let name = format!("temp{}", index);
    let input_path = chip_path.join(format!("{}_input", name));
    let raw = match SysfsIo.read_value(&input_path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(sensor = %name, error = %e, "Temperature channel unreadable, omitting");
            return None;
        }
    };
    let Ok(millidegrees) = i32::try_from(raw) else {
        debug!(sensor = %name, raw, "Temperature out of range, omitting");
        return None;
    };

    Some(TemperatureChannel {
        label: read_label(chip_path, &name),
        name,
        index,
        input_path,
        value: Millidegrees(millidegrees),
        read_at_ms: timestamp_ms(),
    })
}

fn read_fan(chip_path: &Path, index: u32) -> Option<FanChannel> {
    let name = format!("fan{}", index);
    let input_path = chip_path.join(format!("{}_input", name));
    let rpm = match SysfsIo.read_value(&input_path).map(u32::try_from) {
        Ok(Ok(rpm)) => rpm,
        Ok(Err(_)) => {
            debug!(sensor = %name, "Negative RPM, omitting");
            return None;
        }
        Err(e) => {
            debug!(sensor = %name, error = %e, "Fan channel unreadable, omitting");
            return None;
        }
    };

    trace!(fan = %name, rpm, "Read fan sensor");
    Some(FanChannel {
        label: read_label(chip_path, &name),
        name,
        index,
        input_path,
        rpm,
    })
}

fn read_pwm(chip_model: &str, chip_path: &Path, index: u32) -> Option<PwmChannel> {
    let name = format!("pwm{}", index);
    let actuator = Actuator::for_chip(chip_model, chip_path, &name);

    let duty = match actuator.read_duty(&SysfsIo) {
        Ok(duty) => duty,
        Err(e) => {
            debug!(controller = %name, error = %e, "PWM channel unreadable, omitting");
            return None;
        }
    };

    let enable = match actuator.read_enable(&SysfsIo) {
        Ok(mode) => mode,
        Err(e) => {
            debug!(controller = %name, error = %e, "PWM enable mode unreadable");
            None
        }
    };

    trace!(pwm = %name, duty, enable = ?enable, "Read PWM controller");
    Some(PwmChannel {
        label: read_label(chip_path, &name),
        name,
        index,
        duty,
        enable,
        actuator,
    })
}

/// Export a snapshot as pretty JSON for diagnostics
pub fn snapshot_to_json(snapshot: &HardwareSnapshot) -> Result<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

/// PWM and enable files that cannot be opened for writing (non-destructive)
pub fn check_pwm_permissions(snapshot: &HardwareSnapshot) -> Vec<PathBuf> {
    let mut denied = Vec::new();
    for pwm in snapshot.chips.iter().flat_map(|c| &c.pwms) {
        let paths = std::iter::once(pwm.actuator.pwm_path()).chain(pwm.actuator.enable_path());
        for path in paths {
            if OpenOptions::new().write(true).open(path).is_err() {
                denied.push(path.to_path_buf());
            }
        }
    }
    denied
}

/// Whether a PWM channel is currently under firmware control
pub fn is_automatic(pwm: &PwmChannel) -> bool {
    matches!(pwm.enable, Some(EnableMode::Automatic(_)))
}
