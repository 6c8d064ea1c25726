//! Test fixtures: an in-memory hwmon tree whose fans answer PWM writes

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::data::{Chip, EnableMode, FanChannel, HardwareSnapshot, Millidegrees, PwmChannel, TemperatureChannel};
use crate::error::{FanbindError, Result};
use crate::hw::{
    Actuator, ChipTopology, Fingerprinter, HardwareInventory, HwmonPwm, SensorIo, SnapshotSource,
    TopologySource,
};

/// How a simulated tachometer behaves
#[derive(Debug, Clone)]
pub(crate) enum FanModel {
    /// RPM follows the duty of one PWM output
    Driven { pwm: PathBuf, max_rpm: u32, stall_duty: u8 },
    /// RPM never changes
    Constant(u32),
}

/// When a simulated attribute starts or stops failing
#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    Always,
    /// The first `n` operations succeed, every later one fails
    After(u32),
    /// The next `n` operations fail, later ones succeed
    Times(u32),
}

#[derive(Debug)]
struct FailurePlan {
    failure: Failure,
    seen: u32,
}

impl FailurePlan {
    fn trips(&mut self) -> bool {
        let seen = self.seen;
        self.seen += 1;
        match self.failure {
            Failure::Always => true,
            Failure::After(n) => seen >= n,
            Failure::Times(n) => seen < n,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    values: HashMap<PathBuf, i64>,
    fans: HashMap<PathBuf, FanModel>,
    read_failures: HashMap<PathBuf, FailurePlan>,
    write_failures: HashMap<PathBuf, FailurePlan>,
    denied: HashSet<PathBuf>,
    stalled: HashMap<PathBuf, Duration>,
    attempts: HashMap<PathBuf, u32>,
    writes: Vec<(PathBuf, i64)>,
}

#[derive(Debug, Default)]
pub(crate) struct SimulatedIo {
    state: Mutex<SimState>,
}

impl SimulatedIo {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, path: impl AsRef<Path>, value: i64) {
        self.state
            .lock()
            .values
            .insert(path.as_ref().to_path_buf(), value);
    }

    pub(crate) fn get(&self, path: impl AsRef<Path>) -> Option<i64> {
        self.state.lock().values.get(path.as_ref()).copied()
    }

    pub(crate) fn add_fan(&self, input: impl AsRef<Path>, model: FanModel) {
        self.state
            .lock()
            .fans
            .insert(input.as_ref().to_path_buf(), model);
    }

    pub(crate) fn fail_reads(&self, path: impl AsRef<Path>, failure: Failure) {
        self.state.lock().read_failures.insert(
            path.as_ref().to_path_buf(),
            FailurePlan { failure, seen: 0 },
        );
    }

    pub(crate) fn fail_writes(&self, path: impl AsRef<Path>, failure: Failure) {
        self.state.lock().write_failures.insert(
            path.as_ref().to_path_buf(),
            FailurePlan { failure, seen: 0 },
        );
    }

    /// Writes fail the way sysfs answers a process without CAP_SYS_ADMIN
    pub(crate) fn deny_writes(&self, path: impl AsRef<Path>) {
        self.state.lock().denied.insert(path.as_ref().to_path_buf());
    }

    /// Every write blocks for `delay` before it lands
    pub(crate) fn stall_writes(&self, path: impl AsRef<Path>, delay: Duration) {
        self.state
            .lock()
            .stalled
            .insert(path.as_ref().to_path_buf(), delay);
    }

    /// Write attempts, failed ones included
    pub(crate) fn attempts(&self, path: impl AsRef<Path>) -> u32 {
        self.state
            .lock()
            .attempts
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn clear_failures(&self, path: impl AsRef<Path>) {
        let mut state = self.state.lock();
        state.read_failures.remove(path.as_ref());
        state.write_failures.remove(path.as_ref());
    }

    pub(crate) fn writes(&self) -> Vec<(PathBuf, i64)> {
        self.state.lock().writes.clone()
    }

    pub(crate) fn writes_to(&self, path: impl AsRef<Path>) -> Vec<i64> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(p, _)| p == path.as_ref())
            .map(|(_, v)| *v)
            .collect()
    }
}

impl SensorIo for SimulatedIo {
    fn read_value(&self, path: &Path) -> Result<i64> {
        let mut state = self.state.lock();
        if let Some(plan) = state.read_failures.get_mut(path) {
            if plan.trips() {
                return Err(FanbindError::unreadable(path, "simulated read failure"));
            }
        }
        if let Some(model) = state.fans.get(path).cloned() {
            return Ok(match model {
                FanModel::Constant(rpm) => rpm as i64,
                FanModel::Driven {
                    pwm,
                    max_rpm,
                    stall_duty,
                } => {
                    let duty = state.values.get(&pwm).copied().unwrap_or(0);
                    if duty < stall_duty as i64 {
                        0
                    } else {
                        300 + (max_rpm as i64 - 300) * duty / 255
                    }
                }
            });
        }
        state
            .values
            .get(path)
            .copied()
            .ok_or_else(|| FanbindError::unreadable(path, "no such attribute"))
    }

    fn write_value(&self, path: &Path, value: i64) -> Result<()> {
        let stall = self.state.lock().stalled.get(path).copied();
        if let Some(delay) = stall {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        *state.attempts.entry(path.to_path_buf()).or_default() += 1;
        if state.denied.contains(path) {
            return Err(FanbindError::InsufficientPrivilege {
                path: path.to_path_buf(),
                reason: "Permission denied (os error 13)".into(),
            });
        }
        if let Some(plan) = state.write_failures.get_mut(path) {
            if plan.trips() {
                return Err(FanbindError::PwmWrite {
                    path: path.to_path_buf(),
                    reason: "simulated write failure".into(),
                });
            }
        }
        state.writes.push((path.to_path_buf(), value));
        state.values.insert(path.to_path_buf(), value);
        Ok(())
    }
}

/// Topology that reports the same platform device for every chip
pub(crate) struct StaticTopology;

impl TopologySource for StaticTopology {
    fn chip_topology(&self, chip: &Chip) -> ChipTopology {
        ChipTopology {
            bus_address: Some(format!("platform:{}.656", chip.name)),
            vendor_id: None,
            device_id: None,
            driver: Some(chip.name.clone()),
        }
    }
}

/// Snapshot source that always returns the same snapshot
pub(crate) struct StaticSnapshot(pub HardwareSnapshot);

impl SnapshotSource for StaticSnapshot {
    fn snapshot(&self) -> Result<HardwareSnapshot> {
        Ok(self.0.clone())
    }
}

/// Simulated rig: one SuperIO chip with `driven` PWM/fan pairs, extra
/// constant-speed fans, and two temperature inputs
pub(crate) struct SimRig {
    pub io: Arc<SimulatedIo>,
    pub snapshot: HardwareSnapshot,
}

impl SimRig {
    pub(crate) const CHIP: &'static str = "/sim/hwmon0";

    pub(crate) fn new(driven: u32, constant: u32) -> Self {
        let io = Arc::new(SimulatedIo::new());
        let chip_path = PathBuf::from(Self::CHIP);
        let mut pwms = Vec::new();
        let mut fans = Vec::new();

        for index in 1..=driven {
            let pwm_path = chip_path.join(format!("pwm{}", index));
            let enable_path = chip_path.join(format!("pwm{}_enable", index));
            let fan_path = chip_path.join(format!("fan{}_input", index));
            io.set(&pwm_path, 120);
            io.set(&enable_path, 2);
            io.add_fan(
                &fan_path,
                FanModel::Driven {
                    pwm: pwm_path.clone(),
                    max_rpm: 1500 + 300 * index,
                    stall_duty: 20,
                },
            );
            pwms.push(PwmChannel {
                name: format!("pwm{}", index),
                index,
                label: None,
                duty: 120,
                enable: Some(EnableMode::Automatic(2)),
                actuator: Actuator::Hwmon(HwmonPwm {
                    pwm_path,
                    enable_path: Some(enable_path),
                }),
            });
            fans.push(FanChannel {
                name: format!("fan{}", index),
                index,
                input_path: fan_path,
                label: None,
                rpm: 900,
            });
        }

        for extra in 0..constant {
            let index = driven + extra + 1;
            let fan_path = chip_path.join(format!("fan{}_input", index));
            io.add_fan(&fan_path, FanModel::Constant(1100));
            fans.push(FanChannel {
                name: format!("fan{}", index),
                index,
                input_path: fan_path,
                label: None,
                rpm: 1100,
            });
        }

        let temperatures = (1..=2)
            .map(|index| {
                let input_path = chip_path.join(format!("temp{}_input", index));
                io.set(&input_path, 40_000);
                TemperatureChannel {
                    name: format!("temp{}", index),
                    index,
                    input_path,
                    label: None,
                    value: Millidegrees(40_000),
                    read_at_ms: 0,
                }
            })
            .collect();

        let snapshot = HardwareSnapshot {
            chips: vec![Chip {
                name: "nct6798".into(),
                path: chip_path,
                temperatures,
                fans,
                pwms,
            }],
            taken_at_ms: 0,
        };

        Self { io, snapshot }
    }

    pub(crate) fn inventory(&self) -> HardwareInventory {
        Fingerprinter::new(&StaticTopology).inventory(&self.snapshot)
    }

    pub(crate) fn dyn_io(&self) -> Arc<dyn SensorIo> {
        self.io.clone()
    }

    pub(crate) fn path(name: &str) -> PathBuf {
        PathBuf::from(Self::CHIP).join(name)
    }
}
