//! Hardware interaction modules
//!
//! Enumeration, topology, fingerprints, actuators and the I/O seam every
//! hardware access goes through.

mod actuator;
mod fingerprint;
mod hardware;
mod io;
mod topology;

pub use actuator::{Actuator, ActuatorCapabilities, ActuatorKind, GpuPwm, HwmonPwm};
pub use fingerprint::{
    classify_chip, ChipClass, ChipIdentity, Fingerprinter, HardwareFingerprint, HardwareInventory,
};
pub use hardware::{check_pwm_permissions, is_automatic, snapshot_to_json, Enumerator, SnapshotSource};
pub use io::{bounded, read_bounded, SensorIo, SysfsIo};
pub use topology::{ChipTopology, SysfsTopology, TopologySource};

#[cfg(test)]
pub(crate) use topology::MockTopologySource;
