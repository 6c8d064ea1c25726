//! Fanbind Core Library
//!
//! Discovery and steady-state control of Linux hwmon fans.
//!
//! # Features
//!
//! - **Hardware Discovery**: enumeration of hwmon chips with stable, path-independent fingerprints
//! - **Active Detection**: probing each PWM output to pair it with the fan it drives
//! - **Fan Curves**: piecewise-linear curves with smoothing, mixing and start/stop hysteresis
//! - **Safety**: every touched channel is restored on exit; unresolvable faults force full duty
//!
//! # Module Structure
//!
//! - `hw/` - Enumeration, fingerprints, actuators and the sensor I/O seam
//! - `data/` - Snapshot and mapping types, validation
//! - `detection/` - Probe engine and confidence scoring
//! - `engine/` - Curve engine and control loop
//! - `context` - The command surface a daemon drives
//!
//! # Example
//!
//! ```no_run
//! use fb_core::{EngineConfig, FanbindContext};
//!
//! # async fn run() -> fb_core::Result<()> {
//! let ctx = FanbindContext::from_config(EngineConfig::default());
//! let inventory = ctx.inventory().await?;
//! for (fingerprint, pwm) in inventory.pwms() {
//!     println!("{} -> {}", fingerprint, pwm.name);
//! }
//! # Ok(())
//! # }
//! ```

// Grouped modules
pub mod data;
pub mod detection;
pub mod engine;
pub mod hw;

// Standalone modules
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod safety;

#[cfg(test)]
mod test_utils;

pub use config::{ControlConfig, EngineConfig, ProbeConfig, ScorerConfig};
pub use context::{
    ApplyReport, ConfirmedMapping, FanbindContext, ProbeRequest, ProbeSession, Profile,
    ProfileEntry,
};
pub use data::{CurvePoint, FanMapping, HardwareSnapshot, MappingSource};
pub use detection::{Acceptance, ProbeEvent, ProbeReport, ProbeState};
pub use engine::{ControlLoop, Curve, CurvePreset, FanCurveSet, FanPolicy, MixMode, ReadingsSnapshot};
pub use error::{FanbindError, Result};
pub use hw::{Enumerator, HardwareFingerprint, HardwareInventory};
pub use safety::{RestoreReport, SafetyGuard};
