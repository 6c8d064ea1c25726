//! Data types and validation
//!
//! Contains the snapshot and mapping structures shared by every module.

mod types;
mod validation;

pub(crate) use types::timestamp_ms;
pub use types::{
    ChannelKind, Chip, CurvePoint, EnableMode, FanChannel, FanMapping, HardwareSnapshot,
    MappingSource, Millidegrees, PwmChannel, TemperatureChannel,
};
pub use validation::{
    validate_curve_points, validate_file_size, validate_percentage, validate_pwm_value,
};
