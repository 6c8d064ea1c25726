//! Constants and default values for Fanbind
//!
//! Centralizes the fixed numbers used by enumeration, probing, scoring and
//! control. Values a user may reasonably want to tune live in `config`
//! instead; the defaults for those are taken from here.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Base path for hwmon devices
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// Journald socket, present on systemd hosts
    pub const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

    /// Default daemon configuration file
    pub const CONFIG_FILE: &str = "/etc/fanbind/config.json";
}

/// PWM control constants
pub mod pwm {
    /// Minimum PWM value (fan off or minimum speed)
    pub const MIN_VALUE: u8 = 0;

    /// Maximum PWM value (full speed)
    pub const MAX_VALUE: u8 = 255;

    /// PWM enable values
    pub mod enable {
        /// PWM control disabled (most drivers run the fan at full speed)
        pub const DISABLED: u8 = 0;

        /// Manual PWM control
        pub const MANUAL: u8 = 1;

        /// Automatic/thermal control (drivers may use any value >= 2)
        pub const AUTOMATIC: u8 = 2;
    }

    /// Convert percentage (0-100) to PWM value (0-255)
    #[inline]
    pub fn from_percent(percent: f32) -> u8 {
        if !percent.is_finite() {
            return MAX_VALUE;
        }
        ((percent.clamp(0.0, 100.0) / 100.0) * 255.0).round() as u8
    }

    /// Convert PWM value (0-255) to percentage (0-100)
    #[inline]
    pub fn to_percent(value: u8) -> f32 {
        (value as f32 / 255.0) * 100.0
    }

    /// Clamp an arbitrary integer into the hardware duty range
    #[inline]
    pub fn clamp_raw(value: i64) -> u8 {
        value.clamp(MIN_VALUE as i64, MAX_VALUE as i64) as u8
    }
}

/// Temperature constants
pub mod temperature {
    /// Temperature readings are in millidegrees, divide by this to get Celsius
    pub const MILLIDEGREE_DIVISOR: f32 = 1000.0;

    /// Lowest plausible sensor reading (°C); anything below is a read fault
    pub const MIN_PLAUSIBLE: f32 = -55.0;

    /// Highest plausible sensor reading (°C); anything above is a read fault
    pub const MAX_PLAUSIBLE: f32 = 150.0;
}

/// Timing defaults for probing and control
pub mod timing {
    use super::*;

    /// Control loop period
    pub const CONTROL_PERIOD: Duration = Duration::from_millis(100);

    /// Upper bound on any single sysfs read or write
    pub const IO_TIMEOUT: Duration = Duration::from_millis(500);

    /// Upper bound on a full walk of the hwmon tree
    pub const ENUMERATE_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Time a probe level is held for the fan to settle
    pub const PROBE_HOLD: Duration = Duration::from_millis(3000);

    /// Time allowed after parking all PWMs before measuring baselines
    pub const PROBE_SETTLE: Duration = Duration::from_millis(2000);

    /// Interval between fan tachometer samples during a probe
    pub const PROBE_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

    /// Default lifetime of a manual PWM override
    pub const OVERRIDE_TTL: Duration = Duration::from_millis(5000);

    /// Shortest override lifetime accepted
    pub const MIN_OVERRIDE_TTL: Duration = Duration::from_millis(50);
}

/// Probe session parameters
pub mod probe {
    /// Duty sequence driven on every PWM: low, mid, high, low
    pub const LEVELS: [u8; 4] = [64, 160, 255, 64];

    /// Subset of the sequence replayed to confirm a response
    pub const VALIDATION_LEVELS: [u8; 2] = [255, 64];

    /// Duty every PWM is parked at while another one is probed
    pub const PARK_DUTY: u8 = 255;

    /// Tachometer samples taken for the pre-probe baseline window
    pub const BASELINE_SAMPLES: usize = 8;

    /// Smallest RPM change treated as a response, regardless of noise
    pub const MIN_RPM_DELTA: u32 = 100;

    /// Multiple of baseline standard deviation a change must exceed
    pub const NOISE_FACTOR: f32 = 4.0;

    /// Below this RPM a fan is considered stopped
    pub const STALL_RPM: u32 = 50;

    /// Read attempts per tachometer sample before a fan is dropped
    pub const READ_RETRY_BUDGET: u32 = 3;
}

/// Confidence scoring defaults and acceptance thresholds
pub mod confidence {
    /// Above this a mapping may be applied without confirmation
    pub const AUTO_ACCEPT: f32 = 0.90;

    /// Above this a mapping is applied with a visible warning
    pub const ACCEPT_WITH_WARNING: f32 = 0.70;

    /// Above this a mapping needs explicit user confirmation
    pub const REQUIRES_CONFIRMATION: f32 = 0.40;

    /// Default weight of the repeatability component
    pub const REPEATABILITY_WEIGHT: f32 = 0.4;

    /// Default weight of the magnitude-over-noise component
    pub const MAGNITUDE_WEIGHT: f32 = 0.3;

    /// Default weight of the monotonicity component
    pub const MONOTONICITY_WEIGHT: f32 = 0.3;

    /// Signal-to-noise ratio at which the magnitude component saturates
    pub const SNR_SATURATION: f32 = 20.0;

    /// RPM delta at which the magnitude component saturates
    pub const DELTA_SATURATION_RPM: f32 = 400.0;

    /// Floor applied to baseline standard deviation (RPM)
    pub const NOISE_FLOOR_RPM: f32 = 10.0;

    /// Ceiling for responses that never left the noise band
    pub const INSIGNIFICANT_CAP: f32 = 0.2;

    /// Heuristic (non-probed) suggestions never exceed this
    pub const HEURISTIC_CAP: f32 = 0.65;

    /// Base confidence for an index match on the same chip
    pub const HEURISTIC_INDEX_MATCH: f32 = 0.5;

    /// Base confidence when pairing by position because no indices matched
    pub const HEURISTIC_POSITION_MATCH: f32 = 0.3;

    /// Bonus when fan and PWM labels share a prefix
    pub const HEURISTIC_LABEL_BONUS: f32 = 0.15;

    /// Shared label prefix length that earns the bonus
    pub const HEURISTIC_LABEL_PREFIX: usize = 3;
}

/// Fan curve limits
pub mod curve {
    /// Maximum smoothing factor actually used by the filter; 1.0 would freeze it
    pub const MAX_EFFECTIVE_SMOOTHING: f32 = 0.99;

    /// Epsilon for floating-point comparisons
    pub const FLOAT_EPSILON: f32 = 0.001;

    /// Fan speed used when nothing sensible can be computed (100% for safety)
    pub const FALLBACK_FAN_PERCENT: f32 = 100.0;
}

/// Size and range limits
pub mod limits {
    /// Maximum config or profile file size (1MB)
    pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

    /// Maximum number of curve points
    pub const MAX_CURVE_POINTS: usize = 16;

    /// Lowest temperature accepted in a curve point (°C)
    pub const MIN_CURVE_TEMPERATURE: f32 = -40.0;

    /// Highest temperature accepted in a curve point (°C)
    pub const MAX_CURVE_TEMPERATURE: f32 = 150.0;

    /// Maximum number of managed fans in one profile
    pub const MAX_MAPPINGS: usize = 32;
}

/// Default fan curve presets
pub mod default_curve {
    use crate::data::CurvePoint;

    /// Returns the "quiet" fan curve
    pub fn quiet() -> Vec<CurvePoint> {
        vec![
            CurvePoint::new(35.0, 0.0),
            CurvePoint::new(50.0, 25.0),
            CurvePoint::new(65.0, 45.0),
            CurvePoint::new(75.0, 70.0),
            CurvePoint::new(85.0, 100.0),
        ]
    }

    /// Returns the default "balanced" fan curve
    pub fn balanced() -> Vec<CurvePoint> {
        vec![
            CurvePoint::new(30.0, 20.0),
            CurvePoint::new(50.0, 40.0),
            CurvePoint::new(70.0, 70.0),
            CurvePoint::new(85.0, 100.0),
        ]
    }

    /// Returns the "performance" fan curve
    pub fn performance() -> Vec<CurvePoint> {
        vec![
            CurvePoint::new(30.0, 40.0),
            CurvePoint::new(50.0, 60.0),
            CurvePoint::new(65.0, 80.0),
            CurvePoint::new(75.0, 100.0),
        ]
    }

    /// Returns the "full speed" curve (always 100%)
    pub fn full_speed() -> Vec<CurvePoint> {
        vec![CurvePoint::new(0.0, 100.0)]
    }
}
