//! Curve evaluation and the control loop

mod control;
mod curve;

pub use control::{
    apply_start_stop, rate_limit, ControlLoop, ControlLoopState, ControlProfile, ControlShared,
    Fallback, FanPolicy, FanReadout, FanState, FanStatus, ManagedFan, ManagedSource,
    ReadingsSnapshot, Regime, StartStop,
};
pub use curve::{Curve, CurveBinding, CurvePreset, FanCurveSet, MixMode};
