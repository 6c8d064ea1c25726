//! Fan curve engine for temperature-based fan control
//!
//! # How It Works
//!
//! 1. **Interpolation**: Given a temperature, finds the duty by interpolating
//!    linearly between the two bracketing curve points. Outside the curve's
//!    domain the first or last point's duty is used.
//!
//! 2. **Stepped mode**: Holds the lower point's duty until the next point is
//!    reached, for fans that hum at intermediate speeds.
//!
//! 3. **Smoothing**: Each curve carries a smoothing factor in [0,1] that the
//!    control loop turns into the weight of its exponential moving average.
//!
//! 4. **Mixing**: A fan driven by several temperature sources combines the
//!    per-source outputs with one [`MixMode`], fixed per fan.
//!
//! Evaluation here is pure. All per-fan history lives in the control loop.

use serde::{Deserialize, Serialize};

use crate::constants::curve as curve_const;
use crate::data::{validate_curve_points, CurvePoint};
use crate::error::{FanbindError, Result};
use crate::hw::HardwareFingerprint;

/// Validated piecewise-linear temperature to duty curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CurveDef")]
pub struct Curve {
    points: Vec<CurvePoint>,
    smoothing: f32,
    stepped: bool,
}

#[derive(Deserialize)]
struct CurveDef {
    points: Vec<CurvePoint>,
    #[serde(default)]
    smoothing: f32,
    #[serde(default)]
    stepped: bool,
}

impl TryFrom<CurveDef> for Curve {
    type Error = FanbindError;

    fn try_from(def: CurveDef) -> Result<Self> {
        Ok(Curve::new(def.points, def.smoothing)?.with_stepped(def.stepped))
    }
}

impl Curve {
    /// Create a curve after validating its points and smoothing factor
    pub fn new(points: Vec<CurvePoint>, smoothing: f32) -> Result<Self> {
        validate_curve_points(&points)?;
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(FanbindError::InvalidCurve(format!(
                "smoothing {} is outside 0-1",
                smoothing
            )));
        }
        Ok(Self {
            points,
            smoothing,
            stepped: false,
        })
    }

    /// Enable stepped mode (jump between curve points instead of interpolating)
    pub fn with_stepped(mut self, stepped: bool) -> Self {
        self.stepped = stepped;
        self
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn is_stepped(&self) -> bool {
        self.stepped
    }

    /// Duty percentage (0-100) for a filtered temperature
    ///
    /// - Below minimum temp: returns the first point's duty
    /// - Above maximum temp: returns the last point's duty
    /// - Between points: linear interpolation
    pub fn evaluate(&self, temp_c: f32) -> f32 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return curve_const::FALLBACK_FAN_PERCENT;
        };
        if temp_c.is_nan() {
            return curve_const::FALLBACK_FAN_PERCENT;
        }

        if temp_c <= first.temperature {
            return first.duty_percent;
        }
        if temp_c >= last.temperature {
            return last.duty_percent;
        }

        for window in self.points.windows(2) {
            let lower = &window[0];
            let upper = &window[1];

            if temp_c >= lower.temperature && temp_c <= upper.temperature {
                if self.stepped {
                    return if temp_c >= upper.temperature {
                        upper.duty_percent
                    } else {
                        lower.duty_percent
                    };
                }

                let temp_range = upper.temperature - lower.temperature;
                if temp_range.abs() < curve_const::FLOAT_EPSILON {
                    return lower.duty_percent;
                }

                let ratio = (temp_c - lower.temperature) / temp_range;
                let duty = lower.duty_percent + ratio * (upper.duty_percent - lower.duty_percent);
                return duty.clamp(0.0, 100.0);
            }
        }

        curve_const::FALLBACK_FAN_PERCENT
    }

    /// Highest duty the curve asks for at any temperature below `temp_c`
    pub fn peak_below(&self, temp_c: f32) -> f32 {
        let Some(first) = self.points.first() else {
            return curve_const::FALLBACK_FAN_PERCENT;
        };
        let mut peak = self
            .points
            .iter()
            .filter(|p| p.temperature < temp_c)
            .fold(first.duty_percent, |acc, p| acc.max(p.duty_percent));
        // Interpolated segments approach their value at temp_c from below
        if !self.stepped && temp_c > first.temperature {
            peak = peak.max(self.evaluate(temp_c));
        }
        peak
    }

    /// EMA weight of a new sample, `1 - smoothing`, never zero
    pub fn ema_alpha(&self) -> f32 {
        1.0 - self.smoothing.min(curve_const::MAX_EFFECTIVE_SMOOTHING)
    }

    fn from_trusted(points: Vec<CurvePoint>) -> Self {
        Self {
            points,
            smoothing: 0.0,
            stepped: false,
        }
    }
}

impl Default for Curve {
    fn default() -> Self {
        CurvePreset::Balanced.to_curve()
    }
}

/// How the outputs of several curves for one fan are combined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixMode {
    #[default]
    Max,
    Min,
    Average,
}

impl MixMode {
    /// Combine curve outputs; `None` when there is nothing to combine
    pub fn mix(self, values: &[f32]) -> Option<f32> {
        if values.is_empty() {
            return None;
        }
        let result = match self {
            Self::Max => values.iter().copied().fold(f32::MIN, f32::max),
            Self::Min => values.iter().copied().fold(f32::MAX, f32::min),
            Self::Average => values.iter().sum::<f32>() / values.len() as f32,
        };
        Some(result)
    }
}

/// One temperature source and the curve applied to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveBinding {
    pub source: HardwareFingerprint,
    pub curve: Curve,
}

/// All curves driving one fan plus the mixing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanCurveSet {
    pub bindings: Vec<CurveBinding>,
    #[serde(default)]
    pub mix: MixMode,
}

impl FanCurveSet {
    pub fn single(source: HardwareFingerprint, curve: Curve) -> Self {
        Self {
            bindings: vec![CurveBinding { source, curve }],
            mix: MixMode::Max,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bindings.is_empty() {
            return Err(FanbindError::InvalidCurve(
                "a fan needs at least one temperature source".into(),
            ));
        }
        for (i, a) in self.bindings.iter().enumerate() {
            if self.bindings[..i].iter().any(|b| b.source == a.source) {
                return Err(FanbindError::InvalidCurve(format!(
                    "temperature source {} is bound twice",
                    a.source
                )));
            }
        }
        Ok(())
    }

    pub fn sources(&self) -> impl Iterator<Item = &HardwareFingerprint> {
        self.bindings.iter().map(|b| &b.source)
    }
}

/// Preset curve profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurvePreset {
    Quiet,
    Balanced,
    Performance,
    FullSpeed,
}

impl CurvePreset {
    /// Get the curve points for this preset
    pub fn points(&self) -> Vec<CurvePoint> {
        use crate::constants::default_curve;
        match self {
            CurvePreset::Quiet => default_curve::quiet(),
            CurvePreset::Balanced => default_curve::balanced(),
            CurvePreset::Performance => default_curve::performance(),
            CurvePreset::FullSpeed => default_curve::full_speed(),
        }
    }

    pub fn to_curve(&self) -> Curve {
        Curve::from_trusted(self.points())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_curve() -> Curve {
        Curve::new(
            vec![
                CurvePoint::new(30.0, 30.0),
                CurvePoint::new(60.0, 50.0),
                CurvePoint::new(80.0, 100.0),
            ],
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn test_interpolation_between_points() {
        let curve = test_curve();
        assert!((curve.evaluate(45.0) - 40.0).abs() < 0.001);
        assert!((curve.evaluate(70.0) - 75.0).abs() < 0.001);
    }

    #[test]
    fn test_clamped_outside_domain() {
        let curve = test_curve();
        assert!((curve.evaluate(20.0) - 30.0).abs() < 0.001);
        assert!((curve.evaluate(90.0) - 100.0).abs() < 0.001);
        assert!((curve.evaluate(30.0) - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_stepped_holds_lower_point() {
        let curve = test_curve().with_stepped(true);
        assert!((curve.evaluate(59.9) - 30.0).abs() < 0.001);
        assert!((curve.evaluate(60.0) - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_peak_below() {
        let curve = test_curve();
        assert!((curve.peak_below(20.0) - 30.0).abs() < 0.001);
        assert!((curve.peak_below(45.0) - 40.0).abs() < 0.001);
        assert!((curve.peak_below(90.0) - 100.0).abs() < 0.001);

        let stepped = test_curve().with_stepped(true);
        assert!((stepped.peak_below(60.0) - 30.0).abs() < 0.001);
        assert!((stepped.peak_below(60.5) - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_invalid_curves_rejected() {
        assert!(Curve::new(vec![], 0.0).is_err());
        assert!(Curve::new(
            vec![CurvePoint::new(50.0, 20.0), CurvePoint::new(40.0, 60.0)],
            0.0
        )
        .is_err());
        assert!(Curve::new(vec![CurvePoint::new(50.0, 120.0)], 0.0).is_err());
        assert!(Curve::new(vec![CurvePoint::new(50.0, 20.0)], 1.5).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Curve =
            serde_json::from_str(r#"{"points":[{"temperature":40.0,"duty_percent":20.0}]}"#)
                .unwrap();
        assert_eq!(ok.points().len(), 1);

        let bad = serde_json::from_str::<Curve>(
            r#"{"points":[{"temperature":40.0,"duty_percent":20.0}],"smoothing":3.0}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_mix_modes() {
        let values = [30.0, 60.0, 45.0];
        assert_eq!(MixMode::Max.mix(&values), Some(60.0));
        assert_eq!(MixMode::Min.mix(&values), Some(30.0));
        assert_eq!(MixMode::Average.mix(&values), Some(45.0));
        assert_eq!(MixMode::Average.mix(&[]), None);
    }

    #[test]
    fn test_ema_alpha_never_freezes() {
        let frozen = Curve::new(vec![CurvePoint::new(40.0, 50.0)], 1.0).unwrap();
        assert!(frozen.ema_alpha() > 0.0);
        assert!((test_curve().ema_alpha() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in [
            CurvePreset::Quiet,
            CurvePreset::Balanced,
            CurvePreset::Performance,
            CurvePreset::FullSpeed,
        ] {
            assert!(validate_curve_points(&preset.points()).is_ok());
            assert!(preset.to_curve().evaluate(200.0) <= 100.0);
        }
    }
}
