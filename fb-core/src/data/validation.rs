//! Input validation for curves, duty values and config files

use std::path::Path;

use crate::constants::{limits, pwm};
use crate::data::CurvePoint;
use crate::error::{FanbindError, Result};

/// Validates that a raw PWM value is within the valid range (0-255)
pub fn validate_pwm_value(value: i64) -> Result<u8> {
    if !(pwm::MIN_VALUE as i64..=pwm::MAX_VALUE as i64).contains(&value) {
        return Err(FanbindError::InvalidPwmValue { value });
    }
    Ok(value as u8)
}

/// Validates that a percentage is within the valid range (0.0-100.0)
pub fn validate_percentage(value: f32) -> Result<f32> {
    if !(0.0..=100.0).contains(&value) {
        return Err(FanbindError::InvalidCurve(format!(
            "duty {} is outside 0-100%",
            value
        )));
    }
    Ok(value)
}

/// Validates curve points for consistency
pub fn validate_curve_points(points: &[CurvePoint]) -> Result<()> {
    if points.is_empty() {
        return Err(FanbindError::InvalidCurve(
            "curve must have at least one point".into(),
        ));
    }

    if points.len() > limits::MAX_CURVE_POINTS {
        return Err(FanbindError::InvalidCurve(format!(
            "curve exceeds maximum of {} points",
            limits::MAX_CURVE_POINTS
        )));
    }

    for (point_index, point) in points.iter().enumerate() {
        if !(limits::MIN_CURVE_TEMPERATURE..=limits::MAX_CURVE_TEMPERATURE)
            .contains(&point.temperature)
        {
            return Err(FanbindError::InvalidCurve(format!(
                "curve point {} has invalid temperature: {:.1}°C (must be {}-{}°C)",
                point_index,
                point.temperature,
                limits::MIN_CURVE_TEMPERATURE,
                limits::MAX_CURVE_TEMPERATURE
            )));
        }

        validate_percentage(point.duty_percent)?;
    }

    for window in points.windows(2) {
        if window[0].temperature >= window[1].temperature {
            return Err(FanbindError::InvalidCurve(
                "curve points must be strictly increasing in temperature".into(),
            ));
        }
    }

    Ok(())
}

/// Rejects config and profile files larger than the allowed size
pub fn validate_file_size(path: &Path) -> Result<u64> {
    let metadata = std::fs::metadata(path).map_err(|source| FanbindError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    if metadata.len() > limits::MAX_FILE_SIZE {
        return Err(FanbindError::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max_size: limits::MAX_FILE_SIZE,
        });
    }

    Ok(metadata.len())
}
