//! Pairing confidence
//!
//! Turns one (PWM, fan) response trace into a confidence in [0,1] from
//! three components:
//!
//! - **repeatability**: how closely the validation replay matched the probe
//!   at the same duty levels
//! - **magnitude**: RPM swing relative to baseline noise, and in absolute terms
//! - **monotonicity**: whether RPM moved the same way as the duty at every step
//!
//! The scorer only computes numbers. Enforcing the acceptance thresholds is
//! left to whoever accepts mappings.

use serde::{Deserialize, Serialize};

use crate::config::ScorerConfig;
use crate::constants::confidence;

/// Fan behaviour before the probe touched the PWM
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean_rpm: f32,
    pub std_dev: f32,
}

impl BaselineStats {
    pub fn from_samples(samples: &[u32]) -> Self {
        if samples.is_empty() {
            return Self {
                mean_rpm: 0.0,
                std_dev: 0.0,
            };
        }
        let n = samples.len() as f32;
        let mean = samples.iter().map(|&s| s as f32).sum::<f32>() / n;
        let variance = samples
            .iter()
            .map(|&s| (s as f32 - mean).powi(2))
            .sum::<f32>()
            / n;
        Self {
            mean_rpm: mean,
            std_dev: variance.sqrt(),
        }
    }

    pub fn variance(&self) -> f32 {
        self.std_dev * self.std_dev
    }
}

/// Settled fan reading after one commanded duty level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStep {
    pub duty: u8,
    pub rpm: u32,
    /// Time from the duty command to the first RPM change beyond the noise band
    pub latency_ms: Option<u32>,
}

/// Everything observed for one (PWM, fan) pair during a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseTrace {
    pub baseline: BaselineStats,
    /// RPM change that counts as a response rather than noise
    pub noise_band: f32,
    /// Probe steps, starting with the park point
    pub probe: Vec<ResponseStep>,
    pub validation: Vec<ResponseStep>,
}

impl ResponseTrace {
    /// Largest RPM swing across the probe steps
    pub fn rpm_delta(&self) -> u32 {
        let max = self.probe.iter().map(|s| s.rpm).max().unwrap_or(0);
        let min = self.probe.iter().map(|s| s.rpm).min().unwrap_or(0);
        max - min
    }

    pub fn is_significant(&self) -> bool {
        self.rpm_delta() as f32 > self.noise_band
    }
}

/// Individual components alongside the combined confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub confidence: f32,
    pub repeatability: f32,
    pub magnitude: f32,
    pub monotonicity: f32,
}

/// What a consumer may do with a mapping of a given confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acceptance {
    AutoAccept,
    AcceptWithWarning,
    RequiresConfirmation,
    Refuse,
}

impl Acceptance {
    pub fn classify(confidence: f32) -> Self {
        if confidence > confidence::AUTO_ACCEPT {
            Self::AutoAccept
        } else if confidence > confidence::ACCEPT_WITH_WARNING {
            Self::AcceptWithWarning
        } else if confidence > confidence::REQUIRES_CONFIRMATION {
            Self::RequiresConfirmation
        } else {
            Self::Refuse
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ScorerConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn score(&self, trace: &ResponseTrace) -> Score {
        let repeatability = repeatability(trace);
        let magnitude = self.magnitude(trace);
        let monotonicity = monotonicity(trace);

        let c = &self.config;
        let total_weight = c.repeatability_weight + c.magnitude_weight + c.monotonicity_weight;
        let mut confidence = if total_weight > 0.0 {
            (c.repeatability_weight * repeatability
                + c.magnitude_weight * magnitude
                + c.monotonicity_weight * monotonicity)
                / total_weight
        } else {
            0.0
        };

        if !confidence.is_finite() {
            confidence = 0.0;
        }
        confidence = confidence.clamp(0.0, 1.0);
        if !trace.is_significant() {
            confidence = confidence.min(confidence::INSIGNIFICANT_CAP);
        }

        Score {
            confidence,
            repeatability,
            magnitude,
            monotonicity,
        }
    }

    fn magnitude(&self, trace: &ResponseTrace) -> f32 {
        let c = &self.config;
        let delta = trace.rpm_delta() as f32;
        let snr = delta / trace.baseline.std_dev.max(c.noise_floor_rpm);
        let value = (snr / c.snr_saturation).min(1.0) * (delta / c.delta_saturation_rpm).min(1.0);
        finite_unit(value)
    }
}

fn repeatability(trace: &ResponseTrace) -> f32 {
    if trace.validation.is_empty() {
        return 0.0;
    }
    let range = (trace.rpm_delta() as f32).max(1.0);

    let deviations: Vec<f32> = trace
        .validation
        .iter()
        .filter_map(|v| {
            // Later probe steps at the same duty were reached the same way
            trace
                .probe
                .iter()
                .rev()
                .find(|p| p.duty == v.duty)
                .map(|p| (v.rpm as f32 - p.rpm as f32).abs() / range)
        })
        .collect();

    if deviations.is_empty() {
        return 0.0;
    }
    let mean = deviations.iter().sum::<f32>() / deviations.len() as f32;
    finite_unit(1.0 - mean)
}

fn monotonicity(trace: &ResponseTrace) -> f32 {
    let steps: Vec<f32> = trace
        .probe
        .windows(2)
        .filter(|w| w[0].duty != w[1].duty)
        .map(|w| {
            let duty_up = w[1].duty > w[0].duty;
            let rpm_diff = w[1].rpm as f32 - w[0].rpm as f32;
            if rpm_diff.abs() <= trace.noise_band {
                0.0
            } else if (rpm_diff > 0.0) == duty_up {
                1.0
            } else {
                -1.0
            }
        })
        .collect();

    if steps.is_empty() {
        return 0.0;
    }
    finite_unit(steps.iter().sum::<f32>() / steps.len() as f32)
}

fn finite_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
