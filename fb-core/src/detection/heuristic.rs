//! Heuristic pairing suggestions
//!
//! Used only when active probing saw no fan respond. Pairs PWM and fan
//! channels of the same chip by index (fan1 -> pwm1), falling back to
//! position when no index matches. Confidence is capped so these
//! suggestions always need explicit confirmation.

use crate::constants::confidence;
use crate::data::{FanMapping, MappingSource};
use crate::hw::{HardwareFingerprint, HardwareInventory};

/// Suggest mappings for the given PWM channels
pub fn suggest(inventory: &HardwareInventory, pwms: &[HardwareFingerprint]) -> Vec<FanMapping> {
    let mut suggestions = Vec::new();
    let mut chips: Vec<&HardwareFingerprint> = Vec::new();
    for pwm in pwms {
        if !chips.iter().any(|c| c.same_chip(pwm)) {
            chips.push(pwm);
        }
    }

    for chip in chips {
        let chip_pwms: Vec<&HardwareFingerprint> =
            pwms.iter().filter(|p| p.same_chip(chip)).collect();
        let chip_fans: Vec<&HardwareFingerprint> = inventory
            .fans()
            .map(|(fp, _)| fp)
            .filter(|fp| fp.same_chip(chip))
            .collect();

        let by_index: Vec<(&HardwareFingerprint, &HardwareFingerprint)> = chip_pwms
            .iter()
            .filter_map(|pwm| {
                chip_fans
                    .iter()
                    .find(|fan| fan.channel_index == pwm.channel_index)
                    .map(|fan| (*pwm, *fan))
            })
            .collect();

        let (pairs, base) = if by_index.is_empty() {
            let by_position: Vec<(&HardwareFingerprint, &HardwareFingerprint)> = chip_pwms
                .iter()
                .zip(chip_fans.iter())
                .map(|(p, f)| (*p, *f))
                .collect();
            (by_position, confidence::HEURISTIC_POSITION_MATCH)
        } else {
            (by_index, confidence::HEURISTIC_INDEX_MATCH)
        };

        for (pwm, fan) in pairs {
            suggestions.push(suggestion(inventory, pwm, fan, base));
        }
    }

    suggestions
}

fn suggestion(
    inventory: &HardwareInventory,
    pwm: &HardwareFingerprint,
    fan: &HardwareFingerprint,
    base: f32,
) -> FanMapping {
    let pwm_label = inventory.resolve_pwm(pwm).ok().and_then(|c| c.label.as_deref());
    let fan_channel = inventory.resolve_fan(fan).ok();
    let fan_label = fan_channel.and_then(|c| c.label.as_deref());

    FanMapping {
        pwm: pwm.clone(),
        fan: fan.clone(),
        confidence: (base + label_bonus(fan_label, pwm_label)).min(confidence::HEURISTIC_CAP),
        response_latency_ms: None,
        min_duty: None,
        max_rpm: fan_channel.map(|c| c.rpm).unwrap_or(0),
        rpm_delta: 0,
        baseline_variance: 0.0,
        temp_sources: Vec::new(),
        source: MappingSource::Heuristic,
    }
}

/// Labels like "CPU Fan" and "CPU PWM" earn a bonus for the common prefix
fn label_bonus(fan_label: Option<&str>, pwm_label: Option<&str>) -> f32 {
    let (Some(fan), Some(pwm)) = (fan_label, pwm_label) else {
        return 0.0;
    };
    let fan = fan.trim().to_ascii_lowercase();
    let pwm = pwm.trim().to_ascii_lowercase();

    let common = fan
        .chars()
        .zip(pwm.chars())
        .take_while(|(a, b)| a == b)
        .count();
    if common >= confidence::HEURISTIC_LABEL_PREFIX {
        confidence::HEURISTIC_LABEL_BONUS
    } else {
        0.0
    }
}
