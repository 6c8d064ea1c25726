//! Fan Control Loop
//!
//! Fixed-period control of every managed fan. Each tick, per fan:
//!
//! 1. Read the temperature sources (and the tachometer, when known) under the
//!    retry budget and run each through its curve's EMA filter
//! 2. Evaluate the curves and mix them into one duty percentage
//! 3. Apply start/stop hysteresis, then the step-up/step-down rate limits
//! 4. Write the duty, skipping the write when nothing changed
//!
//! # Safety
//! - Every channel is captured by the loop's [`SafetyGuard`] before it is
//!   first switched to manual, and restored when it leaves the profile, is
//!   suspended for a probe, or the loop shuts down
//! - A fan whose reads exhaust the retry budget runs at full duty until its
//!   sources read again
//! - A write that fails twice in one tick latches the fan at full duty for
//!   the rest of the session
//! - A write the kernel refuses for lack of privilege is not retried: the
//!   fan goes back to firmware and [`ControlLoop::run`] ends with the error
//!
//! The profile is read-mostly: it is swapped as a whole and each tick works
//! against the one `Arc` it cloned at the start.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::constants::{curve as curve_consts, probe, pwm};
use crate::data::{timestamp_ms, Millidegrees};
use crate::engine::curve::{Curve, MixMode};
use crate::error::{FanbindError, Result};
use crate::hw::{Actuator, HardwareFingerprint, SensorIo};
use crate::safety::{ChannelRestore, RestoreReport, SafetyGuard};

/// One temperature input feeding a fan, with its curve
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedSource {
    pub fingerprint: HardwareFingerprint,
    pub input: PathBuf,
    pub curve: Curve,
}

/// Start/stop thresholds for fans allowed to rest
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StartStop {
    /// Curve output (%) at which a resting fan starts
    pub start_duty: f32,
    /// Lowest duty (%) while spinning
    pub stop_duty: f32,
    /// Temperature (°C) below which a spinning fan returns to rest
    pub stop_temp: f32,
    /// Duty (%) while resting
    pub idle_duty: f32,
}

/// How a fan's duty may move between ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FanPolicy {
    /// Largest increase in % per tick, 0 for unlimited
    #[serde(default)]
    pub step_up: f32,
    /// Largest decrease in % per tick, 0 for unlimited
    #[serde(default)]
    pub step_down: f32,
    #[serde(default)]
    pub start_stop: Option<StartStop>,
}

/// A fan under curve control, fully resolved to hardware paths
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedFan {
    pub pwm: HardwareFingerprint,
    pub actuator: Actuator,
    pub fan_input: Option<PathBuf>,
    pub sources: Vec<ManagedSource>,
    pub mix: MixMode,
    pub policy: FanPolicy,
}

/// Immutable set of fans the loop drives
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlProfile {
    pub fans: Vec<ManagedFan>,
}

impl ControlProfile {
    pub fn fan(&self, pwm: &HardwareFingerprint) -> Option<&ManagedFan> {
        self.fans.iter().find(|f| &f.pwm == pwm)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    #[default]
    Resting,
    Spinning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fallback {
    #[default]
    None,
    /// Sources unreadable; cleared once they read again
    ReadFailure,
    /// Duty could not be written; held for the rest of the session
    WriteFailure,
    /// The kernel refused the write; the fan is back under firmware control
    Denied,
}

/// Per-fan runtime state
#[derive(Debug, Clone, PartialEq)]
pub struct FanState {
    pub fan: ManagedFan,
    /// Last raw duty the hardware accepted
    pub last_duty: Option<u8>,
    /// Last commanded percentage, the base for rate limiting
    pub last_percent: Option<f32>,
    /// EMA-filtered temperature per source
    pub filtered: BTreeMap<HardwareFingerprint, f32>,
    pub regime: Regime,
    pub fallback: Fallback,
    pub suspended: bool,
}

impl FanState {
    fn new(fan: ManagedFan) -> Self {
        Self {
            fan,
            last_duty: None,
            last_percent: None,
            filtered: BTreeMap::new(),
            regime: Regime::default(),
            fallback: Fallback::default(),
            suspended: false,
        }
    }

    /// Forget what was commanded so the next tick writes again
    fn release(&mut self) {
        self.last_duty = None;
        self.last_percent = None;
        self.filtered.clear();
        self.regime = Regime::default();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlLoopState {
    pub fans: BTreeMap<HardwareFingerprint, FanState>,
}

impl ControlLoopState {
    /// Reconcile with a profile, returning the fans that left it
    ///
    /// Unchanged fans keep their state. Changed fans keep their commanded
    /// duty and the filters of sources they still use.
    pub fn apply(&mut self, profile: &ControlProfile) -> Vec<ManagedFan> {
        let wanted: BTreeSet<&HardwareFingerprint> = profile.fans.iter().map(|f| &f.pwm).collect();
        let dropped_keys: Vec<HardwareFingerprint> = self
            .fans
            .keys()
            .filter(|k| !wanted.contains(k))
            .cloned()
            .collect();
        let dropped = dropped_keys
            .into_iter()
            .filter_map(|k| self.fans.remove(&k))
            .map(|s| s.fan)
            .collect();

        for fan in &profile.fans {
            match self.fans.get_mut(&fan.pwm) {
                Some(state) if &state.fan == fan => {}
                Some(state) => {
                    state
                        .filtered
                        .retain(|fp, _| fan.sources.iter().any(|s| &s.fingerprint == fp));
                    state.fan = fan.clone();
                }
                None => {
                    self.fans.insert(fan.pwm.clone(), FanState::new(fan.clone()));
                }
            }
        }
        dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanStatus {
    Curve,
    Resting,
    Override,
    Suspended,
    ReadFallback,
    WriteFallback,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanReadout {
    pub pwm: HardwareFingerprint,
    pub duty: Option<u8>,
    /// Hottest filtered source temperature
    pub temperature_c: Option<f32>,
    pub rpm: Option<u32>,
    pub status: FanStatus,
}

/// What the loop saw and did on its last tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingsSnapshot {
    pub taken_at_ms: u64,
    pub fans: Vec<FanReadout>,
}

#[derive(Clone, Copy, Debug)]
struct PwmOverride {
    duty: u8,
    expires_at: Instant,
}

/// State shared between the control loop and whoever commands it
pub struct ControlShared {
    guard: SafetyGuard,
    profile: RwLock<Arc<ControlProfile>>,
    suspended: Mutex<BTreeSet<HardwareFingerprint>>,
    overrides: Mutex<BTreeMap<HardwareFingerprint, PwmOverride>>,
    readings: RwLock<Arc<ReadingsSnapshot>>,
    /// Held for a whole tick, and by anyone handing channels over
    lease: tokio::sync::Mutex<()>,
    reload: Notify,
}

impl ControlShared {
    pub fn new(io: Arc<dyn SensorIo>, io_timeout: Duration, read_retry_budget: u32) -> Self {
        Self {
            guard: SafetyGuard::new(io, io_timeout, read_retry_budget),
            profile: RwLock::new(Arc::new(ControlProfile::default())),
            suspended: Mutex::new(BTreeSet::new()),
            overrides: Mutex::new(BTreeMap::new()),
            readings: RwLock::new(Arc::new(ReadingsSnapshot::default())),
            lease: tokio::sync::Mutex::new(()),
            reload: Notify::new(),
        }
    }

    pub fn guard(&self) -> &SafetyGuard {
        &self.guard
    }

    pub fn lease(&self) -> &tokio::sync::Mutex<()> {
        &self.lease
    }

    pub fn profile(&self) -> Arc<ControlProfile> {
        Arc::clone(&self.profile.read())
    }

    /// Replace the profile and wake the loop
    pub fn swap_profile(&self, profile: ControlProfile) {
        *self.profile.write() = Arc::new(profile);
        self.reload.notify_one();
    }

    pub fn readings(&self) -> Arc<ReadingsSnapshot> {
        Arc::clone(&self.readings.read())
    }

    pub fn is_suspended(&self, pwm: &HardwareFingerprint) -> bool {
        self.suspended.lock().contains(pwm)
    }

    /// Take channels away from the loop, restoring their baseline
    ///
    /// Waits for any running tick to finish first. Returns the restore results
    /// of channels the loop was driving.
    pub async fn suspend(&self, pwms: &[HardwareFingerprint]) -> Vec<ChannelRestore> {
        let _lease = self.lease.lock().await;
        self.suspended.lock().extend(pwms.iter().cloned());

        let profile = self.profile();
        let mut restored = Vec::new();
        for pwm in pwms {
            let Some(fan) = profile.fan(pwm) else {
                continue;
            };
            if let Some(r) = self.guard.restore(fan.actuator.pwm_path()).await {
                restored.push(r);
            }
        }
        info!(channels = pwms.len(), "CONTROL: Suspended channels for probing");
        restored
    }

    /// Hand channels back to the loop
    pub fn resume(&self, pwms: &[HardwareFingerprint]) {
        {
            let mut suspended = self.suspended.lock();
            for pwm in pwms {
                suspended.remove(pwm);
            }
        }
        info!(channels = pwms.len(), "CONTROL: Resumed suspended channels");
        self.reload.notify_one();
    }

    /// Temporary fixed duty that bypasses the curve until it expires
    pub fn set_override(&self, pwm: HardwareFingerprint, duty: u8, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        debug!(pwm = %pwm, duty, ttl_ms = ttl.as_millis() as u64, "CONTROL: PWM override set");
        self.overrides.lock().insert(pwm, PwmOverride { duty, expires_at });
        self.reload.notify_one();
    }

    pub fn clear_override(&self, pwm: &HardwareFingerprint) -> bool {
        let removed = self.overrides.lock().remove(pwm).is_some();
        if removed {
            self.reload.notify_one();
        }
        removed
    }

    /// Unexpired overrides; expired ones are pruned
    fn active_overrides(&self) -> BTreeMap<HardwareFingerprint, u8> {
        let now = Instant::now();
        let mut overrides = self.overrides.lock();
        overrides.retain(|_, ov| ov.expires_at > now);
        overrides.iter().map(|(fp, ov)| (fp.clone(), ov.duty)).collect()
    }
}

pub struct ControlLoop {
    shared: Arc<ControlShared>,
    config: ControlConfig,
    state: ControlLoopState,
}

impl ControlLoop {
    pub fn new(shared: Arc<ControlShared>, config: ControlConfig) -> Self {
        Self {
            shared,
            config,
            state: ControlLoopState::default(),
        }
    }

    pub fn state(&self) -> &ControlLoopState {
        &self.state
    }

    /// One control iteration over every managed fan
    pub async fn tick(&mut self) -> Arc<ReadingsSnapshot> {
        let _lease = self.shared.lease.lock().await;
        let profile = self.shared.profile();

        for fan in self.state.apply(&profile) {
            if let Some(r) = self.shared.guard.restore(fan.actuator.pwm_path()).await {
                debug!(pwm = %fan.pwm, outcome = ?r.outcome, "CONTROL: Released fan removed from profile");
            }
        }

        for state in self.state.fans.values_mut() {
            let suspended = self.shared.is_suspended(&state.fan.pwm);
            if suspended != state.suspended {
                state.suspended = suspended;
                state.release();
            }
        }

        let overrides = self.shared.active_overrides();
        let guard = &self.shared.guard;
        let readouts = join_all(self.state.fans.values_mut().map(|state| {
            let duty_override = overrides.get(&state.fan.pwm).copied();
            control_fan(guard, state, duty_override)
        }))
        .await;

        let snapshot = Arc::new(ReadingsSnapshot {
            taken_at_ms: timestamp_ms(),
            fans: readouts,
        });
        *self.shared.readings.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// First fan whose writes were refused for lack of privilege
    fn denied(&self) -> Option<&ManagedFan> {
        self.state
            .fans
            .values()
            .find(|s| s.fallback == Fallback::Denied)
            .map(|s| &s.fan)
    }

    /// Tick until shutdown, then restore every captured channel
    ///
    /// Ends early with [`FanbindError::InsufficientPrivilege`] once a PWM
    /// write is refused; every channel is restored before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<RestoreReport> {
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            period_ms = self.config.period_ms,
            fans = self.shared.profile().fans.len(),
            "CONTROL: Fan control loop starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shared.reload.notified() => {
                    debug!("CONTROL: Woken by profile change");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            self.tick().await;
            if self.denied().is_some() {
                break;
            }
        }

        let denied = self.denied().map(|fan| FanbindError::InsufficientPrivilege {
            path: fan.actuator.pwm_path().to_path_buf(),
            reason: "PWM write refused, fan control needs CAP_SYS_ADMIN or root".into(),
        });

        let _lease = self.shared.lease.lock().await;
        let report = self.shared.guard.restore_all().await;
        info!(
            channels = report.channels.len(),
            clean = report.is_clean(),
            "CONTROL: Fan control loop stopped"
        );
        match denied {
            Some(e) => {
                error!(error = %e, "CONTROL: Stopping, PWM writes are not permitted");
                Err(e)
            }
            None => Ok(report),
        }
    }
}

async fn control_fan(
    guard: &SafetyGuard,
    state: &mut FanState,
    duty_override: Option<u8>,
) -> FanReadout {
    let mut readout = FanReadout {
        pwm: state.fan.pwm.clone(),
        duty: state.last_duty,
        temperature_c: None,
        rpm: None,
        status: FanStatus::Curve,
    };

    if state.suspended {
        readout.status = FanStatus::Suspended;
        return readout;
    }
    if state.fallback == Fallback::Denied {
        readout.duty = None;
        readout.status = FanStatus::Denied;
        return readout;
    }
    if state.fallback == Fallback::WriteFailure {
        if state.last_duty != Some(pwm::MAX_VALUE) {
            let result = force_full(guard, &state.fan).await;
            settle_full(guard, state, result).await;
        }
        readout.duty = state.last_duty;
        if state.fallback == Fallback::Denied {
            readout.status = FanStatus::Denied;
            return readout;
        }
        readout.status = FanStatus::WriteFallback;
        return readout;
    }

    let readings = match read_sources(guard, &state.fan).await {
        Ok(readings) => readings,
        Err(e) => {
            if state.fallback != Fallback::ReadFailure {
                warn!(pwm = %state.fan.pwm, error = %e, "SAFETY: Sensor unreadable, forcing fan to full duty");
            }
            state.fallback = Fallback::ReadFailure;
            state.last_percent = Some(curve_consts::FALLBACK_FAN_PERCENT);
            if state.last_duty != Some(pwm::MAX_VALUE) {
                let result = force_full(guard, &state.fan).await;
                settle_full(guard, state, result).await;
            }
            readout.duty = state.last_duty;
            readout.status = match state.fallback {
                Fallback::Denied => FanStatus::Denied,
                _ => FanStatus::ReadFallback,
            };
            return readout;
        }
    };
    if state.fallback == Fallback::ReadFailure {
        info!(pwm = %state.fan.pwm, "CONTROL: Sensors readable again, resuming curve control");
        state.fallback = Fallback::None;
    }
    readout.rpm = readings.rpm;

    // Nothing commanded yet: a fan firmware left spinning starts out spinning
    let uncommanded = state.last_duty.is_none() && state.last_percent.is_none();
    if uncommanded && state.fan.policy.start_stop.is_some() {
        if let Some(rpm) = readings.rpm {
            state.regime = if rpm > probe::STALL_RPM {
                Regime::Spinning
            } else {
                Regime::Resting
            };
        }
    }

    let percent = match duty_override {
        Some(duty) => {
            readout.status = FanStatus::Override;
            pwm::to_percent(duty)
        }
        None => {
            let (percent, hottest) = evaluate(state, &readings.temps);
            readout.temperature_c = hottest;
            if state.regime == Regime::Resting && state.fan.policy.start_stop.is_some() {
                readout.status = FanStatus::Resting;
            }
            percent
        }
    };
    state.last_percent = Some(percent);

    let duty = match duty_override {
        Some(duty) => state.fan.actuator.clamp_duty(duty),
        None => state.fan.actuator.clamp_duty(pwm::from_percent(percent)),
    };
    if state.last_duty == Some(duty) && guard.is_captured(state.fan.actuator.pwm_path()) {
        readout.duty = state.last_duty;
        return readout;
    }

    match write_with_retry(guard, &state.fan, duty).await {
        Ok(written) => {
            debug!(pwm = %state.fan.pwm, duty = written, percent = format!("{:.1}", percent), "ACTION: Set PWM");
            state.last_duty = Some(written);
        }
        Err(e) if is_denied(&e) => {
            deny(guard, state, &e).await;
            readout.status = FanStatus::Denied;
        }
        Err(e) => {
            error!(pwm = %state.fan.pwm, error = %e, "SAFETY: PWM write failed twice, latching full duty");
            state.fallback = Fallback::WriteFailure;
            let result = force_full(guard, &state.fan).await;
            settle_full(guard, state, result).await;
            readout.status = match state.fallback {
                Fallback::Denied => FanStatus::Denied,
                _ => FanStatus::WriteFallback,
            };
        }
    }
    readout.duty = state.last_duty;
    readout
}

fn is_denied(e: &FanbindError) -> bool {
    matches!(e, FanbindError::InsufficientPrivilege { .. })
}

/// Stop driving a fan the kernel will not let us write, handing it to firmware
async fn deny(guard: &SafetyGuard, state: &mut FanState, e: &FanbindError) {
    error!(pwm = %state.fan.pwm, error = %e, "SAFETY: PWM write not permitted, returning fan to firmware");
    state.fallback = Fallback::Denied;
    state.last_duty = None;
    if let Some(r) = guard.restore(state.fan.actuator.pwm_path()).await {
        debug!(pwm = %state.fan.pwm, outcome = ?r.outcome, "SAFETY: Released refused channel");
    }
}

/// Record the outcome of forcing a fan to full duty
async fn settle_full(guard: &SafetyGuard, state: &mut FanState, result: Result<()>) {
    match result {
        Ok(()) => state.last_duty = Some(pwm::MAX_VALUE),
        Err(e) if is_denied(&e) => deny(guard, state, &e).await,
        Err(_) => state.last_duty = None,
    }
}

struct SourceReadings {
    temps: Vec<(HardwareFingerprint, f32)>,
    rpm: Option<u32>,
}

async fn read_sources(guard: &SafetyGuard, fan: &ManagedFan) -> Result<SourceReadings> {
    let mut temps = Vec::with_capacity(fan.sources.len());
    for source in &fan.sources {
        let raw = guard.read_with_budget(&source.input).await?;
        let value = Millidegrees(raw.clamp(i32::MIN as i64, i32::MAX as i64) as i32);
        if !value.is_plausible() {
            return Err(FanbindError::unreadable(
                &source.input,
                format!("implausible temperature {}", value),
            ));
        }
        temps.push((source.fingerprint.clone(), value.celsius()));
    }
    let rpm = match &fan.fan_input {
        Some(input) => Some(guard.read_with_budget(input).await?.clamp(0, u32::MAX as i64) as u32),
        None => None,
    };
    Ok(SourceReadings { temps, rpm })
}

/// Filter, evaluate and shape the duty; returns the percentage and hottest source
fn evaluate(state: &mut FanState, temps: &[(HardwareFingerprint, f32)]) -> (f32, Option<f32>) {
    let mut outputs = Vec::with_capacity(temps.len());
    let mut hottest: Option<f32> = None;
    for (source, (fp, temp)) in state.fan.sources.iter().zip(temps) {
        let alpha = source.curve.ema_alpha();
        let filtered = match state.filtered.get(fp) {
            Some(previous) => previous + alpha * (temp - previous),
            None => *temp,
        };
        state.filtered.insert(fp.clone(), filtered);
        hottest = Some(hottest.map_or(filtered, |h| h.max(filtered)));
        outputs.push(source.curve.evaluate(filtered));
    }

    let mut percent = state
        .fan
        .mix
        .mix(&outputs)
        .unwrap_or(curve_consts::FALLBACK_FAN_PERCENT);
    if let (Some(ss), Some(temp)) = (state.fan.policy.start_stop, hottest) {
        percent = apply_start_stop(&mut state.regime, percent, temp, &ss);
    }
    (rate_limit(state.last_percent, percent, &state.fan.policy), hottest)
}

/// Start/stop hysteresis
///
/// A resting fan starts once the curve asks for `start_duty`. A spinning fan
/// never drops below `stop_duty` and only rests again once the temperature is
/// below `stop_temp` and the curve no longer asks for `start_duty`, so the
/// two transitions can never both hold at one temperature.
pub fn apply_start_stop(regime: &mut Regime, percent: f32, temp_c: f32, ss: &StartStop) -> f32 {
    match *regime {
        Regime::Resting if percent >= ss.start_duty => {
            *regime = Regime::Spinning;
            percent
        }
        Regime::Resting => ss.idle_duty,
        Regime::Spinning if temp_c < ss.stop_temp && percent < ss.start_duty => {
            *regime = Regime::Resting;
            ss.idle_duty
        }
        Regime::Spinning => percent.max(ss.stop_duty),
    }
}

/// Limit how far the duty moves from the previous command in one tick
pub fn rate_limit(previous: Option<f32>, target: f32, policy: &FanPolicy) -> f32 {
    let Some(previous) = previous else {
        return target;
    };
    if target > previous && policy.step_up > 0.0 {
        target.min(previous + policy.step_up)
    } else if target < previous && policy.step_down > 0.0 {
        target.max(previous - policy.step_down)
    } else {
        target
    }
}

/// Write a duty, retrying once; captures and switches to manual first
async fn write_with_retry(guard: &SafetyGuard, fan: &ManagedFan, duty: u8) -> Result<u8> {
    if !guard.is_captured(fan.actuator.pwm_path()) {
        guard.take_manual(&fan.actuator).await?;
        info!(pwm = %fan.pwm, "ACTION: Took manual control");
    }
    match guard.write_duty(&fan.actuator, duty).await {
        Ok(written) => Ok(written),
        Err(e) if is_denied(&e) => Err(e),
        Err(e) => {
            warn!(pwm = %fan.pwm, error = %e, "CONTROL: PWM write failed, retrying once");
            guard.write_duty(&fan.actuator, duty).await
        }
    }
}

/// Drive a fan to full duty, capturing it first when possible
async fn force_full(guard: &SafetyGuard, fan: &ManagedFan) -> Result<()> {
    if !guard.is_captured(fan.actuator.pwm_path()) {
        if let Err(e) = guard.capture(&fan.actuator).await {
            warn!(pwm = %fan.pwm, error = %e, "SAFETY: Could not capture channel before forcing full duty");
        }
    }
    match guard.force_full(&fan.actuator).await {
        Ok(()) => {
            info!(pwm = %fan.pwm, "ACTION: Forced full duty");
            Ok(())
        }
        Err(e) => {
            error!(pwm = %fan.pwm, error = %e, "SAFETY: Could not force full duty");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CurvePoint;
    use crate::test_utils::{Failure, SimRig};

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

    fn managed_fan(rig: &SimRig, index: u32, sources: &[u32]) -> ManagedFan {
        let inventory = rig.inventory();
        let (pwm, channel) = inventory
            .pwms()
            .find(|(fp, _)| fp.channel_index == index)
            .unwrap();
        let sources = sources
            .iter()
            .map(|&s| {
                let (fp, temp) = inventory
                    .temperatures()
                    .find(|(fp, _)| fp.channel_index == s)
                    .unwrap();
                ManagedSource {
                    fingerprint: fp.clone(),
                    input: temp.input_path.clone(),
                    curve: test_curve(),
                }
            })
            .collect();
        ManagedFan {
            pwm: pwm.clone(),
            actuator: channel.actuator.clone(),
            fan_input: Some(SimRig::path(&format!("fan{}_input", index))),
            sources,
            mix: MixMode::Max,
            policy: FanPolicy::default(),
        }
    }

    fn control_loop(rig: &SimRig, fans: Vec<ManagedFan>) -> (Arc<ControlShared>, ControlLoop) {
        let shared = Arc::new(ControlShared::new(rig.dyn_io(), Duration::from_millis(200), 3));
        shared.swap_profile(ControlProfile { fans });
        let control = ControlLoop::new(Arc::clone(&shared), ControlConfig::default());
        (shared, control)
    }

    #[tokio::test]
    async fn test_tick_follows_curve_and_skips_unchanged_writes() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);

        let readings = control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(1));
        assert_eq!(readings.fans[0].status, FanStatus::Curve);
        assert_eq!(readings.fans[0].temperature_c, Some(45.0));
        assert_eq!(readings.fans[0].duty, Some(102));
        assert!(readings.fans[0].rpm.is_some());

        control.tick().await;
        control.tick().await;
        assert_eq!(rig.io.writes_to(SimRig::path("pwm1")), vec![102]);
    }

    #[tokio::test]
    async fn test_mixed_sources_take_the_max() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        rig.io.set(SimRig::path("temp2_input"), 60_000);
        let (_shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1, 2])]);

        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(128));
    }

    #[tokio::test]
    async fn test_unreadable_source_forces_full_until_readable() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);

        rig.io.fail_reads(SimRig::path("temp1_input"), Failure::Always);
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::ReadFallback);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(255));

        rig.io.clear_failures(SimRig::path("temp1_input"));
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Curve);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
    }

    #[tokio::test]
    async fn test_transient_read_failure_within_budget() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);

        rig.io.fail_reads(SimRig::path("temp1_input"), Failure::Times(2));
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Curve);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
    }

    #[tokio::test]
    async fn test_write_failure_retried_once_then_latched() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);

        rig.io.fail_writes(SimRig::path("pwm1"), Failure::Times(1));
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));

        rig.io.set(SimRig::path("temp1_input"), 60_000);
        rig.io.fail_writes(SimRig::path("pwm1"), Failure::Times(2));
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::WriteFallback);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(255));

        // Latched: the curve no longer drives the fan
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let writes = rig.io.writes_to(SimRig::path("pwm1")).len();
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::WriteFallback);
        assert_eq!(rig.io.writes_to(SimRig::path("pwm1")).len(), writes);
        assert_eq!(control.state().fans.values().next().unwrap().fallback, Fallback::WriteFailure);
    }

    #[tokio::test]
    async fn test_failing_fan_does_not_stop_others() {
        let rig = SimRig::new(2, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, mut control) = control_loop(
            &rig,
            vec![managed_fan(&rig, 1, &[1]), managed_fan(&rig, 2, &[1])],
        );

        rig.io.fail_reads(SimRig::path("fan1_input"), Failure::Always);
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(255));
        assert_eq!(rig.io.get(SimRig::path("pwm2")), Some(102));
    }

    #[tokio::test]
    async fn test_override_bypasses_curve_until_expiry() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let fan = managed_fan(&rig, 1, &[1]);
        let pwm = fan.pwm.clone();
        let (shared, mut control) = control_loop(&rig, vec![fan]);

        shared.set_override(pwm.clone(), 200, Duration::from_millis(50));
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Override);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(200));

        tokio::time::sleep(Duration::from_millis(80)).await;
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
        assert!(!shared.clear_override(&pwm));
    }

    #[tokio::test]
    async fn test_suspend_releases_channel_and_resume_retakes_it() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let fan = managed_fan(&rig, 1, &[1]);
        let pwm = fan.pwm.clone();
        let (shared, mut control) = control_loop(&rig, vec![fan]);
        control.tick().await;

        let restored = shared.suspend(std::slice::from_ref(&pwm)).await;
        assert_eq!(restored.len(), 1);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(120));
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));

        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Suspended);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(120));

        shared.resume(&[pwm]);
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(1));
    }

    #[tokio::test]
    async fn test_fan_removed_from_profile_is_restored() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);
        control.tick().await;

        shared.swap_profile(ControlProfile::default());
        let readings = control.tick().await;
        assert!(readings.fans.is_empty());
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(120));
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));
    }

    #[tokio::test]
    async fn test_run_restores_on_shutdown() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (shared, control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);
        let (tx, rx) = watch::channel(false);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(shared.readings().fans.len(), 1);
            tx.send(true).unwrap();
        };
        let (report, ()) = tokio::join!(control.run(rx), stop);

        let report = report.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.channels.len(), 1);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(120));
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));
    }

    #[tokio::test]
    async fn test_refused_write_hands_fan_back_without_retrying() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, mut control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);
        rig.io.deny_writes(SimRig::path("pwm1"));

        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Denied);
        // One refused duty write, one refused restore of the prior duty
        assert_eq!(rig.io.attempts(SimRig::path("pwm1")), 2);
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));

        rig.io.set(SimRig::path("temp1_input"), 70_000);
        control.tick().await;
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Denied);
        assert_eq!(rig.io.attempts(SimRig::path("pwm1")), 2);
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));
    }

    #[tokio::test]
    async fn test_run_ends_with_privilege_error() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let (_shared, control) = control_loop(&rig, vec![managed_fan(&rig, 1, &[1])]);
        rig.io.deny_writes(SimRig::path("pwm1"));
        let (_tx, rx) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(5), control.run(rx))
            .await
            .unwrap();
        match result {
            Err(FanbindError::InsufficientPrivilege { path, .. }) => {
                assert_eq!(path, SimRig::path("pwm1"));
            }
            other => panic!("expected a privilege error, got {:?}", other),
        }
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));
    }

    #[tokio::test]
    async fn test_start_stop_holds_steady_at_constant_temperature() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 55_000);
        let mut fan = managed_fan(&rig, 1, &[1]);
        // The curve is past start_duty well below stop_temp
        fan.policy.start_stop = Some(StartStop {
            start_duty: 40.0,
            stop_duty: 30.0,
            stop_temp: 60.0,
            idle_duty: 0.0,
        });
        let (_shared, mut control) = control_loop(&rig, vec![fan]);

        for _ in 0..6 {
            control.tick().await;
        }
        assert_eq!(rig.io.writes_to(SimRig::path("pwm1")), vec![119]);
    }

    #[tokio::test]
    async fn test_start_stop_regime_follows_fan_on_first_tick() {
        let policy = FanPolicy {
            start_stop: Some(StartStop {
                start_duty: 40.0,
                stop_duty: 30.0,
                stop_temp: 35.0,
                idle_duty: 0.0,
            }),
            ..FanPolicy::default()
        };

        // Firmware left the fan spinning: no stop on the first tick
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 40_000);
        let mut fan = managed_fan(&rig, 1, &[1]);
        fan.policy = policy;
        let (_shared, mut control) = control_loop(&rig, vec![fan]);
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Curve);
        assert!(rig.io.get(SimRig::path("pwm1")).unwrap() > 0);

        // Already stopped: it stays at rest
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 40_000);
        rig.io.set(SimRig::path("pwm1"), 0);
        let mut fan = managed_fan(&rig, 1, &[1]);
        fan.policy = policy;
        let (_shared, mut control) = control_loop(&rig, vec![fan]);
        let readings = control.tick().await;
        assert_eq!(readings.fans[0].status, FanStatus::Resting);
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(0));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let rig = SimRig::new(2, 0);
        let profile = ControlProfile {
            fans: vec![managed_fan(&rig, 1, &[1]), managed_fan(&rig, 2, &[2])],
        };

        let mut once = ControlLoopState::default();
        assert!(once.apply(&profile).is_empty());
        let mut twice = once.clone();
        assert!(twice.apply(&profile).is_empty());
        assert_eq!(once, twice);

        let dropped = twice.apply(&ControlProfile {
            fans: vec![profile.fans[0].clone()],
        });
        assert_eq!(dropped, vec![profile.fans[1].clone()]);
        assert_eq!(twice.fans.len(), 1);
    }

    #[test]
    fn test_hysteresis_does_not_oscillate_at_start_threshold() {
        let ss = StartStop {
            start_duty: 40.0,
            stop_duty: 30.0,
            stop_temp: 45.0,
            idle_duty: 0.0,
        };
        let mut regime = Regime::Resting;
        assert_eq!(apply_start_stop(&mut regime, 39.0, 52.0, &ss), 0.0);

        // Curve output hovering around the start threshold
        let mut outputs = Vec::new();
        for i in 0..20 {
            let percent = if i % 2 == 0 { 40.0 } else { 39.9 };
            outputs.push(apply_start_stop(&mut regime, percent, 52.0, &ss));
        }
        assert_eq!(regime, Regime::Spinning);
        assert!(outputs.iter().all(|&d| d >= ss.stop_duty));

        assert_eq!(apply_start_stop(&mut regime, 10.0, 46.0, &ss), 30.0);
        // Below stop_temp but the curve still asks for start_duty
        assert_eq!(apply_start_stop(&mut regime, 40.0, 44.0, &ss), 40.0);
        assert_eq!(regime, Regime::Spinning);
        assert_eq!(apply_start_stop(&mut regime, 10.0, 44.0, &ss), 0.0);
        assert_eq!(regime, Regime::Resting);
    }

    #[test]
    fn test_rate_limit() {
        let policy = FanPolicy {
            step_up: 10.0,
            step_down: 5.0,
            start_stop: None,
        };
        assert_eq!(rate_limit(None, 80.0, &policy), 80.0);
        assert_eq!(rate_limit(Some(40.0), 80.0, &policy), 50.0);
        assert_eq!(rate_limit(Some(40.0), 20.0, &policy), 35.0);
        assert_eq!(rate_limit(Some(40.0), 42.0, &policy), 42.0);
        assert_eq!(rate_limit(Some(40.0), 0.0, &FanPolicy::default()), 0.0);
    }
}
