//! Explicit daemon context
//!
//! Owns everything the command surface needs: configuration, the hardware
//! handles, the state shared with the control loop, the logical profile and
//! the active detection session. Built once at startup; dropping it releases
//! every channel the control loop still holds.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::constants::{limits, timing};
use crate::data::{validate_percentage, FanMapping};
use crate::detection::{
    Acceptance, ConfidenceScorer, ProbeEngine, ProbeEvent, ProbeReport, ProbeTargets,
};
use crate::engine::{
    ControlLoop, ControlProfile, ControlShared, FanCurveSet, FanPolicy, ManagedFan, ManagedSource,
    ReadingsSnapshot,
};
use crate::error::{FanbindError, Result};
use crate::hw::{
    bounded, Enumerator, Fingerprinter, HardwareFingerprint, HardwareInventory, SensorIo, SnapshotSource,
    SysfsIo, SysfsTopology, TopologySource,
};

/// A mapping together with the curves that drive it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub mapping: FanMapping,
    #[serde(default)]
    pub user_confirmed: bool,
    /// Entries without curves are tracked but not controlled
    #[serde(default)]
    pub curves: Option<FanCurveSet>,
    #[serde(default)]
    pub policy: FanPolicy,
}

/// Persistable form of the logical profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub entries: Vec<ProfileEntry>,
}

/// A candidate mapping handed back by the front end
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedMapping {
    pub mapping: FanMapping,
    /// The user explicitly accepted this pairing
    pub user_confirmed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: Vec<HardwareFingerprint>,
    /// Accepted, but below the auto-accept threshold
    pub warnings: Vec<HardwareFingerprint>,
    /// Fans now under curve control
    pub controlled: usize,
    /// Loaded entries whose PWM, fan or temperature sources are missing on
    /// this hardware; kept in the profile but not controlled
    #[serde(default)]
    pub unresolved: Vec<HardwareFingerprint>,
}

/// What to probe; every PWM when `pwms` is `None`
#[derive(Debug, Clone, Default)]
pub struct ProbeRequest {
    pub pwms: Option<Vec<HardwareFingerprint>>,
}

type SessionSlot = Arc<Mutex<Option<Arc<watch::Sender<bool>>>>>;

/// Handle to a running detection session
pub struct ProbeSession {
    events: mpsc::UnboundedReceiver<ProbeEvent>,
    cancel: Arc<watch::Sender<bool>>,
    handle: JoinHandle<Result<ProbeReport>>,
}

impl ProbeSession {
    /// Next progress event; `None` once the session has ended
    pub async fn next_event(&mut self) -> Option<ProbeEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the session to end
    pub async fn finish(self) -> Result<ProbeReport> {
        self.handle
            .await
            .map_err(|e| FanbindError::generic(format!("probe task failed: {}", e)))?
    }
}

/// Hands probed channels back and frees the session slot, even on panic
struct SessionRelease {
    shared: Arc<ControlShared>,
    slot: SessionSlot,
    pwms: Vec<HardwareFingerprint>,
}

impl Drop for SessionRelease {
    fn drop(&mut self) {
        self.shared.resume(&self.pwms);
        *self.slot.lock() = None;
    }
}

pub struct FanbindContext {
    config: EngineConfig,
    io: Arc<dyn SensorIo>,
    hardware: Arc<dyn SnapshotSource>,
    topology: Arc<dyn TopologySource>,
    shared: Arc<ControlShared>,
    profile: Mutex<BTreeMap<HardwareFingerprint, ProfileEntry>>,
    session: SessionSlot,
}

impl FanbindContext {
    pub fn new(
        config: EngineConfig,
        io: Arc<dyn SensorIo>,
        hardware: Arc<dyn SnapshotSource>,
        topology: Arc<dyn TopologySource>,
    ) -> Self {
        let shared = Arc::new(ControlShared::new(
            Arc::clone(&io),
            config.io_timeout(),
            config.control.read_retry_budget,
        ));
        Self {
            config,
            io,
            hardware,
            topology,
            shared,
            profile: Mutex::new(BTreeMap::new()),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Context over the real sysfs tree at `config.hwmon_root`
    pub fn from_config(config: EngineConfig) -> Self {
        let hardware = Arc::new(Enumerator::new(config.hwmon_root.clone()));
        Self::new(config, Arc::new(SysfsIo), hardware, Arc::new(SysfsTopology))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<ControlShared> {
        &self.shared
    }

    /// Fresh enumeration, fingerprinted, off the async workers and bounded
    /// by `enumerate_timeout_ms`
    pub async fn inventory(&self) -> Result<HardwareInventory> {
        let hardware = Arc::clone(&self.hardware);
        let topology = Arc::clone(&self.topology);
        bounded(self.config.enumerate_timeout(), &self.config.hwmon_root, move || {
            let snapshot = hardware.snapshot()?;
            Ok(Fingerprinter::new(&*topology).inventory(&snapshot))
        })
        .await
    }

    /// Control loop bound to this context's shared state
    pub fn control_loop(&self) -> ControlLoop {
        ControlLoop::new(Arc::clone(&self.shared), self.config.control.clone())
    }

    // ========================================================================
    // Detection sessions
    // ========================================================================

    pub fn is_session_active(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Start a detection session
    ///
    /// The probed PWMs are suspended in the control loop, which restores
    /// their baseline first, and handed back when the session ends.
    pub async fn start_auto_detect(&self, request: ProbeRequest) -> Result<ProbeSession> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        {
            let mut slot = self.session.lock();
            if slot.is_some() {
                return Err(FanbindError::SessionBusy);
            }
            *slot = Some(Arc::clone(&cancel_tx));
        }

        let targets = match self
            .inventory()
            .await
            .and_then(|inv| ProbeTargets::from_inventory(&inv, request.pwms.as_deref()))
        {
            Ok(targets) => targets,
            Err(e) => {
                *self.session.lock() = None;
                return Err(e);
            }
        };

        let pwms: Vec<HardwareFingerprint> =
            targets.pwms.iter().map(|p| p.fingerprint.clone()).collect();
        let release = SessionRelease {
            shared: Arc::clone(&self.shared),
            slot: Arc::clone(&self.session),
            pwms: pwms.clone(),
        };
        self.shared.suspend(&pwms).await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut engine = ProbeEngine::new(
            Arc::clone(&self.io),
            self.config.probe.clone(),
            ConfidenceScorer::new(self.config.scorer.clone()),
            self.config.io_timeout(),
        )
        .with_events(events_tx)
        .with_cancel(cancel_rx);

        info!(pwms = pwms.len(), "PROBE: Detection session started");
        let handle = tokio::spawn(async move {
            let _release = release;
            engine.run(targets).await
        });

        Ok(ProbeSession {
            events: events_rx,
            cancel: cancel_tx,
            handle,
        })
    }

    /// Cancel the running session; it restores its baseline before ending
    pub fn abort_session(&self) -> Result<()> {
        match &*self.session.lock() {
            Some(cancel) => {
                let _ = cancel.send(true);
                info!("PROBE: Abort requested");
                Ok(())
            }
            None => Err(FanbindError::generic("no detection session is running")),
        }
    }

    // ========================================================================
    // Mappings and curves
    // ========================================================================

    pub fn current_mappings(&self) -> Vec<FanMapping> {
        self.profile.lock().values().map(|e| e.mapping.clone()).collect()
    }

    pub fn current_readings(&self) -> Arc<ReadingsSnapshot> {
        self.shared.readings()
    }

    /// Snapshot of the logical profile for persistence
    pub fn profile(&self) -> Profile {
        Profile {
            entries: self.profile.lock().values().cloned().collect(),
        }
    }

    /// Accept confirmed mappings into the profile
    ///
    /// Nothing is applied unless every mapping passes the acceptance
    /// thresholds and resolves on the current hardware. A mapping replaces
    /// the entry of the same PWM but keeps its curves.
    pub async fn apply_mappings(&self, confirmed: Vec<ConfirmedMapping>) -> Result<ApplyReport> {
        let entries = confirmed
            .into_iter()
            .map(|c| ProfileEntry {
                mapping: c.mapping,
                user_confirmed: c.user_confirmed,
                curves: None,
                policy: FanPolicy::default(),
            })
            .collect();
        self.merge_entries(entries, false).await
    }

    /// Re-apply persisted entries through the same acceptance path
    ///
    /// Acceptance failures still reject the whole profile. Entries whose
    /// hardware is missing are kept but left uncontrolled and listed in
    /// [`ApplyReport::unresolved`].
    pub async fn load_profile(&self, profile: Profile) -> Result<ApplyReport> {
        self.merge_entries(profile.entries, true).await
    }

    /// Set the curves and policy driving a mapped PWM
    pub async fn set_curve(
        &self,
        pwm: &HardwareFingerprint,
        curves: FanCurveSet,
        policy: FanPolicy,
    ) -> Result<()> {
        curves.validate()?;
        validate_policy(&policy)?;
        validate_hysteresis(&curves, &policy)?;
        let inventory = self.inventory().await?;
        for source in curves.sources() {
            inventory.resolve_temperature(source)?;
        }

        {
            let mut profile = self.profile.lock();
            let entry = profile.get_mut(pwm).ok_or_else(|| {
                FanbindError::HardwareNotFound(format!("no confirmed mapping for {}", pwm))
            })?;
            entry.mapping.temp_sources = curves.sources().cloned().collect();
            entry.curves = Some(curves);
            entry.policy = policy;
        }
        info!(pwm = %pwm, "CONTROL: Curve updated");
        self.publish(&inventory);
        Ok(())
    }

    /// Temporary fixed duty for a controlled PWM
    pub fn set_override(&self, pwm: &HardwareFingerprint, duty: u8, ttl: Option<Duration>) -> Result<()> {
        if self.shared.profile().fan(pwm).is_none() {
            return Err(FanbindError::HardwareNotFound(format!(
                "{} is not under curve control",
                pwm
            )));
        }
        let ttl = ttl
            .unwrap_or_else(|| self.config.control.override_ttl())
            .max(timing::MIN_OVERRIDE_TTL);
        self.shared.set_override(pwm.clone(), duty, ttl);
        Ok(())
    }

    pub fn clear_override(&self, pwm: &HardwareFingerprint) -> bool {
        self.shared.clear_override(pwm)
    }

    async fn merge_entries(
        &self,
        entries: Vec<ProfileEntry>,
        replace_curves: bool,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        for entry in &entries {
            if check_acceptance(&entry.mapping, entry.user_confirmed)? == Acceptance::AcceptWithWarning {
                warn!(
                    pwm = %entry.mapping.pwm,
                    fan = %entry.mapping.fan,
                    confidence = format!("{:.2}", entry.mapping.confidence),
                    "Mapping accepted below the auto-accept threshold"
                );
                report.warnings.push(entry.mapping.pwm.clone());
            }
        }

        for entry in &entries {
            if let Some(curves) = &entry.curves {
                curves.validate()?;
                validate_policy(&entry.policy)?;
                validate_hysteresis(curves, &entry.policy)?;
            }
        }

        let inventory = self.inventory().await?;
        for entry in &entries {
            if let Err(e) = resolve_entry(&inventory, entry) {
                // Hardware may be gone for a while; a loaded profile degrades per entry
                if !replace_curves {
                    return Err(e);
                }
                warn!(
                    pwm = %entry.mapping.pwm,
                    error = %e,
                    "Profile entry not present on this hardware, tracking it uncontrolled"
                );
                report.unresolved.push(entry.mapping.pwm.clone());
            }
        }

        {
            let mut profile = self.profile.lock();
            let mut next = profile.clone();
            for mut entry in entries {
                let pwm = entry.mapping.pwm.clone();
                if let Some(existing) = next.get(&pwm) {
                    if !replace_curves || entry.curves.is_none() {
                        entry.curves = existing.curves.clone();
                        entry.policy = existing.policy;
                        entry.mapping.temp_sources = existing.mapping.temp_sources.clone();
                    }
                }
                next.insert(pwm.clone(), entry);
                report.applied.push(pwm);
            }
            if next.len() > limits::MAX_MAPPINGS {
                return Err(FanbindError::config(
                    "mappings",
                    format!("at most {} mappings are supported", limits::MAX_MAPPINGS),
                ));
            }
            *profile = next;
        }

        report.controlled = self.publish(&inventory);
        info!(
            applied = report.applied.len(),
            warnings = report.warnings.len(),
            controlled = report.controlled,
            unresolved = report.unresolved.len(),
            "Mappings applied"
        );
        Ok(report)
    }

    /// Resolve the logical profile against hardware and swap it in
    fn publish(&self, inventory: &HardwareInventory) -> usize {
        let entries: Vec<ProfileEntry> = self.profile.lock().values().cloned().collect();
        let fans: Vec<ManagedFan> = entries
            .iter()
            .filter_map(|entry| match resolve_fan(inventory, entry) {
                Ok(fan) => fan,
                Err(e) => {
                    warn!(pwm = %entry.mapping.pwm, error = %e, "Mapping not controllable on this hardware");
                    None
                }
            })
            .collect();
        let controlled = fans.len();
        self.shared.swap_profile(ControlProfile { fans });
        debug!(controlled, "CONTROL: Profile swapped");
        controlled
    }
}

/// Map a confidence to its acceptance class, refusing what may not be used
fn check_acceptance(mapping: &FanMapping, user_confirmed: bool) -> Result<Acceptance> {
    if !(0.0..=1.0).contains(&mapping.confidence) {
        return Err(FanbindError::config(
            "mapping.confidence",
            format!("{} for {} is outside 0-1", mapping.confidence, mapping.pwm),
        ));
    }
    let acceptance = Acceptance::classify(mapping.confidence);
    let refusal = match acceptance {
        Acceptance::Refuse => Some("confidence too low for use"),
        Acceptance::RequiresConfirmation if !user_confirmed => {
            Some("pairing must be confirmed by the user")
        }
        _ => None,
    };
    match refusal {
        Some(reason) => Err(FanbindError::AmbiguousPairing {
            pwm: mapping.pwm.to_string(),
            fan: mapping.fan.to_string(),
            confidence: mapping.confidence,
            reason: reason.into(),
        }),
        None => Ok(acceptance),
    }
}

fn validate_policy(policy: &FanPolicy) -> Result<()> {
    for (field, step) in [("policy.step_up", policy.step_up), ("policy.step_down", policy.step_down)] {
        if !step.is_finite() || step < 0.0 {
            return Err(FanbindError::config(field, "must be a non-negative number"));
        }
    }
    if let Some(ss) = &policy.start_stop {
        validate_percentage(ss.start_duty)?;
        validate_percentage(ss.stop_duty)?;
        validate_percentage(ss.idle_duty)?;
        if ss.stop_duty > ss.start_duty {
            return Err(FanbindError::config(
                "policy.start_stop",
                "stop duty must not exceed start duty",
            ));
        }
        if !ss.stop_temp.is_finite() {
            return Err(FanbindError::config("policy.start_stop.stop_temp", "must be a number"));
        }
    }
    Ok(())
}

/// A resting fan must not be able to start below `stop_temp`, or it would
/// start and rest again at one temperature
fn validate_hysteresis(curves: &FanCurveSet, policy: &FanPolicy) -> Result<()> {
    let Some(ss) = &policy.start_stop else {
        return Ok(());
    };
    for binding in &curves.bindings {
        let peak = binding.curve.peak_below(ss.stop_temp);
        if peak >= ss.start_duty {
            return Err(FanbindError::config(
                "policy.start_stop",
                format!(
                    "curve for {} reaches {:.1}% below the stop temperature {:.1}°C, at or above the start duty {:.1}%",
                    binding.source, peak, ss.stop_temp, ss.start_duty
                ),
            ));
        }
    }
    Ok(())
}

/// Every channel an entry names must exist
fn resolve_entry(inventory: &HardwareInventory, entry: &ProfileEntry) -> Result<()> {
    inventory.resolve_pwm(&entry.mapping.pwm)?;
    inventory.resolve_fan(&entry.mapping.fan)?;
    if let Some(curves) = &entry.curves {
        for source in curves.sources() {
            inventory.resolve_temperature(source)?;
        }
    }
    Ok(())
}

/// Resolve one entry to a managed fan; `None` when it has no curves
fn resolve_fan(inventory: &HardwareInventory, entry: &ProfileEntry) -> Result<Option<ManagedFan>> {
    let Some(curves) = &entry.curves else {
        return Ok(None);
    };
    let pwm = inventory.resolve_pwm(&entry.mapping.pwm)?;
    let fan_input = inventory
        .resolve_fan(&entry.mapping.fan)
        .ok()
        .map(|f| f.input_path.clone());
    let sources = curves
        .bindings
        .iter()
        .map(|b| {
            inventory.resolve_temperature(&b.source).map(|t| ManagedSource {
                fingerprint: b.source.clone(),
                input: t.input_path.clone(),
                curve: b.curve.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(ManagedFan {
        pwm: entry.mapping.pwm.clone(),
        actuator: pwm.actuator.clone(),
        fan_input,
        sources,
        mix: curves.mix,
        policy: entry.policy,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::data::{CurvePoint, MappingSource};
    use crate::data::HardwareSnapshot;
    use crate::engine::{Curve, StartStop};
    use crate::test_utils::{SimRig, StaticSnapshot, StaticTopology};

    fn context(rig: &SimRig) -> FanbindContext {
        let config = EngineConfig {
            io_timeout_ms: 200,
            probe: ProbeConfig {
                hold_ms: 40,
                settle_ms: 20,
                sample_interval_ms: 10,
                baseline_samples: 3,
                ..ProbeConfig::default()
            },
            ..EngineConfig::default()
        };
        FanbindContext::new(
            config,
            rig.dyn_io(),
            Arc::new(StaticSnapshot(rig.snapshot.clone())),
            Arc::new(StaticTopology),
        )
    }

    fn channel(rig: &SimRig, kind: &str, index: u32) -> HardwareFingerprint {
        let inventory = rig.inventory();
        let found = match kind {
            "pwm" => inventory.pwms().map(|(fp, _)| fp.clone()).find(|fp| fp.channel_index == index),
            "fan" => inventory.fans().map(|(fp, _)| fp.clone()).find(|fp| fp.channel_index == index),
            _ => inventory
                .temperatures()
                .map(|(fp, _)| fp.clone())
                .find(|fp| fp.channel_index == index),
        };
        found.unwrap()
    }

    fn mapping(rig: &SimRig, index: u32, confidence: f32) -> FanMapping {
        FanMapping {
            pwm: channel(rig, "pwm", index),
            fan: channel(rig, "fan", index),
            confidence,
            response_latency_ms: Some(400),
            min_duty: Some(64),
            max_rpm: 1800,
            rpm_delta: 1100,
            baseline_variance: 4.0,
            temp_sources: Vec::new(),
            source: MappingSource::Probe,
        }
    }

    fn confirmed(mapping: FanMapping, user_confirmed: bool) -> ConfirmedMapping {
        ConfirmedMapping {
            mapping,
            user_confirmed,
        }
    }

    fn curve_set(rig: &SimRig) -> FanCurveSet {
        let curve = Curve::new(
            vec![
                CurvePoint::new(30.0, 30.0),
                CurvePoint::new(60.0, 50.0),
                CurvePoint::new(80.0, 100.0),
            ],
            0.0,
        )
        .unwrap();
        FanCurveSet::single(channel(rig, "temp", 1), curve)
    }

    #[tokio::test]
    async fn test_acceptance_thresholds_enforced() {
        let rig = SimRig::new(1, 0);
        let ctx = context(&rig);

        let refused = ctx
            .apply_mappings(vec![confirmed(mapping(&rig, 1, 0.30), true)])
            .await;
        assert!(matches!(refused, Err(FanbindError::AmbiguousPairing { .. })));

        let unconfirmed = ctx
            .apply_mappings(vec![confirmed(mapping(&rig, 1, 0.55), false)])
            .await;
        assert!(matches!(unconfirmed, Err(FanbindError::AmbiguousPairing { .. })));
        assert!(ctx.current_mappings().is_empty());

        let report = ctx
            .apply_mappings(vec![confirmed(mapping(&rig, 1, 0.55), true)])
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(report.warnings.is_empty());

        let report = ctx
            .apply_mappings(vec![confirmed(mapping(&rig, 1, 0.80), false)])
            .await
            .unwrap();
        assert_eq!(report.warnings, vec![channel(&rig, "pwm", 1)]);
        assert_eq!(ctx.current_mappings().len(), 1);
    }

    #[tokio::test]
    async fn test_one_refusal_rejects_the_batch() {
        let rig = SimRig::new(2, 0);
        let ctx = context(&rig);
        let result = ctx
            .apply_mappings(vec![
                confirmed(mapping(&rig, 1, 0.95), false),
                confirmed(mapping(&rig, 2, 0.10), true),
            ])
            .await;
        assert!(result.is_err());
        assert!(ctx.current_mappings().is_empty());
    }

    #[tokio::test]
    async fn test_applying_twice_is_idempotent() {
        let rig = SimRig::new(2, 0);
        let ctx = context(&rig);
        let batch = vec![
            confirmed(mapping(&rig, 1, 0.95), false),
            confirmed(mapping(&rig, 2, 0.92), false),
        ];
        ctx.apply_mappings(batch.clone()).await.unwrap();
        ctx.set_curve(&channel(&rig, "pwm", 1), curve_set(&rig), FanPolicy::default())
            .await
            .unwrap();
        let profile_once = ctx.profile();
        let control_once = ctx.shared().profile();

        ctx.apply_mappings(batch).await.unwrap();
        assert_eq!(ctx.profile(), profile_once);
        assert_eq!(*ctx.shared().profile(), *control_once);
        assert_eq!(control_once.fans.len(), 1);
    }

    #[tokio::test]
    async fn test_set_curve_drives_the_loop() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let ctx = context(&rig);
        let pwm = channel(&rig, "pwm", 1);
        ctx.apply_mappings(vec![confirmed(mapping(&rig, 1, 0.95), false)])
            .await
            .unwrap();

        ctx.set_curve(&pwm, curve_set(&rig), FanPolicy::default()).await.unwrap();
        assert_eq!(
            ctx.current_mappings()[0].temp_sources,
            vec![channel(&rig, "temp", 1)]
        );

        let mut control = ctx.control_loop();
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
        assert_eq!(ctx.current_readings().fans.len(), 1);

        ctx.set_override(&pwm, 180, None).unwrap();
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(180));
        assert!(ctx.clear_override(&pwm));
        control.tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));
    }

    #[tokio::test]
    async fn test_set_curve_rejects_unknown_source_and_mapping() {
        let rig = SimRig::new(1, 0);
        let ctx = context(&rig);
        let pwm = channel(&rig, "pwm", 1);

        assert!(matches!(
            ctx.set_curve(&pwm, curve_set(&rig), FanPolicy::default()).await,
            Err(FanbindError::HardwareNotFound(_))
        ));

        ctx.apply_mappings(vec![confirmed(mapping(&rig, 1, 0.95), false)])
            .await
            .unwrap();
        let mut missing = channel(&rig, "temp", 1);
        missing.channel_index = 7;
        let curves = FanCurveSet::single(missing, Curve::default());
        assert!(matches!(
            ctx.set_curve(&pwm, curves, FanPolicy::default()).await,
            Err(FanbindError::HardwareNotFound(_))
        ));
        assert!(ctx.set_override(&pwm, 100, None).is_err());
    }

    #[tokio::test]
    async fn test_profile_survives_persistence() {
        let rig = SimRig::new(2, 0);
        let ctx = context(&rig);
        ctx.apply_mappings(vec![
            confirmed(mapping(&rig, 1, 0.95), false),
            confirmed(mapping(&rig, 2, 0.60), true),
        ])
        .await
        .unwrap();
        ctx.set_curve(&channel(&rig, "pwm", 2), curve_set(&rig), FanPolicy::default())
            .await
            .unwrap();

        let json = serde_json::to_string(&ctx.profile()).unwrap();
        let restored = context(&rig);
        let report = restored
            .load_profile(serde_json::from_str(&json).unwrap())
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.controlled, 1);
        assert_eq!(restored.profile(), ctx.profile());
    }

    #[tokio::test]
    async fn test_confidence_outside_unit_range_rejected() {
        let rig = SimRig::new(1, 0);
        let ctx = context(&rig);
        for confidence in [1.7, f32::INFINITY, f32::NAN, -0.1] {
            let result = ctx
                .apply_mappings(vec![confirmed(mapping(&rig, 1, confidence), true)])
                .await;
            assert!(matches!(result, Err(FanbindError::InvalidConfig { .. })));
        }
        assert!(ctx.current_mappings().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_that_cannot_rest_rejected() {
        let rig = SimRig::new(1, 0);
        let ctx = context(&rig);
        let pwm = channel(&rig, "pwm", 1);
        ctx.apply_mappings(vec![confirmed(mapping(&rig, 1, 0.95), false)])
            .await
            .unwrap();

        // The curve passes 40% at 45°C, well below the 60°C stop temperature
        let mut policy = FanPolicy {
            start_stop: Some(StartStop {
                start_duty: 40.0,
                stop_duty: 30.0,
                stop_temp: 60.0,
                idle_duty: 0.0,
            }),
            ..FanPolicy::default()
        };
        assert!(matches!(
            ctx.set_curve(&pwm, curve_set(&rig), policy).await,
            Err(FanbindError::InvalidConfig { .. })
        ));
        assert!(ctx.shared().profile().fans.is_empty());

        let mut profile = ctx.profile();
        profile.entries[0].curves = Some(curve_set(&rig));
        profile.entries[0].policy = policy;
        assert!(context(&rig).load_profile(profile).await.is_err());

        if let Some(ss) = policy.start_stop.as_mut() {
            ss.stop_temp = 40.0;
        }
        ctx.set_curve(&pwm, curve_set(&rig), policy).await.unwrap();
        assert_eq!(ctx.shared().profile().fans.len(), 1);
    }

    #[tokio::test]
    async fn test_profile_with_missing_hardware_loads_the_rest() {
        let rig = SimRig::new(1, 0);
        let ctx = context(&rig);
        let present = ProfileEntry {
            mapping: mapping(&rig, 1, 0.95),
            user_confirmed: false,
            curves: Some(curve_set(&rig)),
            policy: FanPolicy::default(),
        };
        let mut gone = present.clone();
        gone.mapping.pwm.channel_index = 9;
        gone.mapping.fan.channel_index = 9;

        let report = ctx
            .load_profile(Profile {
                entries: vec![present, gone.clone()],
            })
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.controlled, 1);
        assert_eq!(report.unresolved, vec![gone.mapping.pwm.clone()]);
        assert_eq!(ctx.current_mappings().len(), 2);

        // Interactive applies still insist on present hardware
        let result = ctx
            .apply_mappings(vec![confirmed(gone.mapping, false)])
            .await;
        assert!(matches!(result, Err(FanbindError::HardwareNotFound(_))));
    }

    #[tokio::test]
    async fn test_wedged_enumeration_times_out() {
        struct SlowSnapshot(HardwareSnapshot);

        impl SnapshotSource for SlowSnapshot {
            fn snapshot(&self) -> Result<HardwareSnapshot> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(self.0.clone())
            }
        }

        let rig = SimRig::new(1, 0);
        let mut config = context(&rig).config().clone();
        config.enumerate_timeout_ms = 50;
        let ctx = FanbindContext::new(
            config,
            rig.dyn_io(),
            Arc::new(SlowSnapshot(rig.snapshot.clone())),
            Arc::new(StaticTopology),
        );

        let started = std::time::Instant::now();
        assert!(matches!(ctx.inventory().await, Err(FanbindError::Timeout(_))));
        assert!(matches!(
            ctx.start_auto_detect(ProbeRequest::default()).await,
            Err(FanbindError::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(!ctx.is_session_active());
    }

    #[tokio::test]
    async fn test_detection_session_suspends_and_reports() {
        let rig = SimRig::new(1, 0);
        rig.io.set(SimRig::path("temp1_input"), 45_000);
        let ctx = context(&rig);
        let pwm = channel(&rig, "pwm", 1);
        ctx.apply_mappings(vec![confirmed(mapping(&rig, 1, 0.95), false)])
            .await
            .unwrap();
        ctx.set_curve(&pwm, curve_set(&rig), FanPolicy::default()).await.unwrap();
        ctx.control_loop().tick().await;
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(102));

        let mut session = ctx.start_auto_detect(ProbeRequest::default()).await.unwrap();
        assert!(ctx.shared().is_suspended(&pwm));
        assert!(matches!(
            ctx.start_auto_detect(ProbeRequest::default()).await,
            Err(FanbindError::SessionBusy)
        ));

        let mut completed = false;
        while let Some(event) = session.next_event().await {
            if let ProbeEvent::State(crate::detection::ProbeState::Complete) = event {
                completed = true;
            }
        }
        let report = session.finish().await.unwrap();
        assert!(completed);
        assert_eq!(report.best(&pwm).unwrap().mapping.fan, channel(&rig, "fan", 1));

        assert!(!ctx.is_session_active());
        assert!(!ctx.shared().is_suspended(&pwm));
        // Probe saw the firmware baseline, not the loop's manual duty
        assert_eq!(rig.io.get(SimRig::path("pwm1")), Some(120));
        assert_eq!(rig.io.get(SimRig::path("pwm1_enable")), Some(2));
    }

    #[tokio::test]
    async fn test_abort_session() {
        let rig = SimRig::new(2, 0);
        let mut config = context(&rig).config().clone();
        config.probe.hold_ms = 500;
        let ctx = FanbindContext::new(
            config,
            rig.dyn_io(),
            Arc::new(StaticSnapshot(rig.snapshot.clone())),
            Arc::new(StaticTopology),
        );
        assert!(ctx.abort_session().is_err());

        let session = ctx.start_auto_detect(ProbeRequest::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.abort_session().unwrap();

        assert!(matches!(
            session.finish().await,
            Err(FanbindError::SessionAborted { .. })
        ));
        assert!(!ctx.is_session_active());
        assert_eq!(rig.io.get(SimRig::path("pwm2")), Some(120));
        assert_eq!(rig.io.get(SimRig::path("pwm2_enable")), Some(2));
    }
}
