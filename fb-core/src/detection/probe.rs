//! Active PWM to fan probing
//!
//! # Session
//!
//! 1. **CapturingBaseline**: every target PWM is captured by the session's
//!    [`SafetyGuard`] and every fan's resting RPM is read.
//! 2. Every PWM is parked at full duty in manual mode so that only the probed
//!    output moves while the others hold still.
//! 3. **Probing**: per PWM, the fans are sampled to measure baseline noise,
//!    then each duty level is held while every fan is polled. The first
//!    sample outside the noise band gives the step latency; the last one is
//!    the settled RPM.
//! 4. **Validating**: PWMs that produced a response replay a subset of the
//!    levels so coincidental movement (firmware ramping another fan) is caught.
//! 5. Pairs are scored and ranked, the guard restores the baseline and the
//!    session reports.
//!
//! Every wait is cancellable. Cancellation and write failures abort the
//! session, and the baseline is restored before the error is returned.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::data::{FanMapping, MappingSource};
use crate::detection::heuristic;
use crate::detection::scorer::{
    BaselineStats, ConfidenceScorer, ResponseStep, ResponseTrace, Score,
};
use crate::error::{FanbindError, Result};
use crate::hw::{Actuator, HardwareFingerprint, HardwareInventory, SensorIo};
use crate::safety::{RestoreReport, SafetyGuard};

/// A PWM output to drive during the session
#[derive(Debug, Clone, PartialEq)]
pub struct PwmTarget {
    pub fingerprint: HardwareFingerprint,
    pub actuator: Actuator,
}

/// A fan tachometer to watch during the session
#[derive(Debug, Clone, PartialEq)]
pub struct FanTarget {
    pub fingerprint: HardwareFingerprint,
    pub input: PathBuf,
}

/// Channels taking part in one probe session
#[derive(Debug, Clone, Default)]
pub struct ProbeTargets {
    pub pwms: Vec<PwmTarget>,
    pub fans: Vec<FanTarget>,
    /// Index/label suggestions reported when no fan responds
    pub fallback: Vec<FanMapping>,
}

impl ProbeTargets {
    /// Probe the given PWMs (all of them when `None`) against every fan
    pub fn from_inventory(
        inventory: &HardwareInventory,
        pwms: Option<&[HardwareFingerprint]>,
    ) -> Result<Self> {
        let pwms: Vec<PwmTarget> = match pwms {
            Some(selected) => selected
                .iter()
                .map(|fp| {
                    inventory.resolve_pwm(fp).map(|ch| PwmTarget {
                        fingerprint: fp.clone(),
                        actuator: ch.actuator.clone(),
                    })
                })
                .collect::<Result<_>>()?,
            None => inventory
                .pwms()
                .map(|(fp, ch)| PwmTarget {
                    fingerprint: fp.clone(),
                    actuator: ch.actuator.clone(),
                })
                .collect(),
        };
        if pwms.is_empty() {
            return Err(FanbindError::HardwareNotFound(
                "no PWM outputs available to probe".into(),
            ));
        }

        let fans: Vec<FanTarget> = inventory
            .fans()
            .map(|(fp, ch)| FanTarget {
                fingerprint: fp.clone(),
                input: ch.input_path.clone(),
            })
            .collect();

        let pwm_fps: Vec<HardwareFingerprint> =
            pwms.iter().map(|p| p.fingerprint.clone()).collect();
        let fallback = heuristic::suggest(inventory, &pwm_fps);

        Ok(Self {
            pwms,
            fans,
            fallback,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProbeState {
    Idle,
    CapturingBaseline,
    Probing {
        channel: HardwareFingerprint,
        index: usize,
        total: usize,
    },
    Validating,
    Complete,
    Aborted,
}

/// Progress stream of a probe session
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    State(ProbeState),
    /// A duty level was commanded on a PWM
    Level { pwm: HardwareFingerprint, duty: u8 },
    /// A fan stopped answering and no longer takes part
    FanExcluded { fan: HardwareFingerprint, reason: String },
    /// The baseline was handed back
    Restored(RestoreReport),
}

/// One scored pairing candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub mapping: FanMapping,
    pub score: Score,
}

/// Ranked candidates for one PWM, best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmCandidates {
    pub pwm: HardwareFingerprint,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanReading {
    pub fan: HardwareFingerprint,
    pub rpm: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub results: Vec<PwmCandidates>,
    /// Resting RPM of every fan before the session touched anything
    pub resting: Vec<FanReading>,
    pub excluded_fans: Vec<HardwareFingerprint>,
    /// Filled only when no fan responded to any PWM
    pub heuristic: Vec<FanMapping>,
    pub restore: RestoreReport,
}

impl ProbeReport {
    /// Top-ranked candidate for a PWM
    pub fn best(&self, pwm: &HardwareFingerprint) -> Option<&Candidate> {
        self.results
            .iter()
            .find(|r| &r.pwm == pwm)
            .and_then(|r| r.candidates.first())
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.results.iter().flat_map(|r| r.candidates.iter())
    }
}

/// Observations of one (PWM, fan) pair
#[derive(Debug, Clone)]
struct PairTrace {
    trace: ResponseTrace,
    max_rpm: u32,
}

/// Mutable per-session bookkeeping
struct Session<'a> {
    guard: &'a SafetyGuard,
    fans: Vec<FanTarget>,
    excluded: BTreeSet<HardwareFingerprint>,
}

impl Session<'_> {
    fn active_fans(&self) -> Vec<FanTarget> {
        self.fans
            .iter()
            .filter(|f| !self.excluded.contains(&f.fingerprint))
            .cloned()
            .collect()
    }
}

pub struct ProbeEngine {
    io: Arc<dyn SensorIo>,
    config: ProbeConfig,
    scorer: ConfidenceScorer,
    io_timeout: Duration,
    events: Option<mpsc::UnboundedSender<ProbeEvent>>,
    cancel: Option<watch::Receiver<bool>>,
    state: ProbeState,
}

impl ProbeEngine {
    pub fn new(
        io: Arc<dyn SensorIo>,
        config: ProbeConfig,
        scorer: ConfidenceScorer,
        io_timeout: Duration,
    ) -> Self {
        Self {
            io,
            config,
            scorer,
            io_timeout,
            events: None,
            cancel: None,
            state: ProbeState::Idle,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProbeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    /// Run a full session; the baseline is restored on every exit path
    pub async fn run(&mut self, targets: ProbeTargets) -> Result<ProbeReport> {
        let guard = SafetyGuard::new(
            Arc::clone(&self.io),
            self.io_timeout,
            self.config.read_retry_budget,
        );
        info!(
            pwms = targets.pwms.len(),
            fans = targets.fans.len(),
            "PROBE: Starting detection session"
        );

        let outcome = self.execute(&guard, &targets).await;
        let restore = guard.restore_all().await;
        self.emit(ProbeEvent::Restored(restore.clone()));

        match outcome {
            Ok(mut report) => {
                report.restore = restore;
                self.transition(ProbeState::Complete);
                info!(
                    candidates = report.candidates().count(),
                    heuristic = report.heuristic.len(),
                    "PROBE: Detection complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(ProbeState::Aborted);
                error!(error = %e, clean_restore = restore.is_clean(), "PROBE: Session aborted");
                Err(e)
            }
        }
    }

    async fn execute(&mut self, guard: &SafetyGuard, targets: &ProbeTargets) -> Result<ProbeReport> {
        self.check_cancelled()?;
        let mut session = Session {
            guard,
            fans: targets.fans.clone(),
            excluded: BTreeSet::new(),
        };

        self.transition(ProbeState::CapturingBaseline);
        for pwm in &targets.pwms {
            guard.capture(&pwm.actuator).await?;
        }
        let mut resting = Vec::new();
        for fan in session.active_fans() {
            if let Some(rpm) = self.read_fan(&mut session, &fan).await {
                resting.push(FanReading {
                    fan: fan.fingerprint.clone(),
                    rpm,
                });
            }
        }

        for pwm in &targets.pwms {
            guard.take_manual(&pwm.actuator).await?;
            guard.write_duty(&pwm.actuator, self.config.park_duty).await?;
        }
        self.wait(self.config.settle()).await?;

        let total = targets.pwms.len();
        let mut traces: BTreeMap<HardwareFingerprint, BTreeMap<HardwareFingerprint, PairTrace>> =
            BTreeMap::new();

        for (index, pwm) in targets.pwms.iter().enumerate() {
            self.transition(ProbeState::Probing {
                channel: pwm.fingerprint.clone(),
                index,
                total,
            });
            let pair_traces = self.probe_pwm(&mut session, pwm).await?;
            traces.insert(pwm.fingerprint.clone(), pair_traces);
        }

        self.transition(ProbeState::Validating);
        for pwm in &targets.pwms {
            let Some(pair_traces) = traces.get_mut(&pwm.fingerprint) else {
                continue;
            };
            if !pair_traces.values().any(|p| p.trace.is_significant()) {
                continue;
            }
            self.validate_pwm(&mut session, pwm, pair_traces).await?;
        }

        let results = self.rank(traces, &session.excluded);
        let heuristic = if results.iter().all(|r| r.candidates.is_empty()) {
            info!("PROBE: No fan responded, reporting heuristic suggestions");
            targets.fallback.clone()
        } else {
            Vec::new()
        };

        Ok(ProbeReport {
            results,
            resting,
            excluded_fans: session.excluded.into_iter().collect(),
            heuristic,
            restore: RestoreReport::default(),
        })
    }

    async fn probe_pwm(
        &mut self,
        session: &mut Session<'_>,
        pwm: &PwmTarget,
    ) -> Result<BTreeMap<HardwareFingerprint, PairTrace>> {
        let samples = self.sample_baseline(session).await?;
        let mut traces: BTreeMap<HardwareFingerprint, PairTrace> = samples
            .into_iter()
            .map(|(fp, samples)| {
                let baseline = BaselineStats::from_samples(&samples);
                let noise_band = (self.config.min_rpm_delta as f32)
                    .max(self.config.noise_factor * baseline.std_dev);
                let park = ResponseStep {
                    duty: self.config.park_duty,
                    rpm: baseline.mean_rpm.round() as u32,
                    latency_ms: None,
                };
                let trace = ResponseTrace {
                    baseline,
                    noise_band,
                    probe: vec![park],
                    validation: Vec::new(),
                };
                let max_rpm = samples.iter().copied().max().unwrap_or(0);
                (fp, PairTrace { trace, max_rpm })
            })
            .collect();

        for &duty in &self.config.levels.clone() {
            let steps = self.drive_level(session, pwm, duty, &traces, false).await?;
            record_steps(&mut traces, steps, false);
        }

        session.guard.write_duty(&pwm.actuator, self.config.park_duty).await?;
        self.wait(self.config.settle()).await?;

        debug!(
            pwm = %pwm.fingerprint,
            responding = traces.values().filter(|p| p.trace.is_significant()).count(),
            "PROBE: Finished channel"
        );
        Ok(traces)
    }

    async fn validate_pwm(
        &mut self,
        session: &mut Session<'_>,
        pwm: &PwmTarget,
        traces: &mut BTreeMap<HardwareFingerprint, PairTrace>,
    ) -> Result<()> {
        for &duty in &self.config.validation_levels.clone() {
            let steps = self.drive_level(session, pwm, duty, traces, true).await?;
            record_steps(traces, steps, true);
        }
        session.guard.write_duty(&pwm.actuator, self.config.park_duty).await?;
        self.wait(self.config.settle()).await
    }

    /// Sample every active fan `baseline_samples` times
    async fn sample_baseline(
        &mut self,
        session: &mut Session<'_>,
    ) -> Result<BTreeMap<HardwareFingerprint, Vec<u32>>> {
        let mut samples: BTreeMap<HardwareFingerprint, Vec<u32>> = BTreeMap::new();
        for n in 0..self.config.baseline_samples {
            if n > 0 {
                self.wait(self.config.sample_interval()).await?;
            }
            for fan in session.active_fans() {
                if let Some(rpm) = self.read_fan(session, &fan).await {
                    samples.entry(fan.fingerprint.clone()).or_default().push(rpm);
                }
            }
        }
        samples.retain(|fp, _| !session.excluded.contains(fp));
        Ok(samples)
    }

    /// Command one duty level and poll every fan for the hold period
    async fn drive_level(
        &mut self,
        session: &mut Session<'_>,
        pwm: &PwmTarget,
        duty: u8,
        traces: &BTreeMap<HardwareFingerprint, PairTrace>,
        validating: bool,
    ) -> Result<BTreeMap<HardwareFingerprint, (ResponseStep, u32)>> {
        self.check_cancelled()?;
        let written = session.guard.write_duty(&pwm.actuator, duty).await?;
        self.emit(ProbeEvent::Level {
            pwm: pwm.fingerprint.clone(),
            duty: written,
        });

        let started = Instant::now();
        let hold = self.config.hold();
        let mut steps: BTreeMap<HardwareFingerprint, (ResponseStep, u32)> = BTreeMap::new();

        loop {
            self.wait(self.config.sample_interval()).await?;
            let elapsed_ms = started.elapsed().as_millis() as u32;

            for fan in session.active_fans() {
                let Some(pair) = traces.get(&fan.fingerprint) else {
                    continue;
                };
                let Some(rpm) = self.read_fan(session, &fan).await else {
                    continue;
                };
                let previous = previous_rpm(&pair.trace, validating);
                let entry = steps.entry(fan.fingerprint.clone()).or_insert((
                    ResponseStep {
                        duty: written,
                        rpm,
                        latency_ms: None,
                    },
                    rpm,
                ));
                entry.0.rpm = rpm;
                entry.1 = entry.1.max(rpm);
                if entry.0.latency_ms.is_none()
                    && (rpm as f32 - previous as f32).abs() > pair.trace.noise_band
                {
                    entry.0.latency_ms = Some(elapsed_ms);
                }
            }

            if started.elapsed() >= hold {
                break;
            }
        }

        steps.retain(|fp, _| !session.excluded.contains(fp));
        Ok(steps)
    }

    /// Read a fan under the retry budget, excluding it on exhaustion
    async fn read_fan(&self, session: &mut Session<'_>, fan: &FanTarget) -> Option<u32> {
        match session.guard.read_with_budget(&fan.input).await {
            Ok(raw) => Some(raw.clamp(0, u32::MAX as i64) as u32),
            Err(e) => {
                warn!(fan = %fan.fingerprint, error = %e, "PROBE: Fan unreadable, excluding it from the session");
                session.excluded.insert(fan.fingerprint.clone());
                self.emit(ProbeEvent::FanExcluded {
                    fan: fan.fingerprint.clone(),
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    fn rank(
        &self,
        traces: BTreeMap<HardwareFingerprint, BTreeMap<HardwareFingerprint, PairTrace>>,
        excluded: &BTreeSet<HardwareFingerprint>,
    ) -> Vec<PwmCandidates> {
        traces
            .into_iter()
            .map(|(pwm, pairs)| {
                let mut candidates: Vec<Candidate> = pairs
                    .into_iter()
                    .filter(|(fan, pair)| !excluded.contains(fan) && pair.trace.is_significant())
                    .map(|(fan, pair)| self.candidate(&pwm, fan, pair))
                    .collect();
                candidates.sort_by(compare_candidates);
                for c in &candidates {
                    info!(
                        pwm = %pwm,
                        fan = %c.mapping.fan,
                        rpm_delta = c.mapping.rpm_delta,
                        confidence = format!("{:.2}", c.mapping.confidence),
                        "PROBE: Fan responded"
                    );
                }
                PwmCandidates { pwm, candidates }
            })
            .collect()
    }

    fn candidate(&self, pwm: &HardwareFingerprint, fan: HardwareFingerprint, pair: PairTrace) -> Candidate {
        let score = self.scorer.score(&pair.trace);
        let steps = || pair.trace.probe.iter().chain(pair.trace.validation.iter());

        let min_duty = steps()
            .filter(|s| s.rpm > self.config.stall_rpm)
            .map(|s| s.duty)
            .min();

        let mut latencies: Vec<u32> = pair.trace.probe.iter().filter_map(|s| s.latency_ms).collect();
        latencies.sort_unstable();
        let response_latency_ms = latencies.get(latencies.len() / 2).copied();

        let max_rpm = steps().map(|s| s.rpm).max().unwrap_or(0).max(pair.max_rpm);

        Candidate {
            mapping: FanMapping {
                pwm: pwm.clone(),
                fan,
                confidence: score.confidence,
                response_latency_ms,
                min_duty,
                max_rpm,
                rpm_delta: pair.trace.rpm_delta(),
                baseline_variance: pair.trace.baseline.variance(),
                temp_sources: Vec::new(),
                source: MappingSource::Probe,
            },
            score,
        }
    }

    fn transition(&mut self, state: ProbeState) {
        match &state {
            ProbeState::Probing { channel, index, total } => {
                info!(step = index + 1, total, pwm = %channel, "PROBE: Testing PWM controller")
            }
            other => debug!(state = ?other, "PROBE: State change"),
        }
        self.state = state.clone();
        self.emit(ProbeEvent::State(state));
    }

    fn emit(&self, event: ProbeEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching
            let _ = events.send(event);
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(cancel) if *cancel.borrow() => Err(aborted()),
            _ => Ok(()),
        }
    }

    /// Cancellable timed wait
    async fn wait(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let Some(cancel) = self.cancel.as_mut() else {
            tokio::time::sleep_until(deadline).await;
            return Ok(());
        };

        loop {
            if *cancel.borrow_and_update() {
                return Err(aborted());
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                changed = cancel.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel any more
                        tokio::time::sleep_until(deadline).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn aborted() -> FanbindError {
    FanbindError::SessionAborted {
        reason: "cancelled by request".into(),
    }
}

/// Settled RPM the next step is compared against
fn previous_rpm(trace: &ResponseTrace, validating: bool) -> u32 {
    let steps = if validating && !trace.validation.is_empty() {
        &trace.validation
    } else if validating {
        // Validation starts from the park point
        return trace.probe.first().map(|s| s.rpm).unwrap_or(0);
    } else {
        &trace.probe
    };
    steps.last().map(|s| s.rpm).unwrap_or(0)
}

fn record_steps(
    traces: &mut BTreeMap<HardwareFingerprint, PairTrace>,
    steps: BTreeMap<HardwareFingerprint, (ResponseStep, u32)>,
    validating: bool,
) {
    for (fan, (step, max_seen)) in steps {
        if let Some(pair) = traces.get_mut(&fan) {
            pair.max_rpm = pair.max_rpm.max(max_seen);
            if validating {
                pair.trace.validation.push(step);
            } else {
                pair.trace.probe.push(step);
            }
        }
    }
}

/// Larger delta first, then shorter latency (unknown last), then quieter baseline
fn compare_candidates(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    let (a, b) = (&a.mapping, &b.mapping);
    b.rpm_delta
        .cmp(&a.rpm_delta)
        .then_with(|| match (a.response_latency_ms, b.response_latency_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
        .then_with(|| a.baseline_variance.total_cmp(&b.baseline_variance))
        .then_with(|| a.fan.cmp(&b.fan))
}
