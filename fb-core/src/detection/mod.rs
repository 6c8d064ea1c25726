//! PWM to fan pairing
//!
//! [`ProbeEngine`] drives each PWM through a sequence of duty levels and
//! watches every fan. [`ConfidenceScorer`] turns what it saw into a
//! confidence per pair. [`heuristic::suggest`] covers rigs where nothing
//! responded.

pub mod heuristic;
mod probe;
mod scorer;

pub use probe::{
    Candidate, FanReading, FanTarget, ProbeEngine, ProbeEvent, ProbeReport, ProbeState,
    ProbeTargets, PwmCandidates, PwmTarget,
};
pub use scorer::{Acceptance, BaselineStats, ConfidenceScorer, ResponseStep, ResponseTrace, Score};
