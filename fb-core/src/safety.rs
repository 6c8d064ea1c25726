//! SafetyGuard: capture, bounded excursions and restoration
//!
//! Every PWM channel is captured (prior enable mode and duty) before its
//! first manual write. On session end, shutdown or error the captured state
//! is written back, duty first and enable mode second. A channel that cannot
//! be restored is driven to full speed instead, and a channel that cannot
//! even be driven to full speed is reported as failed.
//!
//! Each owner of hardware (one probe session, the control loop) holds its own
//! guard. Dropping a guard with channels still captured restores them from a
//! helper thread, waiting a bounded time for it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::pwm;
use crate::data::EnableMode;
use crate::error::{FanbindError, Result};
use crate::hw::{bounded, read_bounded, Actuator, SensorIo};

/// Prior state of one captured channel
#[derive(Debug, Clone)]
struct Captured {
    actuator: Actuator,
    prior_enable: Option<EnableMode>,
    prior_duty: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreOutcome {
    Restored,
    /// Restoration failed; the channel was left at full duty
    ForcedFull { reason: String },
    /// Neither restoration nor full duty could be written
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRestore {
    pub pwm_path: PathBuf,
    pub outcome: RestoreOutcome,
}

/// Result of handing channels back to their prior owner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub channels: Vec<ChannelRestore>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.channels
            .iter()
            .all(|c| c.outcome == RestoreOutcome::Restored)
    }

    pub fn forced_full(&self) -> impl Iterator<Item = &Path> {
        self.channels
            .iter()
            .filter(|c| matches!(c.outcome, RestoreOutcome::ForcedFull { .. }))
            .map(|c| c.pwm_path.as_path())
    }

    pub fn failed(&self) -> impl Iterator<Item = &Path> {
        self.channels
            .iter()
            .filter(|c| matches!(c.outcome, RestoreOutcome::Failed { .. }))
            .map(|c| c.pwm_path.as_path())
    }

    pub fn merge(&mut self, other: RestoreReport) {
        self.channels.extend(other.channels);
    }
}

pub struct SafetyGuard {
    io: Arc<dyn SensorIo>,
    io_timeout: Duration,
    read_retry_budget: u32,
    captured: Mutex<BTreeMap<PathBuf, Captured>>,
}

impl SafetyGuard {
    pub fn new(io: Arc<dyn SensorIo>, io_timeout: Duration, read_retry_budget: u32) -> Self {
        Self {
            io,
            io_timeout,
            read_retry_budget: read_retry_budget.max(1),
            captured: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn io(&self) -> &Arc<dyn SensorIo> {
        &self.io
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn is_captured(&self, pwm_path: &Path) -> bool {
        self.captured.lock().contains_key(pwm_path)
    }

    pub fn captured_paths(&self) -> Vec<PathBuf> {
        self.captured.lock().keys().cloned().collect()
    }

    /// Record the prior enable mode and duty of a channel; the first capture wins
    pub async fn capture(&self, actuator: &Actuator) -> Result<()> {
        let key = actuator.pwm_path().to_path_buf();
        if self.is_captured(&key) {
            return Ok(());
        }

        let io = Arc::clone(&self.io);
        let a = actuator.clone();
        let prior_enable = bounded(self.io_timeout, &key, move || a.read_enable(&*io)).await?;

        let io = Arc::clone(&self.io);
        let a = actuator.clone();
        let prior_duty = match bounded(self.io_timeout, &key, move || a.read_duty(&*io)).await {
            Ok(duty) => Some(duty),
            Err(e) => {
                warn!(pwm = ?key, error = %e, "SAFETY: Prior duty unreadable at capture");
                None
            }
        };

        debug!(pwm = ?key, enable = ?prior_enable, duty = ?prior_duty, "SAFETY: Captured channel");
        self.captured.lock().entry(key).or_insert(Captured {
            actuator: actuator.clone(),
            prior_enable,
            prior_duty,
        });
        Ok(())
    }

    /// Capture and switch the channel to manual duty control
    pub async fn take_manual(&self, actuator: &Actuator) -> Result<()> {
        self.capture(actuator).await?;
        let io = Arc::clone(&self.io);
        let a = actuator.clone();
        bounded(self.io_timeout, actuator.pwm_path(), move || {
            a.write_enable(&*io, EnableMode::Manual)
        })
        .await
    }

    /// Write a duty to a captured channel, returning the clamped value written
    pub async fn write_duty(&self, actuator: &Actuator, duty: u8) -> Result<u8> {
        if !self.is_captured(actuator.pwm_path()) {
            return Err(FanbindError::generic(format!(
                "refusing to write {}: prior state was never captured",
                actuator.pwm_path().display()
            )));
        }
        let io = Arc::clone(&self.io);
        let a = actuator.clone();
        bounded(self.io_timeout, actuator.pwm_path(), move || {
            a.write_duty(&*io, duty)
        })
        .await
    }

    /// Drive a channel to full duty, switching it to manual first when possible
    pub async fn force_full(&self, actuator: &Actuator) -> Result<()> {
        let io = Arc::clone(&self.io);
        let a = actuator.clone();
        bounded(self.io_timeout * 2, actuator.pwm_path(), move || {
            force_full_blocking(&*io, &a)
        })
        .await
    }

    /// Read an attribute, retrying transient failures within the budget
    pub async fn read_with_budget(&self, path: &Path) -> Result<i64> {
        let mut last_err = None;
        for attempt in 1..=self.read_retry_budget {
            match read_bounded(&self.io, path, self.io_timeout).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(path = ?path, attempt, error = %e, "Read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FanbindError::unreadable(path, "no read attempted")))
    }

    /// Restore one channel and release it from the guard
    pub async fn restore(&self, pwm_path: &Path) -> Option<ChannelRestore> {
        let captured = self.captured.lock().remove(pwm_path)?;
        Some(self.restore_captured(captured).await)
    }

    /// Restore every captured channel
    pub async fn restore_all(&self) -> RestoreReport {
        let captured: Vec<Captured> = std::mem::take(&mut *self.captured.lock())
            .into_values()
            .collect();

        let mut report = RestoreReport::default();
        for c in captured {
            report.channels.push(self.restore_captured(c).await);
        }
        if !report.channels.is_empty() {
            info!(
                channels = report.channels.len(),
                clean = report.is_clean(),
                "SAFETY: Restored captured channels"
            );
        }
        report
    }

    async fn restore_captured(&self, captured: Captured) -> ChannelRestore {
        let pwm_path = captured.actuator.pwm_path().to_path_buf();
        let io = Arc::clone(&self.io);
        // Up to four writes: duty, enable, then manual + full on failure
        let limit = self.io_timeout * 4;
        let outcome = match bounded(limit, &pwm_path, move || {
            Ok(restore_blocking(&*io, &captured))
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(pwm = ?pwm_path, error = %e, "SAFETY: Restoration did not complete");
                RestoreOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        ChannelRestore { pwm_path, outcome }
    }
}

impl Drop for SafetyGuard {
    fn drop(&mut self) {
        let captured = std::mem::take(self.captured.get_mut());
        if captured.is_empty() {
            return;
        }
        warn!(
            channels = captured.len(),
            "SAFETY: Guard dropped with captured channels, restoring"
        );
        // Same per-channel bound as the async path, on a thread we can stop waiting for
        let limit = self.io_timeout * 4 * captured.len() as u32;
        let io = Arc::clone(&self.io);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            for c in captured.values() {
                restore_blocking(&*io, c);
            }
            let _ = done_tx.send(());
        });
        if done_rx.recv_timeout(limit).is_err() {
            error!(
                timeout_ms = limit.as_millis() as u64,
                "SAFETY: Restoration on drop did not finish in time"
            );
        }
    }
}

fn force_full_blocking(io: &dyn SensorIo, actuator: &Actuator) -> Result<()> {
    if let Err(e) = actuator.write_enable(io, EnableMode::Manual) {
        warn!(pwm = ?actuator.pwm_path(), error = %e, "SAFETY: Could not switch to manual before full duty");
    }
    actuator.write_duty(io, pwm::MAX_VALUE).map(|_| ())
}

fn restore_blocking(io: &dyn SensorIo, c: &Captured) -> RestoreOutcome {
    let path = c.actuator.pwm_path();

    let attempt = match (c.prior_enable, c.prior_duty) {
        (Some(EnableMode::Manual), None) | (None, None) => Err(FanbindError::unreadable(
            path,
            "prior duty unknown for a manually driven channel",
        )),
        (enable, Some(duty)) => c
            .actuator
            .write_duty(io, duty)
            .or_else(|e| match enable {
                // Firmware drives the duty again once its mode is back
                Some(EnableMode::Automatic(_)) => {
                    warn!(pwm = ?path, error = %e, "SAFETY: Prior duty not writable, handing back to firmware");
                    Ok(duty)
                }
                _ => Err(e),
            })
            .and_then(|_| match enable {
                Some(mode) => c.actuator.write_enable(io, mode),
                None => Ok(()),
            }),
        (Some(mode), None) => c.actuator.write_enable(io, mode),
    };

    match attempt {
        Ok(()) => {
            info!(pwm = ?path, enable = ?c.prior_enable, duty = ?c.prior_duty, "ACTION: Restored channel");
            RestoreOutcome::Restored
        }
        Err(e) => {
            warn!(pwm = ?path, error = %e, "SAFETY: Restoration failed, forcing full duty");
            match force_full_blocking(io, &c.actuator) {
                Ok(()) => RestoreOutcome::ForcedFull {
                    reason: e.to_string(),
                },
                Err(full_err) => {
                    error!(pwm = ?path, error = %full_err, "SAFETY: Channel could not be forced to full duty");
                    RestoreOutcome::Failed {
                        reason: format!("{}; forcing full duty: {}", e, full_err),
                    }
                }
            }
        }
    }
}
