//! Sensor tree I/O
//!
//! Every hardware read and write in the crate goes through [`SensorIo`], so
//! the probe engine and control loop can run against a simulated tree in
//! tests. Async callers wrap each call in [`bounded`] so that a wedged
//! driver can never stall a tick or a probe hold indefinitely.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{FanbindError, Result};

/// Integer read/write access to hwmon attribute files
pub trait SensorIo: Send + Sync {
    /// Read a decimal integer attribute
    fn read_value(&self, path: &Path) -> Result<i64>;

    /// Write a decimal integer attribute
    fn write_value(&self, path: &Path, value: i64) -> Result<()>;
}

/// [`SensorIo`] backed by the real sysfs files
#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsIo;

impl SensorIo for SysfsIo {
    fn read_value(&self, path: &Path) -> Result<i64> {
        let content = fs::read_to_string(path)
            .map_err(|e| FanbindError::unreadable(path, e.to_string()))?;
        let trimmed = content.trim();
        trimmed
            .parse::<i64>()
            .map_err(|_| FanbindError::unreadable(path, format!("unparsable value '{}'", trimmed)))
    }

    fn write_value(&self, path: &Path, value: i64) -> Result<()> {
        trace!(path = ?path, value, "sysfs write");
        fs::write(path, value.to_string()).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => FanbindError::InsufficientPrivilege {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
            _ => FanbindError::PwmWrite {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })
    }
}

/// Run a blocking I/O operation on the blocking pool with an upper time bound
pub async fn bounded<T, F>(limit: Duration, path: &Path, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(FanbindError::generic(format!(
            "I/O task for {} failed: {}",
            path.display(),
            join_err
        ))),
        Err(_) => Err(FanbindError::Timeout(format!(
            "{} did not respond within {:?}",
            path.display(),
            limit
        ))),
    }
}

/// Bounded single read through a shared [`SensorIo`]
pub async fn read_bounded(io: &Arc<dyn SensorIo>, path: &Path, limit: Duration) -> Result<i64> {
    let io = Arc::clone(io);
    let owned: PathBuf = path.to_path_buf();
    bounded(limit, path, move || io.read_value(&owned)).await
}
