//! Unified error handling for Fanbind
//!
//! A single error type shared by the core library and the daemon.
//! Every hardware-facing variant carries the path of the offending channel
//! so that fatal conditions can always be traced back to one sysfs node.

use std::io;
use std::path::{Path, PathBuf};

/// Result type alias using FanbindError
pub type Result<T> = std::result::Result<T, FanbindError>;

/// Unified error type for all Fanbind operations
#[derive(thiserror::Error, Debug)]
pub enum FanbindError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Hardware Access Errors
    // ============================================================================
    #[error("Hardware channel {path} unreadable: {reason}")]
    HardwareUnreadable {
        path: PathBuf,
        reason: String,
    },

    #[error("Insufficient privilege to write {path}: {reason}")]
    InsufficientPrivilege {
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to write PWM to {path}: {reason}")]
    PwmWrite {
        path: PathBuf,
        reason: String,
    },

    #[error("Hardware not found: {0}")]
    HardwareNotFound(String),

    #[error("Fingerprint {0} matches more than one channel")]
    DuplicateFingerprint(String),

    // ============================================================================
    // Detection Session Errors
    // ============================================================================
    #[error("Ambiguous pairing {pwm} -> {fan} (confidence {confidence:.2}): {reason}")]
    AmbiguousPairing {
        pwm: String,
        fan: String,
        confidence: f32,
        reason: String,
    },

    #[error("Detection session aborted: {reason}")]
    SessionAborted {
        reason: String,
    },

    #[error("A detection session is already running")]
    SessionBusy,

    // ============================================================================
    // Configuration and Validation Errors
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Curve validation failed: {0}")]
    InvalidCurve(String),

    #[error("Invalid PWM value: {value} (must be 0-255)")]
    InvalidPwmValue {
        value: i64,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Generic(String),
}

impl FanbindError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a hardware-unreadable error for a channel path
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::HardwareUnreadable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-config error for a named field
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Errors that end a detection session or daemon start outright.
    ///
    /// Privilege failures are never retried and an aborted session has
    /// already restored its baseline.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InsufficientPrivilege { .. } | Self::SessionAborted { .. }
        )
    }

    /// Path of the channel this error refers to, when there is one
    pub fn channel_path(&self) -> Option<&Path> {
        match self {
            Self::FileRead { path, .. }
            | Self::FileTooLarge { path, .. }
            | Self::HardwareUnreadable { path, .. }
            | Self::InsufficientPrivilege { path, .. }
            | Self::PwmWrite { path, .. } => Some(path),
            _ => None,
        }
    }
}

// Allow converting from String to FanbindError
impl From<String> for FanbindError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to FanbindError
impl From<&str> for FanbindError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
