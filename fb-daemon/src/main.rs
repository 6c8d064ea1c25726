//! Fanbind Daemon (fanbindd)
//!
//! Privileged entry point for hwmon fan control.
//!
//! # Modes
//! - **Control** (default): loads the confirmed profile and runs the control
//!   loop until SIGINT/SIGTERM, then hands every channel back to firmware
//! - **Detect** (`--detect`): runs one detection session and prints the
//!   ranked candidates as JSON
//! - **Dump** (`--dump`): prints the enumerated hwmon snapshot as JSON
//!
//! # Safety Model
//! - Every PWM channel is captured before its first write and restored on exit
//! - Unreadable sensors and failed writes force the affected fan to full duty
//! - A PWM write refused for lack of privilege stops control with an error
//! - Shutdown waits for the restore report before the process exits

use anyhow::{Context, Result};
use clap::Parser;
use fb_core::constants::paths;
use fb_core::detection::ProbeEvent;
use fb_core::hw::{check_pwm_permissions, snapshot_to_json};
use fb_core::{EngineConfig, FanbindContext, FanbindError, ProbeRequest, Profile, RestoreReport};
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fanbindd")]
#[command(version)]
#[command(about = "Fanbind - hwmon fan discovery and curve control daemon")]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, default_value = paths::CONFIG_FILE)]
    config: PathBuf,

    /// Confirmed mapping profile (JSON) to control
    #[arg(short, long)]
    profile: Option<PathBuf>,

    /// Run one detection session, print the report and exit
    #[arg(long, conflicts_with = "dump")]
    detect: bool,

    /// Print the enumerated hwmon snapshot as JSON and exit
    #[arg(long)]
    dump: bool,

    /// Log filter, overrides FANBIND_LOG
    #[arg(long)]
    log_level: Option<String>,
}

// ============================================================================
// Logging
// ============================================================================

/// Filter directive: CLI first, then FANBIND_LOG, then info
fn log_filter(cli_level: Option<&str>, env_level: Option<String>) -> String {
    cli_level
        .map(str::to_string)
        .or(env_level)
        .unwrap_or_else(|| "info".to_string())
}

/// Journald when the journal socket exists, stdout otherwise. Returns
/// whether journald is in use.
fn init_logging(filter: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if Path::new(paths::JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(filter))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    false
}

// ============================================================================
// Privileges
// ============================================================================

/// Root is required unless the run only reads, or detection runs against a
/// non-system tree
fn verify_privileges(cli: &Cli, euid: u32, hwmon_root: &Path) -> fb_error::Result<()> {
    if euid == 0 || cli.dump {
        return Ok(());
    }
    if cli.detect && hwmon_root != Path::new(paths::HWMON_BASE) {
        warn!(root = ?hwmon_root, euid, "STARTUP: Running unprivileged against a non-system hwmon tree");
        return Ok(());
    }
    Err(FanbindError::InsufficientPrivilege {
        path: hwmon_root.to_path_buf(),
        reason: format!("fanbindd must run as root for PWM access (euid={})", euid),
    })
}

fn current_euid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

// ============================================================================
// Profile
// ============================================================================

fn load_profile(path: &Path) -> Result<Profile> {
    fb_core::data::validate_file_size(path)?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading profile {}", path.display()))?;
    let profile: Profile = serde_json::from_str(&content)
        .with_context(|| format!("parsing profile {}", path.display()))?;
    Ok(profile)
}

fn log_restore(report: &RestoreReport) {
    for path in report.forced_full() {
        warn!(pwm = ?path, "SHUTDOWN: Channel could not be restored, left at full duty");
    }
    for path in report.failed() {
        error!(pwm = ?path, "SHUTDOWN: Channel could not be restored or driven to full duty");
    }
    if report.is_clean() {
        info!(channels = report.channels.len(), "SHUTDOWN: All channels handed back to firmware");
    }
}

// ============================================================================
// Modes
// ============================================================================

async fn run_detect(ctx: &FanbindContext, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut session = ctx
        .start_auto_detect(ProbeRequest::default())
        .await
        .context("starting detection session")?;

    let mut cancelled = false;
    loop {
        // None means shutdown was requested
        let next = tokio::select! {
            event = session.next_event() => Some(event),
            _ = shutdown.changed(), if !cancelled => None,
        };
        match next {
            None => {
                info!("SIGNAL: Cancelling detection session");
                session.cancel();
                cancelled = true;
            }
            Some(None) => break,
            Some(Some(ProbeEvent::State(state))) => info!("PROBE: {:?}", state),
            Some(Some(ProbeEvent::Level { pwm, duty })) => {
                debug!(pwm = %pwm, duty, "PROBE: Level set")
            }
            Some(Some(ProbeEvent::FanExcluded { fan, reason })) => {
                warn!(fan = %fan, reason = %reason, "PROBE: Fan excluded")
            }
            Some(Some(ProbeEvent::Restored(report))) => log_restore(&report),
        }
    }

    let report = session.finish().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_control(
    ctx: &FanbindContext,
    profile: Option<&Path>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match profile {
        Some(path) => {
            let profile = load_profile(path)?;
            let report = ctx
                .load_profile(profile)
                .await
                .with_context(|| format!("applying profile {}", path.display()))?;
            info!(
                mappings = report.applied.len(),
                controlled = report.controlled,
                "STARTUP: Profile loaded"
            );
            for pwm in &report.unresolved {
                warn!(pwm = %pwm, "STARTUP: Mapped hardware not found, left under firmware control");
            }
        }
        None => warn!("STARTUP: No profile given, fans stay under firmware control"),
    }

    info!("Fan control loop started");
    let report = ctx
        .control_loop()
        .run(shutdown)
        .await
        .context("running the control loop")?;
    log_restore(&report);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(cli.log_level.as_deref(), std::env::var("FANBIND_LOG").ok());
    let journald = init_logging(&filter);
    info!("STARTUP: fanbindd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if journald { "systemd journal" } else { "stdout" });

    let config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    verify_privileges(&cli, current_euid(), &config.hwmon_root)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        let _ = shutdown_tx.send(true);
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }

    let ctx = FanbindContext::from_config(config);
    let inventory = ctx.inventory().await.context("enumerating hwmon chips")?;
    info!(
        chips = inventory.snapshot.chips.len(),
        pwms = inventory.pwms().count(),
        fans = inventory.fans().count(),
        temps = inventory.temperatures().count(),
        "STARTUP: Hardware enumerated"
    );
    if cli.dump {
        println!("{}", snapshot_to_json(&inventory.snapshot)?);
        return Ok(());
    }
    for path in check_pwm_permissions(&inventory.snapshot) {
        warn!(path = ?path, "STARTUP: PWM attribute is not writable");
    }

    let result = if cli.detect {
        run_detect(&ctx, shutdown_rx).await
    } else {
        run_control(&ctx, cli.profile.as_deref(), shutdown_rx).await
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    info!("SHUTDOWN: fanbindd stopped");
    result
}
