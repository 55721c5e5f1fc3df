//! Acquire-once minimum-latency hold.
//!
//! Writing a zero to `/dev/cpu_dma_latency` and keeping the descriptor open
//! prevents the CPU from entering deep idle states. The hold must outlive
//! the pipeline process, so acquisition re-execs the current binary with
//! the hidden worker subcommand, detached into its own session. A marker
//! file keyed by the worker pid makes repeated pipeline runs idempotent.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, TuneError};

pub const DEFAULT_MARKER: &str = "/run/relaytune/latency-hold.pid";
pub const LATENCY_DEVICE: &str = "/dev/cpu_dma_latency";

/// The subcommand name the worker is spawned with.
pub const WORKER_SUBCOMMAND: &str = "latency-hold-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    /// Marker present; a hold from an earlier run is still in effect.
    AlreadyHeld,
    /// New hold spawned in this run.
    Acquired { pid: u32 },
}

static ACQUIRE_LOCK: Mutex<()> = Mutex::new(());

/// Acquire the latency hold at most once across the host's uptime.
///
/// Safe to call concurrently from repeated invocations: a process-local
/// lock serializes in-process callers, and the marker file guards across
/// processes. The spawned worker deliberately outlives this process.
pub fn acquire(marker: &Path) -> Result<HoldState> {
    let _guard = ACQUIRE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    if marker.exists() {
        debug!(marker = %marker.display(), "latency_hold_marker_present");
        return Ok(HoldState::AlreadyHeld);
    }

    if !Path::new(LATENCY_DEVICE).exists() {
        return Err(TuneError::CapabilityUnavailable(format!(
            "{LATENCY_DEVICE} not present on this kernel"
        )));
    }

    let exe = std::env::current_exe()?;

    // Exclusive create of the marker decides the winner between racing
    // processes; the loser sees the claim and backs off.
    let Some(mut claimed) = claim_marker(marker)? else {
        debug!(marker = %marker.display(), "latency_hold_claimed_by_other_process");
        return Ok(HoldState::AlreadyHeld);
    };

    let child = match Command::new(exe)
        .arg(WORKER_SUBCOMMAND)
        .arg("--marker")
        .arg(marker)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            // Release the claim so a later attempt can retry.
            let _ = fs::remove_file(marker);
            return Err(err.into());
        }
    };

    let pid = child.id();
    claimed.write_all(format!("{pid}\n").as_bytes())?;
    info!(pid, marker = %marker.display(), "latency_hold_acquired");
    Ok(HoldState::Acquired { pid })
}

/// Create the marker with `O_EXCL` so exactly one process can hold the
/// claim; `None` means another process already owns it.
fn claim_marker(marker: &Path) -> Result<Option<fs::File>> {
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    match OpenOptions::new().write(true).create_new(true).open(marker) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Body of the hidden worker subcommand. Detaches from the parent session,
/// opens the latency device with a zero target and parks forever; the
/// kernel releases the hold only when this process dies.
pub fn hold_worker(_marker: &Path) -> Result<()> {
    // SAFETY: setsid has no memory-safety preconditions; failure (already a
    // session leader) is harmless here.
    unsafe {
        libc::setsid();
    }

    let mut device = OpenOptions::new().write(true).open(LATENCY_DEVICE)?;
    device.write_all(&0i32.to_ne_bytes())?;

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
