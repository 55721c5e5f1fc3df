use std::io;

use thiserror::Error;

/// Result type alias using [`TuneError`]
pub type Result<T> = std::result::Result<T, TuneError>;

/// Errors surfaced by the probe, the tuning steps and the gateway switch.
///
/// Step-level errors never unwind past the executor; they are folded into
/// the per-step result. Only an unsupported platform at probe time or a
/// fatal step failure reaches the process boundary.
#[derive(Debug, Error)]
pub enum TuneError {
    /// Host OS is neither Linux nor Darwin
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Privilege missing for a mutating operation
    #[error("permission denied: {0}. Run as root or with CAP_NET_ADMIN")]
    PermissionDenied(String),

    /// Hardware, driver or tool does not support the request
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Read-back after apply did not match the requested value.
    /// Informational only; never escalated to a step failure.
    #[error("verification mismatch: requested {requested}, observed {observed}")]
    VerificationMismatch { requested: String, observed: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("system error: {0}")]
    System(String),
}

impl From<relaytune_netfilter::FirewallError> for TuneError {
    fn from(err: relaytune_netfilter::FirewallError) -> Self {
        use relaytune_netfilter::FirewallError;
        match err {
            FirewallError::PermissionDenied => {
                TuneError::PermissionDenied("iptables".to_string())
            }
            FirewallError::NotAvailable => {
                TuneError::CapabilityUnavailable("iptables binary not found".to_string())
            }
            FirewallError::CommandFailed(msg) => TuneError::System(format!("iptables: {msg}")),
            FirewallError::Io(e) => TuneError::Io(e),
        }
    }
}

/// Map an io error from a kernel knob write to the taxonomy: a missing
/// knob means the kernel does not expose the capability, not that the
/// write itself broke.
pub(crate) fn classify_io(err: io::Error, what: &str) -> TuneError {
    match err.kind() {
        io::ErrorKind::NotFound => {
            TuneError::CapabilityUnavailable(format!("{what} not present on this kernel"))
        }
        io::ErrorKind::PermissionDenied => TuneError::PermissionDenied(what.to_string()),
        _ => TuneError::Io(err),
    }
}
