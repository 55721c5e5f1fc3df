//! Fixed, ordered catalog of tuning steps.
//!
//! Order matters: irqbalance is stopped inside the IRQ pinning step before
//! any affinity write, and the congestion-control module is loaded before
//! the algorithm is read back. Steps are authored here once and never
//! mutated at runtime.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{Result, TuneError};
use crate::latency::HoldState;
use crate::persist;
use crate::probe::{HostProfile, Platform};
use crate::tuner::SystemTuner;

pub const RING_TARGET: u32 = 4096;

const LINUX: &[Platform] = &[Platform::Linux];
const DARWIN: &[Platform] = &[Platform::Darwin];

/// What a successful apply reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Done,
    /// The step detected in advance that there is nothing to do
    /// (capability absent, already at target, not applicable).
    Skipped(String),
}

type ApplyFn = Box<dyn Fn(&dyn SystemTuner, &HostProfile) -> Result<ApplyOutcome> + Send + Sync>;
type VerifyFn = Box<dyn Fn(&dyn SystemTuner, &HostProfile) -> Result<String> + Send + Sync>;

/// One immutable catalog entry.
pub struct TuningStep {
    pub id: &'static str,
    pub platforms: &'static [Platform],
    pub description: &'static str,
    /// A failing apply aborts the whole run when set.
    pub fatal: bool,
    pub apply: ApplyFn,
    pub verify: Option<VerifyFn>,
}

/// Operator-tunable catalog parameters.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    /// Core all interface IRQs are pinned to.
    pub irq_core: u32,
    /// NetworkManager conf.d directory for the power-save override.
    pub nm_conf_dir: PathBuf,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            irq_core: 0,
            nm_conf_dir: PathBuf::from(persist::NM_CONF_DIR),
        }
    }
}

const NO_INTERFACE: &str = "no primary interface detected";

/// True only when the probe positively recorded the tool as absent; an
/// unscanned tool is assumed present and left to fail at apply time.
fn tool_absent(profile: &HostProfile, tool: &str) -> bool {
    profile.tools.get(tool).is_some_and(|present| !present)
}

/// Darwin knobs vary by release; a key the kernel does not expose is a
/// detected gap, not a failure.
fn apply_darwin_sysctls(tuner: &dyn SystemTuner, pairs: &[(&str, &str)]) -> Result<ApplyOutcome> {
    for (key, value) in pairs {
        match tuner.write_sysctl(key, value) {
            Ok(()) => {}
            Err(TuneError::CapabilityUnavailable(_)) => {
                return Ok(ApplyOutcome::Skipped(format!(
                    "{key} not exposed by this kernel"
                )));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(ApplyOutcome::Done)
}

/// The full step catalog, Linux entries first, then Darwin. The executor
/// skips entries whose platform set does not match the probed profile.
pub fn catalog(opts: &CatalogOptions) -> Vec<TuningStep> {
    let mut steps = Vec::with_capacity(13);

    steps.push(TuningStep {
        id: "adaptive-coalescing",
        platforms: LINUX,
        description: "enable adaptive interrupt coalescing (rx+tx)",
        // Without adaptive coalescing the remaining throughput tuning is
        // unreliable, so a driver rejection aborts the run.
        fatal: true,
        apply: Box::new(|tuner, profile| {
            let Some(iface) = profile.primary_interface.as_deref() else {
                return Ok(ApplyOutcome::Skipped(NO_INTERFACE.into()));
            };
            if tool_absent(profile, "ethtool") {
                return Ok(ApplyOutcome::Skipped("ethtool not on PATH".into()));
            }
            tuner.set_adaptive_coalescing(iface)?;
            Ok(ApplyOutcome::Done)
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "ring-expansion",
        platforms: LINUX,
        description: "expand rx/tx descriptor rings toward 4096",
        fatal: false,
        apply: Box::new(|tuner, profile| {
            let Some(iface) = profile.primary_interface.as_deref() else {
                return Ok(ApplyOutcome::Skipped(NO_INTERFACE.into()));
            };
            if tool_absent(profile, "ethtool") {
                return Ok(ApplyOutcome::Skipped("ethtool not on PATH".into()));
            }
            // Querying the limits is the capability check for this step.
            let limits = match tuner.ring_limits(iface) {
                Ok(limits) => limits,
                Err(TuneError::CapabilityUnavailable(reason)) => {
                    return Ok(ApplyOutcome::Skipped(reason));
                }
                Err(err) => return Err(err),
            };
            let rx = RING_TARGET.min(limits.rx_max);
            let tx = RING_TARGET.min(limits.tx_max);
            if limits.rx_current >= rx && limits.tx_current >= tx {
                return Ok(ApplyOutcome::Skipped(
                    "rings already at hardware maximum".into(),
                ));
            }
            tuner.set_ring_sizes(iface, rx, tx)?;
            Ok(ApplyOutcome::Done)
        }),
        verify: None,
    });

    let nm_conf_dir = opts.nm_conf_dir.clone();
    steps.push(TuningStep {
        id: "wifi-power-save",
        platforms: LINUX,
        description: "disable wireless power saving",
        fatal: false,
        apply: Box::new(move |tuner, profile| {
            if !profile.is_wireless {
                return Ok(ApplyOutcome::Skipped("no wireless interface detected".into()));
            }
            let Some(iface) = profile.primary_interface.as_deref() else {
                return Ok(ApplyOutcome::Skipped(NO_INTERFACE.into()));
            };
            if tool_absent(profile, "iw") {
                return Ok(ApplyOutcome::Skipped("iw not on PATH".into()));
            }
            tuner.set_wifi_power_save(iface, false)?;

            // Persisting the preference is best-effort; NetworkManager may
            // simply not be installed.
            match persist::write_powersave_override(&nm_conf_dir) {
                Ok(Some(path)) => debug!(path = %path.display(), "powersave_override_written"),
                Ok(None) => debug!("networkmanager conf dir absent, override not written"),
                Err(err) => warn!(error = %err, "powersave_override_write_failed"),
            }
            Ok(ApplyOutcome::Done)
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "napi-budget",
        platforms: LINUX,
        description: "raise napi poll and time budgets",
        fatal: false,
        apply: Box::new(|tuner, _| {
            tuner.write_sysctl("net.core.netdev_budget", "600")?;
            match tuner.write_sysctl("net.core.netdev_budget_usecs", "8000") {
                Ok(()) => Ok(ApplyOutcome::Done),
                Err(TuneError::CapabilityUnavailable(_)) => Ok(ApplyOutcome::Skipped(
                    "netdev_budget_usecs not exposed by this kernel; base budget applied".into(),
                )),
                Err(err) => Err(err),
            }
        }),
        verify: None,
    });

    let irq_core = opts.irq_core;
    steps.push(TuningStep {
        id: "irq-affinity",
        platforms: LINUX,
        description: "pin interface irqs to a single core",
        fatal: false,
        apply: Box::new(move |tuner, profile| {
            let Some(iface) = profile.primary_interface.as_deref() else {
                return Ok(ApplyOutcome::Skipped(NO_INTERFACE.into()));
            };
            // irqbalance would undo the pinning; absence of the daemon is fine.
            if let Err(err) = tuner.stop_service("irqbalance") {
                debug!(error = %err, "irqbalance_stop_skipped");
            }
            let irqs = tuner.interface_irqs(iface)?;
            if irqs.is_empty() {
                return Ok(ApplyOutcome::Skipped(format!(
                    "no irqs matched interface {iface}"
                )));
            }
            for irq in irqs {
                tuner.pin_irq(irq, irq_core)?;
            }
            Ok(ApplyOutcome::Done)
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "socket-buffers",
        platforms: LINUX,
        description: "raise socket buffer ceilings and enable busy polling",
        fatal: false,
        apply: Box::new(|tuner, _| {
            tuner.write_sysctl("net.core.rmem_max", "16777216")?;
            tuner.write_sysctl("net.core.wmem_max", "16777216")?;
            tuner.write_sysctl("net.core.netdev_max_backlog", "5000")?;

            for key in ["net.core.busy_poll", "net.core.busy_read"] {
                match tuner.write_sysctl(key, "50") {
                    Ok(()) => {}
                    Err(TuneError::CapabilityUnavailable(_)) => {
                        return Ok(ApplyOutcome::Skipped(format!(
                            "{key} not exposed by this kernel; buffer ceilings applied"
                        )));
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(ApplyOutcome::Done)
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "conntrack-bypass",
        platforms: LINUX,
        description: "exempt udp from connection tracking (raw table)",
        fatal: false,
        apply: Box::new(|tuner, profile| {
            if tool_absent(profile, "iptables") {
                return Ok(ApplyOutcome::Skipped("iptables not on PATH".into()));
            }
            tuner.exempt_udp_from_conntrack()?;
            Ok(ApplyOutcome::Done)
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "hugepages",
        platforms: LINUX,
        description: "enable transparent huge pages (always)",
        fatal: false,
        apply: Box::new(|tuner, _| match tuner.set_hugepage_mode("always") {
            Ok(()) => Ok(ApplyOutcome::Done),
            // Kernel built without transparent hugepage support.
            Err(TuneError::CapabilityUnavailable(reason)) => Ok(ApplyOutcome::Skipped(reason)),
            Err(err) => Err(err),
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "latency-hold",
        platforms: LINUX,
        description: "hold cpu minimum-latency handle open",
        fatal: false,
        apply: Box::new(|tuner, _| match tuner.acquire_latency_hold() {
            Ok(HoldState::AlreadyHeld) => {
                Ok(ApplyOutcome::Skipped("latency hold already active".into()))
            }
            Ok(HoldState::Acquired { .. }) => Ok(ApplyOutcome::Done),
            // The device check runs before anything is mutated.
            Err(TuneError::CapabilityUnavailable(reason)) => Ok(ApplyOutcome::Skipped(reason)),
            Err(err) => Err(err),
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "congestion-control",
        platforms: LINUX,
        description: "activate bbr congestion control with fq qdisc",
        fatal: false,
        apply: Box::new(|tuner, profile| {
            if tool_absent(profile, "modprobe") {
                return Ok(ApplyOutcome::Skipped("modprobe not on PATH".into()));
            }
            tuner.load_module("tcp_bbr")?;
            tuner.write_sysctl("net.core.default_qdisc", "fq")?;
            tuner.write_sysctl("net.ipv4.tcp_congestion_control", "bbr")?;
            Ok(ApplyOutcome::Done)
        }),
        // Observed value is recorded whether or not bbr actually took;
        // some kernels silently keep the previous algorithm, which is a
        // mismatch worth logging but never a failure.
        verify: Some(Box::new(|tuner, _| {
            let observed = tuner.read_sysctl("net.ipv4.tcp_congestion_control")?;
            if observed != "bbr" {
                let mismatch = TuneError::VerificationMismatch {
                    requested: "bbr".to_string(),
                    observed: observed.clone(),
                };
                warn!(%mismatch, "congestion_control_not_active");
            }
            Ok(observed)
        })),
    });

    steps.push(TuningStep {
        id: "darwin-maxsockbuf",
        platforms: DARWIN,
        description: "raise maximum socket buffer ceiling",
        fatal: false,
        apply: Box::new(|tuner, _| {
            apply_darwin_sysctls(tuner, &[("kern.ipc.maxsockbuf", "8388608")])
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "darwin-udp-buffers",
        platforms: DARWIN,
        description: "raise udp receive buffer and max datagram size",
        fatal: false,
        apply: Box::new(|tuner, _| {
            apply_darwin_sysctls(
                tuner,
                &[
                    ("net.inet.udp.recvspace", "4194304"),
                    ("net.inet.udp.maxdgram", "65535"),
                ],
            )
        }),
        verify: None,
    });

    steps.push(TuningStep {
        id: "darwin-keepalive",
        platforms: DARWIN,
        description: "shorten dead-connection detection interval",
        fatal: false,
        apply: Box::new(|tuner, _| {
            apply_darwin_sysctls(
                tuner,
                &[
                    ("net.inet.tcp.always_keepalive", "1"),
                    ("net.inet.tcp.keepidle", "10000"),
                ],
            )
        }),
        verify: None,
    });

    steps
}
