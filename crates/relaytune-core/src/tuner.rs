use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use relaytune_netfilter::{Chain, Firewall, IptablesManager, Protocol, Rule, Table, Target};

use crate::error::{classify_io, Result, TuneError};
use crate::latency::{self, HoldState};
use crate::probe::Platform;

/// Ring descriptor counts reported by the NIC driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLimits {
    pub rx_max: u32,
    pub tx_max: u32,
    pub rx_current: u32,
    pub tx_current: u32,
}

/// Capability seam between the tuning catalog and the host.
///
/// One method per mutation category, so the executor and the catalog depend
/// on an interface rather than concrete process invocations. The test
/// double in this module's test section simulates hardware rejection, tool
/// absence and partial support without privileged execution.
pub trait SystemTuner: Send + Sync {
    fn read_sysctl(&self, key: &str) -> Result<String>;
    fn write_sysctl(&self, key: &str, value: &str) -> Result<()>;

    fn set_adaptive_coalescing(&self, iface: &str) -> Result<()>;
    fn ring_limits(&self, iface: &str) -> Result<RingLimits>;
    fn set_ring_sizes(&self, iface: &str, rx: u32, tx: u32) -> Result<()>;

    fn set_wifi_power_save(&self, iface: &str, enabled: bool) -> Result<()>;

    fn stop_service(&self, name: &str) -> Result<()>;
    fn interface_irqs(&self, iface: &str) -> Result<Vec<u32>>;
    fn pin_irq(&self, irq: u32, core: u32) -> Result<()>;

    fn set_hugepage_mode(&self, mode: &str) -> Result<()>;
    fn load_module(&self, name: &str) -> Result<()>;

    fn exempt_udp_from_conntrack(&self) -> Result<()>;
    fn acquire_latency_hold(&self) -> Result<HoldState>;

    fn set_interface_mtu(&self, iface: &str, mtu: u32) -> Result<()>;
}

/// Live implementation: `/proc` and `/sys` writes plus external tool
/// invocations (ethtool, iw, systemctl, modprobe, ip, sysctl on Darwin).
pub struct RealSystemTuner {
    platform: Platform,
    latency_marker: PathBuf,
}

impl RealSystemTuner {
    /// # Errors
    ///
    /// Fails fast with `PermissionDenied` when not running as root; every
    /// mutation this type performs is privileged.
    pub fn new(platform: Platform) -> Result<Self> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(TuneError::PermissionDenied(
                "host tuning mutates kernel state".to_string(),
            ));
        }
        Ok(Self {
            platform,
            latency_marker: PathBuf::from(latency::DEFAULT_MARKER),
        })
    }

    fn sysctl_path(key: &str) -> PathBuf {
        PathBuf::from("/proc/sys").join(key.replace('.', "/"))
    }
}

impl SystemTuner for RealSystemTuner {
    fn read_sysctl(&self, key: &str) -> Result<String> {
        match self.platform {
            Platform::Linux => {
                let path = Self::sysctl_path(key);
                let value = fs::read_to_string(&path).map_err(|e| classify_io(e, key))?;
                Ok(value.trim().to_string())
            }
            Platform::Darwin => {
                let out = run_tool("sysctl", &["-n", key])?;
                Ok(out.trim().to_string())
            }
        }
    }

    fn write_sysctl(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, value, "sysctl_write");
        match self.platform {
            Platform::Linux => {
                let path = Self::sysctl_path(key);
                fs::write(&path, format!("{value}\n")).map_err(|e| classify_io(e, key))
            }
            Platform::Darwin => {
                run_tool("sysctl", &["-w", &format!("{key}={value}")])?;
                Ok(())
            }
        }
    }

    fn set_adaptive_coalescing(&self, iface: &str) -> Result<()> {
        run_tool(
            "ethtool",
            &["-C", iface, "adaptive-rx", "on", "adaptive-tx", "on"],
        )?;
        Ok(())
    }

    fn ring_limits(&self, iface: &str) -> Result<RingLimits> {
        let out = run_tool("ethtool", &["-g", iface])?;
        parse_ring_limits(&out).ok_or_else(|| {
            TuneError::CapabilityUnavailable(format!("{iface} does not report ring parameters"))
        })
    }

    fn set_ring_sizes(&self, iface: &str, rx: u32, tx: u32) -> Result<()> {
        run_tool(
            "ethtool",
            &["-G", iface, "rx", &rx.to_string(), "tx", &tx.to_string()],
        )?;
        Ok(())
    }

    fn set_wifi_power_save(&self, iface: &str, enabled: bool) -> Result<()> {
        let mode = if enabled { "on" } else { "off" };
        run_tool("iw", &["dev", iface, "set", "power_save", mode])?;
        Ok(())
    }

    fn stop_service(&self, name: &str) -> Result<()> {
        run_tool("systemctl", &["stop", name])?;
        Ok(())
    }

    fn interface_irqs(&self, iface: &str) -> Result<Vec<u32>> {
        let contents = fs::read_to_string("/proc/interrupts")
            .map_err(|e| classify_io(e, "/proc/interrupts"))?;
        Ok(parse_interface_irqs(&contents, iface))
    }

    fn pin_irq(&self, irq: u32, core: u32) -> Result<()> {
        let path = format!("/proc/irq/{irq}/smp_affinity_list");
        fs::write(&path, format!("{core}\n")).map_err(|e| classify_io(e, &path))
    }

    fn set_hugepage_mode(&self, mode: &str) -> Result<()> {
        for knob in ["enabled", "defrag"] {
            let path = format!("/sys/kernel/mm/transparent_hugepage/{knob}");
            fs::write(&path, mode).map_err(|e| classify_io(e, &path))?;
        }
        Ok(())
    }

    fn load_module(&self, name: &str) -> Result<()> {
        run_tool("modprobe", &[name])?;
        Ok(())
    }

    fn exempt_udp_from_conntrack(&self) -> Result<()> {
        let firewall = IptablesManager::new()?;
        for chain in [Chain::Prerouting, Chain::Output] {
            let rule = Rule::new(Table::Raw, chain, Target::Notrack).protocol(Protocol::Udp);
            firewall.ensure(&rule)?;
        }
        Ok(())
    }

    fn acquire_latency_hold(&self) -> Result<HoldState> {
        latency::acquire(&self.latency_marker)
    }

    fn set_interface_mtu(&self, iface: &str, mtu: u32) -> Result<()> {
        run_tool("ip", &["link", "set", "dev", iface, "mtu", &mtu.to_string()])?;
        Ok(())
    }
}

/// Run an external tool, folding its failure modes into the error taxonomy.
fn run_tool(tool: &str, args: &[&str]) -> Result<String> {
    debug!(tool, args = %args.join(" "), "external_tool");

    let output = Command::new(tool).args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            TuneError::CapabilityUnavailable(format!("{tool} not found on PATH"))
        } else {
            TuneError::Io(e)
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lower = stderr.to_lowercase();
        if lower.contains("operation not supported") || lower.contains("not supported") {
            return Err(TuneError::CapabilityUnavailable(format!(
                "{tool}: {stderr}"
            )));
        }
        if lower.contains("operation not permitted") || lower.contains("permission denied") {
            return Err(TuneError::PermissionDenied(format!("{tool}: {stderr}")));
        }
        return Err(TuneError::System(format!(
            "{tool} {} failed: {stderr}",
            args.join(" ")
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `ethtool -g` output. Returns `None` when the driver reports no
/// usable RX/TX rows (some virtual NICs print only `n/a`).
pub(crate) fn parse_ring_limits(output: &str) -> Option<RingLimits> {
    let mut in_max = false;
    let mut in_current = false;
    let mut rx_max = None;
    let mut tx_max = None;
    let mut rx_cur = None;
    let mut tx_cur = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Pre-set maximums") {
            in_max = true;
            in_current = false;
            continue;
        }
        if line.starts_with("Current hardware settings") {
            in_max = false;
            in_current = true;
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key != "RX" && key != "TX" {
            continue;
        }
        let Ok(parsed) = value.parse::<u32>() else {
            continue;
        };

        match (key, in_max, in_current) {
            ("RX", true, _) => rx_max = Some(parsed),
            ("TX", true, _) => tx_max = Some(parsed),
            ("RX", _, true) => rx_cur = Some(parsed),
            ("TX", _, true) => tx_cur = Some(parsed),
            _ => {}
        }
    }

    Some(RingLimits {
        rx_max: rx_max?,
        tx_max: tx_max?,
        rx_current: rx_cur?,
        tx_current: tx_cur?,
    })
}

/// IRQ numbers from `/proc/interrupts` whose action name matches the
/// interface, either exactly or as a `<iface>-<queue>` prefix.
pub(crate) fn parse_interface_irqs(contents: &str, iface: &str) -> Vec<u32> {
    let prefix = format!("{iface}-");
    let mut irqs = Vec::new();

    for line in contents.lines() {
        let Some((irq_field, rest)) = line.split_once(':') else {
            continue;
        };
        let Ok(irq) = irq_field.trim().parse::<u32>() else {
            continue;
        };
        let matched = rest
            .split_whitespace()
            .any(|tok| tok == iface || tok.starts_with(&prefix));
        if matched {
            irqs.push(irq);
        }
    }

    irqs
}
