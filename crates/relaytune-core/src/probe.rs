use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, TuneError};

/// Tools the catalog may shell out to. Absence is recorded, never fatal.
const OPTIONAL_TOOLS: &[&str] = &["ethtool", "iw", "iptables", "sysctl", "systemctl", "modprobe"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => write!(f, "linux"),
            Platform::Darwin => write!(f, "darwin"),
        }
    }
}

/// Snapshot of host capabilities. Built once per run, immutable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct HostProfile {
    pub platform: Platform,
    /// Interface owning the default route; `None` when undetectable (and
    /// always `None` on Darwin, where no step depends on it).
    pub primary_interface: Option<String>,
    pub is_wireless: bool,
    pub tools: BTreeMap<String, bool>,
}

/// Inspect the running host. Read-only; no mutation happens here.
pub fn probe() -> Result<HostProfile> {
    let platform = match env::consts::OS {
        "linux" => Platform::Linux,
        "macos" => Platform::Darwin,
        other => return Err(TuneError::UnsupportedPlatform(other.to_string())),
    };

    let mut tools = BTreeMap::new();
    for tool in OPTIONAL_TOOLS {
        tools.insert(tool.to_string(), tool_on_path(tool));
    }

    let primary_interface = match platform {
        Platform::Linux => default_route_interface()?,
        Platform::Darwin => None,
    };

    let is_wireless = primary_interface
        .as_deref()
        .map(|iface| {
            is_wireless_name(iface)
                && (sysfs_wireless(iface) || tools.get("iw").copied().unwrap_or(false))
        })
        .unwrap_or(false);

    debug!(
        platform = %platform,
        iface = primary_interface.as_deref().unwrap_or("-"),
        wireless = is_wireless,
        "host_probe_complete"
    );

    Ok(HostProfile {
        platform,
        primary_interface,
        is_wireless,
        tools,
    })
}

/// Interface that owns the kernel default route, from `/proc/net/route`.
pub fn default_route_interface() -> Result<Option<String>> {
    let contents = match fs::read_to_string("/proc/net/route") {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(parse_route_table(&contents))
}

/// Pick the first route whose destination and mask are both zero.
///
/// `/proc/net/route` columns: Iface Destination Gateway Flags RefCnt Use
/// Metric Mask MTU Window IRTT.
pub(crate) fn parse_route_table(contents: &str) -> Option<String> {
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        if fields[1] == "00000000" && fields[7] == "00000000" {
            return Some(fields[0].to_string());
        }
    }
    None
}

pub(crate) fn is_wireless_name(iface: &str) -> bool {
    iface.starts_with("wl")
}

fn sysfs_wireless(iface: &str) -> bool {
    Path::new("/sys/class/net")
        .join(iface)
        .join("wireless")
        .exists()
}

fn tool_on_path(tool: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| is_executable(&dir.join(tool)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
