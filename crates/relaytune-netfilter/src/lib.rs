//! Typed front-end over the `iptables` binary.
//!
//! Relaytune touches exactly three tables: `nat` for the gateway
//! masquerade, `filter` for the forwarding-accept pair, and `raw` for the
//! UDP conntrack bypass. Rules are assembled with the [`Rule`] builder and
//! applied through [`IptablesManager`], which verifies root privileges at
//! construction time. The [`Firewall`] trait is the seam that lets the
//! gateway switch and the tuning pipeline run against a recording double
//! instead of a live netfilter.

use std::process::Command;

use ipnet::Ipv4Net;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to execute iptables: {0}")]
    CommandFailed(String),

    #[error("iptables binary not found on PATH")]
    NotAvailable,

    #[error("insufficient permissions (requires root/CAP_NET_ADMIN)")]
    PermissionDenied,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FirewallError>;

/// Netfilter tables relaytune operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
    Raw,
}

impl Table {
    fn as_str(&self) -> &str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Raw => "raw",
        }
    }
}

/// Built-in chains used by the gateway switch and the conntrack bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Prerouting,
    Postrouting,
    Forward,
    Output,
}

impl Chain {
    fn as_str(&self) -> &str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Postrouting => "POSTROUTING",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
        }
    }
}

/// Rule verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Accept,
    Masquerade,
    Notrack,
}

impl Target {
    fn as_str(&self) -> &str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Masquerade => "MASQUERADE",
            Target::Notrack => "NOTRACK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
}

impl Protocol {
    fn as_str(&self) -> &str {
        match self {
            Protocol::Udp => "udp",
        }
    }
}

/// Iptables rule builder.
#[derive(Debug, Clone)]
pub struct Rule {
    table: Table,
    chain: Chain,
    protocol: Option<Protocol>,
    in_interface: Option<String>,
    out_interface: Option<String>,
    source_subnet: Option<Ipv4Net>,
    state: Option<String>,
    target: Target,
}

impl Rule {
    pub fn new(table: Table, chain: Chain, target: Target) -> Self {
        Self {
            table,
            chain,
            protocol: None,
            in_interface: None,
            out_interface: None,
            source_subnet: None,
            state: None,
            target,
        }
    }

    pub fn protocol(mut self, proto: Protocol) -> Self {
        self.protocol = Some(proto);
        self
    }

    pub fn in_interface(mut self, iface: &str) -> Self {
        self.in_interface = Some(iface.to_string());
        self
    }

    pub fn out_interface(mut self, iface: &str) -> Self {
        self.out_interface = Some(iface.to_string());
        self
    }

    pub fn source_subnet(mut self, subnet: Ipv4Net) -> Self {
        self.source_subnet = Some(subnet);
        self
    }

    pub fn connection_state(mut self, state: &str) -> Self {
        self.state = Some(state.to_string());
        self
    }

    /// Canonical argument form, used both for execution and as a stable
    /// identity when test doubles record installed rules.
    pub fn to_args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            action.to_string(),
            self.chain.as_str().to_string(),
        ];

        if let Some(proto) = &self.protocol {
            args.push("-p".to_string());
            args.push(proto.as_str().to_string());
        }

        if let Some(iface) = &self.in_interface {
            args.push("-i".to_string());
            args.push(iface.clone());
        }

        if let Some(iface) = &self.out_interface {
            args.push("-o".to_string());
            args.push(iface.clone());
        }

        if let Some(subnet) = &self.source_subnet {
            args.push("-s".to_string());
            args.push(subnet.to_string());
        }

        if let Some(state) = &self.state {
            args.push("-m".to_string());
            args.push("state".to_string());
            args.push("--state".to_string());
            args.push(state.clone());
        }

        args.push("-j".to_string());
        args.push(self.target.as_str().to_string());

        args
    }

    /// Stable identity independent of the action flag.
    pub fn signature(&self) -> String {
        self.to_args("-A").join(" ")
    }
}

/// Seam between rule construction and rule application.
pub trait Firewall: Send + Sync {
    /// True if an identical rule is already installed.
    fn contains(&self, rule: &Rule) -> Result<bool>;

    /// Append the rule unconditionally.
    fn append(&self, rule: &Rule) -> Result<()>;

    /// Delete every installed copy of the rule. Returns how many were
    /// removed; zero is not an error.
    fn delete_all(&self, rule: &Rule) -> Result<usize>;

    /// Install the rule only if it is not already present. Returns true if
    /// a rule was actually appended.
    fn ensure(&self, rule: &Rule) -> Result<bool> {
        if self.contains(rule)? {
            debug!(rule = %rule.signature(), "rule_already_present");
            return Ok(false);
        }
        self.append(rule)?;
        Ok(true)
    }
}

/// Applies rules by invoking the `iptables` binary.
pub struct IptablesManager;

impl IptablesManager {
    /// # Errors
    ///
    /// Returns `FirewallError::PermissionDenied` when not running as root.
    pub fn new() -> Result<Self> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(FirewallError::PermissionDenied);
        }
        Ok(Self)
    }

    fn execute(&self, args: &[String]) -> Result<std::process::ExitStatus> {
        debug!("iptables {}", args.join(" "));

        let output = Command::new("iptables").args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FirewallError::NotAvailable
            } else {
                FirewallError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(status = ?output.status.code(), stderr = %stderr.trim(), "iptables_nonzero");
        }
        Ok(output.status)
    }

    fn execute_checked(&self, args: &[String]) -> Result<()> {
        let output = Command::new("iptables").args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FirewallError::NotAvailable
            } else {
                FirewallError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("Permission denied") || stderr.contains("Operation not permitted")
            {
                return Err(FirewallError::PermissionDenied);
            }
            return Err(FirewallError::CommandFailed(stderr));
        }
        Ok(())
    }
}

impl Firewall for IptablesManager {
    fn contains(&self, rule: &Rule) -> Result<bool> {
        // `iptables -C` exits zero exactly when a matching rule exists.
        let status = self.execute(&rule.to_args("-C"))?;
        Ok(status.success())
    }

    fn append(&self, rule: &Rule) -> Result<()> {
        self.execute_checked(&rule.to_args("-A"))
    }

    fn delete_all(&self, rule: &Rule) -> Result<usize> {
        let mut removed = 0;
        while self.contains(rule)? {
            if let Err(err) = self.execute_checked(&rule.to_args("-D")) {
                warn!(rule = %rule.signature(), error = %err, "rule_delete_failed");
                return Err(err);
            }
            removed += 1;
        }
        Ok(removed)
    }
}
