//! Gateway mode switch: IP forwarding plus NAT masquerade for a designated
//! internal interface. Separate from the performance-tuning pipeline and
//! gated behind explicit operator intent; every step here is fatal except
//! the final MTU clamp, since forwarding without NAT (or the reverse) is a
//! useless half-state.

use std::fs;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use relaytune_netfilter::{Chain, Firewall, Rule, Table, Target};

use crate::error::{Result, TuneError};
use crate::persist;
use crate::probe::{HostProfile, Platform};
use crate::tuner::SystemTuner;

/// Safe-for-tunnels default, matching the relay's outer-packet overhead.
pub const DEFAULT_GATEWAY_MTU: u32 = 1280;

/// Operator-supplied gateway parameters; nothing here is discovered.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    pub internal_interface: String,
    pub internal_subnet: Ipv4Net,
    pub mtu: u32,
    /// Where the forwarding sysctl is persisted across reboots.
    #[serde(skip)]
    pub persist_path: PathBuf,
}

impl GatewayConfig {
    pub fn new(internal_interface: &str, internal_subnet: Ipv4Net, mtu: u32) -> Self {
        Self {
            internal_interface: internal_interface.to_string(),
            internal_subnet,
            mtu,
            persist_path: PathBuf::from(persist::SYSCTL_PERSIST_PATH),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayOutcome {
    pub wan_interface: String,
    pub internal_interface: String,
    pub internal_subnet: Ipv4Net,
    /// False when the internal interface did not exist yet; whatever
    /// brings it up later owns the MTU.
    pub mtu_clamped: bool,
    pub forwarding_persisted: bool,
}

pub fn enable_gateway(
    config: &GatewayConfig,
    profile: &HostProfile,
    tuner: &dyn SystemTuner,
    firewall: &dyn Firewall,
) -> Result<GatewayOutcome> {
    if profile.platform != Platform::Linux {
        return Err(TuneError::UnsupportedPlatform(
            "gateway mode requires Linux".to_string(),
        ));
    }

    tuner.write_sysctl("net.ipv4.ip_forward", "1")?;
    let forwarding_persisted = match persist::persist_ip_forward(&config.persist_path) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "forwarding_persist_failed");
            false
        }
    };

    relax_rp_filter(tuner);

    let wan_interface = profile.primary_interface.clone().ok_or_else(|| {
        TuneError::System("cannot resolve WAN interface: no default route".to_string())
    })?;

    // Flush any masquerade left by a previous run before installing, so
    // repeated switch-ons converge on exactly one rule.
    let masquerade = Rule::new(Table::Nat, Chain::Postrouting, Target::Masquerade)
        .source_subnet(config.internal_subnet)
        .out_interface(&wan_interface);
    let removed = firewall.delete_all(&masquerade)?;
    if removed > 0 {
        debug!(removed, "stale_masquerade_rules_flushed");
    }
    firewall.append(&masquerade)?;

    let forward_out = Rule::new(Table::Filter, Chain::Forward, Target::Accept)
        .in_interface(&config.internal_interface)
        .out_interface(&wan_interface);
    let forward_in = Rule::new(Table::Filter, Chain::Forward, Target::Accept)
        .in_interface(&wan_interface)
        .out_interface(&config.internal_interface)
        .connection_state("RELATED,ESTABLISHED");
    firewall.ensure(&forward_out)?;
    firewall.ensure(&forward_in)?;

    let mtu_clamped = match tuner.set_interface_mtu(&config.internal_interface, config.mtu) {
        Ok(()) => true,
        Err(err) => {
            // The internal interface may not exist yet at switch-on time.
            warn!(
                iface = %config.internal_interface,
                error = %err,
                "mtu_clamp_deferred"
            );
            false
        }
    };

    info!(
        wan = %wan_interface,
        internal = %config.internal_interface,
        subnet = %config.internal_subnet,
        "gateway_mode_enabled"
    );

    Ok(GatewayOutcome {
        wan_interface,
        internal_interface: config.internal_interface.clone(),
        internal_subnet: config.internal_subnet,
        mtu_clamped,
        forwarding_persisted,
    })
}

/// Strict reverse-path filtering drops asymmetric relay traffic; relax it
/// on every interface. Best-effort, matching the forwarding semantics of
/// the relay this prepares for.
fn relax_rp_filter(tuner: &dyn SystemTuner) {
    let entries = match fs::read_dir("/proc/sys/net/ipv4/conf") {
        Ok(entries) => entries,
        Err(err) => {
            debug!(error = %err, "rp_filter_listing_unavailable");
            return;
        }
    };

    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let key = format!("net.ipv4.conf.{name}.rp_filter");
        if let Err(err) = tuner.write_sysctl(&key, "0") {
            debug!(key = %key, error = %err, "rp_filter_relax_skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::tests::MockTuner;
    use relaytune_netfilter::Result as FwResult;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct MockFirewall {
        rules: Mutex<Vec<String>>,
    }

    impl MockFirewall {
        fn new() -> Self {
            Self {
                rules: Mutex::new(Vec::new()),
            }
        }

        fn rules(&self) -> Vec<String> {
            self.rules.lock().unwrap().clone()
        }
    }

    impl Firewall for MockFirewall {
        fn contains(&self, rule: &Rule) -> FwResult<bool> {
            Ok(self.rules.lock().unwrap().contains(&rule.signature()))
        }

        fn append(&self, rule: &Rule) -> FwResult<()> {
            self.rules.lock().unwrap().push(rule.signature());
            Ok(())
        }

        fn delete_all(&self, rule: &Rule) -> FwResult<usize> {
            let mut rules = self.rules.lock().unwrap();
            let before = rules.len();
            rules.retain(|sig| sig != &rule.signature());
            Ok(before - rules.len())
        }
    }

    fn linux_profile(iface: Option<&str>) -> HostProfile {
        HostProfile {
            platform: Platform::Linux,
            primary_interface: iface.map(String::from),
            is_wireless: false,
            tools: BTreeMap::new(),
        }
    }

    fn config(dir: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
            internal_interface: "relay0".to_string(),
            internal_subnet: "10.13.13.0/24".parse().unwrap(),
            mtu: DEFAULT_GATEWAY_MTU,
            persist_path: dir.join("99-relaytune.conf"),
        }
    }

    #[test]
    fn enables_forwarding_and_installs_rules() {
        let dir = tempfile::tempdir().unwrap();
        let tuner = MockTuner::new();
        let firewall = MockFirewall::new();
        let profile = linux_profile(Some("eth0"));

        let outcome = enable_gateway(&config(dir.path()), &profile, &tuner, &firewall).unwrap();

        assert_eq!(outcome.wan_interface, "eth0");
        assert!(outcome.mtu_clamped);
        assert_eq!(
            tuner.sysctls.lock().unwrap().get("net.ipv4.ip_forward"),
            Some(&"1".to_string())
        );

        let rules = firewall.rules();
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().any(|r| r.contains("MASQUERADE")
            && r.contains("10.13.13.0/24")
            && r.contains("-o eth0")));
        assert!(rules
            .iter()
            .any(|r| r.contains("FORWARD") && r.contains("-i relay0") && r.contains("-o eth0")));
        assert!(rules.iter().any(|r| r.contains("RELATED,ESTABLISHED")));
    }

    #[test]
    fn repeated_enable_leaves_exactly_one_masquerade() {
        let tuner = MockTuner::new();
        let firewall = MockFirewall::new();
        let profile = linux_profile(Some("eth0"));

        let dir = tempfile::tempdir().unwrap();
        enable_gateway(&config(dir.path()), &profile, &tuner, &firewall).unwrap();
        enable_gateway(&config(dir.path()), &profile, &tuner, &firewall).unwrap();

        let masquerades = firewall
            .rules()
            .iter()
            .filter(|r| r.contains("MASQUERADE"))
            .count();
        assert_eq!(masquerades, 1);
        // Forward-accept rules are deduplicated via ensure as well.
        assert_eq!(firewall.rules().len(), 3);
    }

    #[test]
    fn missing_default_route_is_fatal() {
        let tuner = MockTuner::new();
        let firewall = MockFirewall::new();
        let profile = linux_profile(None);

        let dir = tempfile::tempdir().unwrap();
        let err = enable_gateway(&config(dir.path()), &profile, &tuner, &firewall).unwrap_err();
        assert!(matches!(err, TuneError::System(_)));
        assert!(firewall.rules().is_empty());
    }

    #[test]
    fn forwarding_failure_aborts_before_any_rule() {
        let tuner = MockTuner::new();
        tuner.mark_sysctl_missing("net.ipv4.ip_forward");
        let firewall = MockFirewall::new();
        let profile = linux_profile(Some("eth0"));

        let dir = tempfile::tempdir().unwrap();
        assert!(enable_gateway(&config(dir.path()), &profile, &tuner, &firewall).is_err());
        assert!(firewall.rules().is_empty());
    }

    #[test]
    fn mtu_clamp_failure_is_tolerated() {
        let tuner = MockTuner::new();
        tuner.fail("set_interface_mtu");
        let firewall = MockFirewall::new();
        let profile = linux_profile(Some("eth0"));

        let dir = tempfile::tempdir().unwrap();
        let outcome = enable_gateway(&config(dir.path()), &profile, &tuner, &firewall).unwrap();
        assert!(!outcome.mtu_clamped);
        assert_eq!(firewall.rules().len(), 3);
    }

    #[test]
    fn rejects_non_linux_profile() {
        let tuner = MockTuner::new();
        let firewall = MockFirewall::new();
        let profile = HostProfile {
            platform: Platform::Darwin,
            primary_interface: None,
            is_wireless: false,
            tools: BTreeMap::new(),
        };

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            enable_gateway(&config(dir.path()), &profile, &tuner, &firewall),
            Err(TuneError::UnsupportedPlatform(_))
        ));
    }
}
