//! Which flows are tapped, and the capture filter that follows from it

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{TappedPod, TapperConfig};

/// Above this many pods the capture filter stops listing hosts.
pub const BPF_FILTER_MAX_PODS: usize = 150;

/// Properties of a new flow decided from its first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDecision {
    pub is_tap_target: bool,
    pub is_outgoing:   bool,
}

#[derive(Debug, Default)]
struct TargetState {
    app_ports: Vec<u16>,
    pods:      HashMap<IpAddr, TappedPod>,
}

/// Live tap-target policy. Control messages replace ports and pods; flows
/// already tracked keep the decision they were created with.
#[derive(Debug)]
pub struct TargetPolicy {
    state:         RwLock<TargetState>,
    host_mode:     bool,
    ignored_ports: HashSet<u16>,
    own_addresses: HashSet<IpAddr>,
}

impl TargetPolicy {
    pub fn new(config: &TapperConfig) -> Self {
        Self::with_own_addresses(config, local_addresses())
    }

    pub fn with_own_addresses(config: &TapperConfig, own_addresses: HashSet<IpAddr>) -> Self {
        let policy = Self {
            state: RwLock::new(TargetState::default()),
            host_mode: config.host_mode,
            ignored_ports: config.ignored_ports.iter().copied().collect(),
            own_addresses,
        };
        policy.set_ports(config.app_ports.clone());
        policy.set_pods(config.tapped_pods.clone());
        policy
    }

    pub fn host_mode(&self) -> bool {
        self.host_mode
    }

    /// Packets to or from an ignored port never reach the assembler.
    pub fn is_ignored(&self, src_port: u16, dst_port: u16) -> bool {
        self.ignored_ports.contains(&src_port) || self.ignored_ports.contains(&dst_port)
    }

    /// Decide tap-target and direction for a flow from its client side.
    pub fn classify(&self, src: IpAddr, dst: IpAddr, dst_port: u16) -> TargetDecision {
        let state = self.state.read();
        if self.host_mode {
            if state.pods.contains_key(&dst) {
                return TargetDecision {
                    is_tap_target: true,
                    is_outgoing:   false,
                };
            }
            if state.pods.contains_key(&src) {
                return TargetDecision {
                    is_tap_target: true,
                    is_outgoing:   true,
                };
            }
            return TargetDecision {
                is_tap_target: false,
                is_outgoing:   false,
            };
        }

        let tapped_port =
            state.app_ports.is_empty() || dst_port == 80 || state.app_ports.contains(&dst_port);
        TargetDecision {
            is_tap_target: tapped_port,
            is_outgoing:   tapped_port && !self.own_addresses.contains(&dst),
        }
    }

    pub fn set_ports(&self, ports: Vec<u16>) {
        info!(event.name = "target.ports_updated", ?ports, "application ports updated");
        self.state.write().app_ports = ports;
    }

    pub fn set_pods(&self, pods: Vec<TappedPod>) {
        let mut state = self.state.write();
        state.pods = pods.into_iter().map(|p| (p.ip, p)).collect();
        info!(
            event.name = "target.pods_updated",
            count = state.pods.len(),
            "tapped pods updated"
        );
    }

    pub fn pods(&self) -> Vec<TappedPod> {
        let mut pods: Vec<TappedPod> = self.state.read().pods.values().cloned().collect();
        pods.sort_by_key(|p| p.ip);
        pods
    }

    pub fn pod(&self, ip: &IpAddr) -> Option<TappedPod> {
        self.state.read().pods.get(ip).cloned()
    }

    /// Capture filter for the current pod set, `None` when nothing should
    /// be filtered.
    pub fn bpf_filter(&self) -> Option<String> {
        bpf_filter_for(&self.pods())
    }
}

/// `(host a or host b) and port not 443` for small pod sets,
/// `port not 443` for large ones and no filter without pods.
pub fn bpf_filter_for(pods: &[TappedPod]) -> Option<String> {
    if pods.is_empty() {
        return None;
    }
    if pods.len() > BPF_FILTER_MAX_PODS {
        return Some("port not 443".to_string());
    }
    let hosts = pods
        .iter()
        .map(|p| format!("host {}", p.ip))
        .collect::<Vec<_>>()
        .join(" or ");
    Some(format!("({hosts}) and port not 443"))
}

/// Addresses configured on this host's interfaces.
fn local_addresses() -> HashSet<IpAddr> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!(event.name = "target.ifaddrs_failed", error = %e, "cannot list local addresses");
            return HashSet::new();
        },
    };
    addrs
        .filter_map(|ifa| ifa.address)
        .filter_map(|addr| {
            if let Some(v4) = addr.as_sockaddr_in() {
                Some(IpAddr::V4(v4.ip()))
            } else {
                addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
            }
        })
        .collect()
}
