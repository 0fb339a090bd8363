//! Service-mesh sidecar discovery through procfs

use std::{
    collections::HashSet,
    fs,
    net::IpAddr,
    path::Path,
};

use tap_api::Capture;
use tracing::{debug, info};

use crate::config::TappedPod;

const ENVOY_BINARY: &str = "/envoy";
const LINKERD_BINARY: &str = "/linkerd2-proxy";
const ISTIO_ENV_PREFIX: &str = "ISTIO_META_";

/// A sidecar proxy belonging to a tapped pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub pid:     u32,
    pub capture: Capture,
    pub pod:     String,
}

fn environ(procfs: &Path, pid: &str) -> Option<Vec<(String, String)>> {
    let raw = fs::read(procfs.join(pid).join("environ")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter_map(|entry| {
                let entry = String::from_utf8_lossy(entry);
                let (name, value) = entry.split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect(),
    )
}

fn lookup<'a>(env: &'a [(String, String)], name: &str) -> Option<&'a str> {
    env.iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn check_pid(procfs: &Path, pid: &str, pods: &[TappedPod]) -> Option<Sidecar> {
    let exe = fs::read_link(procfs.join(pid).join("exe")).ok()?;
    let exe = exe.to_string_lossy();

    if exe.ends_with(ENVOY_BINARY) {
        let env = environ(procfs, pid)?;
        let Some(instance_ip) = lookup(&env, "INSTANCE_IP").filter(|ip| !ip.is_empty()) else {
            debug!(pid, "envoy process without INSTANCE_IP");
            return None;
        };
        let ip: IpAddr = instance_ip.parse().ok()?;
        let pod = pods.iter().find(|p| p.ip == ip)?;
        let capture = if env.iter().any(|(n, _)| n.starts_with(ISTIO_ENV_PREFIX)) {
            Capture::Istio
        } else {
            Capture::Envoy
        };
        return Some(Sidecar {
            pid: pid.parse().ok()?,
            capture,
            pod: pod.name.clone(),
        });
    }

    if exe.ends_with(LINKERD_BINARY) {
        let env = environ(procfs, pid)?;
        let pod_name = lookup(&env, "_pod_name").filter(|n| !n.is_empty())?;
        let pod = pods.iter().find(|p| p.name == pod_name)?;
        return Some(Sidecar {
            pid:     pid.parse().ok()?,
            capture: Capture::Linkerd,
            pod:     pod.name.clone(),
        });
    }
    None
}

/// Envoy, Istio and Linkerd proxies under `procfs` serving one of `pods`.
pub fn discover_sidecars(procfs: &Path, pods: &[TappedPod]) -> std::io::Result<Vec<Sidecar>> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut scanned = 0usize;
    for entry in fs::read_dir(procfs)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(pid) = name.to_str() else { continue };
        if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        scanned += 1;
        if let Some(sidecar) = check_pid(procfs, pid, pods)
            && seen.insert(sidecar.pid)
        {
            found.push(sidecar);
        }
    }
    found.sort_by_key(|s| s.pid);
    info!(
        event.name = "discovery.completed",
        procfs = %procfs.display(),
        scanned,
        sidecars = found.len(),
        "sidecar discovery finished"
    );
    Ok(found)
}
