//! Environment configuration

use std::{collections::BTreeMap, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use serde::Deserialize;
use tap_api::TrafficFilteringOptions;
use thiserror::Error;

use crate::assembler::AssemblerOptions;

pub const DEFAULT_HTTP2_DATA_SIZE_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var:    &'static str,
        value:  String,
        reason: String,
    },
    #[error("{var}: {source}")]
    Json {
        var:    &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A pod address as it appears in the per-node dictionary and in
/// `setAddresses`: a bare IP or an object with the pod's name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PodEntry {
    Ip(String),
    Pod {
        ip:        String,
        #[serde(default)]
        name:      String,
        #[serde(default)]
        namespace: String,
    },
}

/// A pod whose traffic is tapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TappedPod {
    pub ip:        IpAddr,
    pub name:      String,
    pub namespace: String,
}

impl TryFrom<PodEntry> for TappedPod {
    type Error = ConfigError;

    fn try_from(entry: PodEntry) -> Result<Self, ConfigError> {
        let (ip, name, namespace) = match entry {
            PodEntry::Ip(ip) => (ip, String::new(), String::new()),
            PodEntry::Pod {
                ip,
                name,
                namespace,
            } => (ip, name, namespace),
        };
        let parsed = ip.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            var:    "TAPPED_ADDRESSES_PER_NODE_DICT",
            value:  ip.clone(),
            reason: e.to_string(),
        })?;
        Ok(TappedPod {
            ip: parsed,
            name,
            namespace,
        })
    }
}

/// Parse pod entries, failing on the first bad address.
pub fn parse_pods(entries: Vec<PodEntry>) -> Result<Vec<TappedPod>, ConfigError> {
    entries.into_iter().map(TappedPod::try_from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarConfig {
    pub dir:         PathBuf,
    pub max_entries: usize,
}

/// Everything the tapper reads at startup.
#[derive(Debug, Clone)]
pub struct TapperConfig {
    pub app_ports:                Vec<u16>,
    pub web_socket_port:          Option<u16>,
    pub http2_data_size_limit:    usize,
    pub host_mode:                bool,
    pub node_name:                Option<String>,
    pub tapped_pods:              Vec<TappedPod>,
    pub filtering:                TrafficFilteringOptions,
    pub interface:                String,
    pub pcap_file:                Option<PathBuf>,
    pub service_mesh:             bool,
    pub procfs:                   PathBuf,
    pub api_server_address:       Option<String>,
    pub ipdefrag:                 bool,
    pub assembler:                AssemblerOptions,
    pub connection_timeout:       Duration,
    pub stream_channel_timeout:   Duration,
    pub close_timed_out_interval: Duration,
    pub clean_period:             Duration,
    pub stats_every:              Duration,
    pub max_live_streams:         usize,
    pub ignored_ports:            Vec<u16>,
    pub har:                      Option<HarConfig>,
    pub debug:                    bool,
}

impl Default for TapperConfig {
    fn default() -> Self {
        Self {
            app_ports:                Vec::new(),
            web_socket_port:          None,
            http2_data_size_limit:    DEFAULT_HTTP2_DATA_SIZE_LIMIT,
            host_mode:                false,
            node_name:                None,
            tapped_pods:              Vec::new(),
            filtering:                TrafficFilteringOptions::default(),
            interface:                "any".to_string(),
            pcap_file:                None,
            service_mesh:             false,
            procfs:                   PathBuf::from("/proc"),
            api_server_address:       None,
            ipdefrag:                 true,
            assembler:                AssemblerOptions::default(),
            connection_timeout:       Duration::from_secs(120),
            stream_channel_timeout:   Duration::from_millis(10_000),
            close_timed_out_interval: Duration::from_millis(1_000),
            clean_period:             Duration::from_secs(10),
            stats_every:              Duration::from_secs(60),
            max_live_streams:         500,
            ignored_ports:            Vec::new(),
            har:                      None,
            debug:                    false,
        }
    }
}

impl TapperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unset and empty variables
    /// take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("APP_PORTS") {
            config.app_ports = parse_ports("APP_PORTS", &v)?;
        }
        if let Some(v) = get("WEB_SOCKET_PORT") {
            config.web_socket_port = Some(parse_num("WEB_SOCKET_PORT", &v)?);
        }
        if let Some(v) = get("HTTP2_DATA_SIZE_LIMIT") {
            config.http2_data_size_limit = parse_num("HTTP2_DATA_SIZE_LIMIT", &v)?;
        }
        if let Some(v) = get("HOST_MODE") {
            config.host_mode = parse_flag("HOST_MODE", &v)?;
        }
        config.node_name = get("NODE_NAME");
        if let Some(v) = get("TAPPED_ADDRESSES_PER_NODE_DICT") {
            config.tapped_pods = parse_node_dict(&v, config.node_name.as_deref())?;
        }
        if let Some(v) = get("MIZU_FILTERING_OPTIONS") {
            config.filtering = TrafficFilteringOptions::from_json(&v).map_err(|source| {
                ConfigError::Json {
                    var: "MIZU_FILTERING_OPTIONS",
                    source,
                }
            })?;
        }
        if let Some(v) = get("TAPPER_INTERFACE") {
            config.interface = v;
        }
        config.pcap_file = get("TAPPER_PCAP_FILE").map(PathBuf::from);
        if let Some(v) = get("TAPPER_SERVICE_MESH") {
            config.service_mesh = parse_flag("TAPPER_SERVICE_MESH", &v)?;
        }
        if let Some(v) = get("TAPPER_PROCFS") {
            config.procfs = PathBuf::from(v);
        }
        config.api_server_address = get("API_SERVER_ADDRESS");
        if let Some(v) = get("TAPPER_IPDEFRAG") {
            config.ipdefrag = parse_flag("TAPPER_IPDEFRAG", &v)?;
        }

        let a = &mut config.assembler;
        if let Some(v) = get("TAPPER_ALLOW_MISSING_INIT") {
            a.allow_missing_init = parse_flag("TAPPER_ALLOW_MISSING_INIT", &v)?;
        }
        if let Some(v) = get("TAPPER_IGNORE_FSM_ERR") {
            a.ignore_fsm_err = parse_flag("TAPPER_IGNORE_FSM_ERR", &v)?;
        }
        if let Some(v) = get("TAPPER_NO_OPT_CHECK") {
            a.no_opt_check = parse_flag("TAPPER_NO_OPT_CHECK", &v)?;
        }
        if let Some(v) = get("TAPPER_CHECKSUM") {
            a.checksum = parse_flag("TAPPER_CHECKSUM", &v)?;
        }
        if let Some(v) = get("MAX_BUFFERED_PAGES_PER_CONNECTION") {
            a.max_buffered_pages_per_connection =
                parse_num("MAX_BUFFERED_PAGES_PER_CONNECTION", &v)?;
        }
        if let Some(v) = get("MAX_BUFFERED_PAGES_TOTAL") {
            a.max_buffered_pages_total = parse_num("MAX_BUFFERED_PAGES_TOTAL", &v)?;
        }

        if let Some(v) = get("STALE_TIMEOUT_SECS") {
            config.connection_timeout = Duration::from_secs(parse_num("STALE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("TCP_STREAM_CHANNEL_TIMEOUT_MS") {
            config.stream_channel_timeout =
                Duration::from_millis(parse_num("TCP_STREAM_CHANNEL_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("CLOSE_TIMEDOUT_TCP_STREAM_CHANNELS_INTERVAL_MS") {
            config.close_timed_out_interval = Duration::from_millis(parse_num(
                "CLOSE_TIMEDOUT_TCP_STREAM_CHANNELS_INTERVAL_MS",
                &v,
            )?);
        }
        if let Some(v) = get("CLEAN_PERIOD_SECS") {
            config.clean_period = Duration::from_secs(parse_num("CLEAN_PERIOD_SECS", &v)?);
        }
        if let Some(v) = get("STATS_EVERY_SECS") {
            config.stats_every = Duration::from_secs(parse_num("STATS_EVERY_SECS", &v)?);
        }
        if let Some(v) = get("MAX_LIVE_STREAMS") {
            config.max_live_streams = parse_num("MAX_LIVE_STREAMS", &v)?;
        }
        if let Some(v) = get("IGNORED_PORTS") {
            config.ignored_ports = parse_ports("IGNORED_PORTS", &v)?;
        }
        if let Some(dir) = get("HAR_OUTPUT_DIR") {
            let max_entries = match get("HAR_MAX_ENTRIES") {
                Some(v) => parse_num("HAR_MAX_ENTRIES", &v)?,
                None => 5000,
            };
            config.har = Some(HarConfig {
                dir: PathBuf::from(dir),
                max_entries,
            });
        }
        if let Some(v) = get("TAPPER_DEBUG") {
            config.debug = parse_flag("TAPPER_DEBUG", &v)?;
        }
        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_num<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(var, value, e))
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(invalid(var, value, "expected 0 or 1")),
    }
}

fn parse_ports(var: &'static str, value: &str) -> Result<Vec<u16>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| parse_num(var, p))
        .collect()
}

/// Pods of `node`, or of every node when no node name is configured.
fn parse_node_dict(raw: &str, node: Option<&str>) -> Result<Vec<TappedPod>, ConfigError> {
    let dict: BTreeMap<String, Vec<PodEntry>> =
        serde_json::from_str(raw).map_err(|source| ConfigError::Json {
            var: "TAPPED_ADDRESSES_PER_NODE_DICT",
            source,
        })?;
    let entries: Vec<PodEntry> = match node {
        Some(node) => dict.get(node).cloned().unwrap_or_default(),
        None => dict.into_values().flatten().collect(),
    };
    parse_pods(entries)
}
