use crate::debug;
use crate::diverter::execute::{CmdTemplate, TemplateError};
use crate::packet::Proto;
use bitvec::prelude::*;
use fnv::FnvHashMap;
use serde::{de, Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::net::{AddrParseError, IpAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Used for fast access to a set of every possible port, e.g. the global
/// port blacklists
pub type PortVec = BitArr!(for 65536, in u64, Msb0);

pub fn portvec_from(ports: &[u16]) -> PortVec {
    let mut vec = PortVec::ZERO;
    for port in ports {
        vec.set(usize::from(*port), true);
    }
    vec
}

pub fn portvec_contains(vec: &PortVec, port: u16) -> bool {
    vec.get(usize::from(port)).as_deref() == Some(&true)
}

pub fn portvec_insert(vec: &mut PortVec, port: u16) {
    vec.set(usize::from(port), true);
}

/// A pair of values keyed by forwardable protocol
#[derive(Clone, Copy, Debug, Default)]
pub struct PerProto<T> {
    pub tcp: T,
    pub udp: T,
}

impl<T> PerProto<T> {
    pub fn get(&self, proto: Proto) -> Option<&T> {
        match proto {
            Proto::Tcp => Some(&self.tcp),
            Proto::Udp => Some(&self.udp),
            Proto::Icmp => None,
        }
    }

    pub fn get_mut(&mut self, proto: Proto) -> Option<&mut T> {
        match proto {
            Proto::Tcp => Some(&mut self.tcp),
            Proto::Udp => Some(&mut self.udp),
            Proto::Icmp => None,
        }
    }
}

/// Deployment mode of the diverter
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NetworkMode {
    /// Analysis target runs on this machine; IP masquerade applies
    #[default]
    SingleHost,
    /// This machine is a gateway for a separate target
    MultiHost,
}

#[derive(Debug, Error)]
#[error("NetworkMode must be one of singlehost, multihost: {0}")]
pub struct NetworkModeFromStrError(String);

impl FromStr for NetworkMode {
    type Err = NetworkModeFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "singlehost" => Ok(NetworkMode::SingleHost),
            "multihost" => Ok(NetworkMode::MultiHost),
            _other => Err(NetworkModeFromStrError(s.to_owned())),
        }
    }
}

impl<'de> Deserialize<'de> for NetworkMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            NetworkMode::SingleHost => "SingleHost",
            NetworkMode::MultiHost => "MultiHost",
        })
    }
}

/// On-disk configuration: one `[diverter]` table and any number of
/// `[listeners.<name>]` tables
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub diverter: DiverterConfig,
    #[serde(default)]
    pub listeners: HashMap<String, ListenerConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Failed to read config file")]
    Read(#[from] io::Error),
    #[error("Failed to parse config file")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Load the config from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }
}

/// `[diverter]` section
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiverterConfig {
    pub networkmode: NetworkMode,
    pub redirectalltraffic: bool,
    pub defaulttcplistener: Option<String>,
    pub defaultudplistener: Option<String>,
    pub dumppackets: bool,
    pub dumppacketsfileprefix: String,
    pub blacklistportstcp: Vec<u16>,
    pub blacklistportsudp: Vec<u16>,
    pub processwhitelist: Option<String>,
    pub processblacklist: Option<String>,
    pub hostblacklist: Option<String>,
    pub debuglevel: Vec<String>,
    pub fixgateway: bool,
    pub fixdns: bool,
}

impl Default for DiverterConfig {
    fn default() -> Self {
        DiverterConfig {
            networkmode: NetworkMode::default(),
            redirectalltraffic: false,
            defaulttcplistener: None,
            defaultudplistener: None,
            dumppackets: false,
            dumppacketsfileprefix: String::from("packets"),
            blacklistportstcp: Vec::new(),
            blacklistportsudp: Vec::new(),
            processwhitelist: None,
            processblacklist: None,
            hostblacklist: None,
            debuglevel: Vec::new(),
            fixgateway: false,
            fixdns: false,
        }
    }
}

/// One `[listeners.<name>]` section
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    pub protocol: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub processwhitelist: Option<String>,
    #[serde(default)]
    pub processblacklist: Option<String>,
    #[serde(default)]
    pub hostwhitelist: Option<String>,
    #[serde(default)]
    pub hostblacklist: Option<String>,
    #[serde(default)]
    pub executecmd: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Protocol not defined for listener {0}")]
    MissingProtocol(String),
    #[error("Invalid protocol {proto} for listener {listener}")]
    InvalidProtocol { listener: String, proto: String },
    #[error("Listener {0} can't have both process whitelist and blacklist")]
    BothProcessLists(String),
    #[error("Listener {0} can't have both host whitelist and blacklist")]
    BothHostLists(String),
    #[error("Diverter can't have both process whitelist and blacklist")]
    BothGlobalProcessLists,
    #[error("No default {0} listener specified in the configuration")]
    MissingDefaultListener(Proto),
    #[error("No configuration exists for default {proto} listener {name}")]
    UnknownDefaultListener { proto: Proto, name: String },
    #[error("Incorrectly configured ExecuteCmd for listener {listener}: {source}")]
    BadExecuteTemplate {
        listener: String,
        source: TemplateError,
    },
    #[error("Bad IP literal {addr} in host list for {context}: {source}")]
    BadHostAddress {
        context: String,
        addr: String,
        source: AddrParseError,
    },
}

/// Everything the decision engine consults, compiled once at startup.
///
/// Per-port tables are flat maps keyed by `(Proto, port)`. The global port
/// blacklists sit behind a mutex because the FTP active-mode rule appends to
/// them at runtime.
pub struct FilterPolicy {
    pub single_host_mode: bool,
    pub redirect_all_traffic: bool,
    pub dump_packets: bool,
    pub pcap_prefix: String,
    pub fix_gateway: bool,
    pub fix_dns: bool,
    pub debug_mask: u32,
    /// Default listener port per protocol, if any
    pub default_listener: PerProto<Option<u16>>,
    /// Bound port -> hidden flag; a port is bound iff present
    pub bound_ports: FnvHashMap<(Proto, u16), bool>,
    pub blacklist_ports: Mutex<PerProto<PortVec>>,
    pub blacklist_processes: HashSet<String>,
    pub whitelist_processes: HashSet<String>,
    pub blacklist_hosts: HashSet<IpAddr>,
    pub port_process_whitelist: FnvHashMap<(Proto, u16), Vec<String>>,
    pub port_process_blacklist: FnvHashMap<(Proto, u16), Vec<String>>,
    pub port_host_whitelist: FnvHashMap<(Proto, u16), HashSet<IpAddr>>,
    pub port_host_blacklist: FnvHashMap<(Proto, u16), HashSet<IpAddr>>,
    pub port_execute: FnvHashMap<(Proto, u16), CmdTemplate>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        FilterPolicy {
            single_host_mode: true,
            redirect_all_traffic: false,
            dump_packets: false,
            pcap_prefix: String::from("packets"),
            fix_gateway: false,
            fix_dns: false,
            debug_mask: 0,
            default_listener: PerProto::default(),
            bound_ports: FnvHashMap::default(),
            blacklist_ports: Mutex::new(PerProto {
                tcp: PortVec::ZERO,
                udp: PortVec::ZERO,
            }),
            blacklist_processes: HashSet::new(),
            whitelist_processes: HashSet::new(),
            blacklist_hosts: HashSet::new(),
            port_process_whitelist: FnvHashMap::default(),
            port_process_blacklist: FnvHashMap::default(),
            port_host_whitelist: FnvHashMap::default(),
            port_host_blacklist: FnvHashMap::default(),
            port_execute: FnvHashMap::default(),
        }
    }
}

impl FilterPolicy {
    /// Validate the configuration and compile it into the lookup structures
    /// the per-packet path uses. All conflicts are fatal here, never later.
    pub fn compile(config: &Config) -> Result<Self, ConfigError> {
        let mut policy = FilterPolicy::default();
        let diverter = &config.diverter;

        policy.single_host_mode = diverter.networkmode == NetworkMode::SingleHost;
        policy.redirect_all_traffic = diverter.redirectalltraffic;
        policy.dump_packets = diverter.dumppackets;
        policy.pcap_prefix = diverter.dumppacketsfileprefix.clone();
        policy.fix_gateway = diverter.fixgateway;
        policy.fix_dns = diverter.fixdns;
        policy.debug_mask = debug::parse_labels(&diverter.debuglevel);

        if diverter.processwhitelist.is_some() && diverter.processblacklist.is_some() {
            return Err(ConfigError::BothGlobalProcessLists);
        }
        if let Some(list) = &diverter.processblacklist {
            policy.blacklist_processes = split_csv(list).into_iter().collect();
        }
        if let Some(list) = &diverter.processwhitelist {
            policy.whitelist_processes = split_csv(list).into_iter().collect();
        }
        if let Some(list) = &diverter.hostblacklist {
            policy.blacklist_hosts = parse_host_list(list, "the diverter host blacklist")?;
        }
        policy.blacklist_ports = Mutex::new(PerProto {
            tcp: portvec_from(&diverter.blacklistportstcp),
            udp: portvec_from(&diverter.blacklistportsudp),
        });

        // Listener sections: names are matched case-insensitively
        let listeners: HashMap<String, &ListenerConfig> = config
            .listeners
            .iter()
            .map(|(name, listener)| (name.to_lowercase(), listener))
            .collect();

        for (name, listener) in &listeners {
            let proto_str = listener
                .protocol
                .as_deref()
                .ok_or_else(|| ConfigError::MissingProtocol(name.clone()))?;
            let proto = proto_str
                .parse::<Proto>()
                .ok()
                .filter(|proto| matches!(proto, Proto::Tcp | Proto::Udp))
                .ok_or_else(|| ConfigError::InvalidProtocol {
                    listener: name.clone(),
                    proto: proto_str.to_owned(),
                })?;
            let port = listener.port;

            policy.bound_ports.insert((proto, port), listener.hidden);

            if listener.processwhitelist.is_some() && listener.processblacklist.is_some() {
                return Err(ConfigError::BothProcessLists(name.clone()));
            }
            if let Some(list) = &listener.processwhitelist {
                policy
                    .port_process_whitelist
                    .insert((proto, port), split_csv(list));
            }
            if let Some(list) = &listener.processblacklist {
                policy
                    .port_process_blacklist
                    .insert((proto, port), split_csv(list));
            }

            if listener.hostwhitelist.is_some() && listener.hostblacklist.is_some() {
                return Err(ConfigError::BothHostLists(name.clone()));
            }
            if let Some(list) = &listener.hostwhitelist {
                policy
                    .port_host_whitelist
                    .insert((proto, port), parse_host_list(list, name)?);
            }
            if let Some(list) = &listener.hostblacklist {
                policy
                    .port_host_blacklist
                    .insert((proto, port), parse_host_list(list, name)?);
            }

            if let Some(template) = &listener.executecmd {
                let template = CmdTemplate::new(template.trim()).map_err(|source| {
                    ConfigError::BadExecuteTemplate {
                        listener: name.clone(),
                        source,
                    }
                })?;
                policy.port_execute.insert((proto, port), template);
            }
        }

        // Traffic can only be redirected somewhere if default listeners exist
        if diverter.redirectalltraffic {
            policy.default_listener.tcp = Some(resolve_default_listener(
                Proto::Tcp,
                diverter.defaulttcplistener.as_deref(),
                &listeners,
            )?);
            policy.default_listener.udp = Some(resolve_default_listener(
                Proto::Udp,
                diverter.defaultudplistener.as_deref(),
                &listeners,
            )?);
        }

        Ok(policy)
    }
}

fn resolve_default_listener(
    proto: Proto,
    name: Option<&str>,
    listeners: &HashMap<String, &ListenerConfig>,
) -> Result<u16, ConfigError> {
    let name = name.ok_or(ConfigError::MissingDefaultListener(proto))?;
    let listener = listeners.get(&name.to_lowercase()).ok_or_else(|| {
        ConfigError::UnknownDefaultListener {
            proto,
            name: name.to_owned(),
        }
    })?;
    Ok(listener.port)
}

fn split_csv(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_host_list(list: &str, context: &str) -> Result<HashSet<IpAddr>, ConfigError> {
    split_csv(list)
        .into_iter()
        .map(|addr| {
            addr.parse::<IpAddr>()
                .map_err(|source| ConfigError::BadHostAddress {
                    context: context.to_owned(),
                    addr,
                    source,
                })
        })
        .collect()
}
