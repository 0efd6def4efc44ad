mod geoip;
mod mapping;
mod reverse_dns;

pub use geoip::{MaxmindAsn, MaxmindCountry};
pub use mapping::{HostAlias, InterfaceName, ProtocolName};
pub use reverse_dns::ReverseDns;

use crate::config::EnricherOptions;
use crate::error::FlowMetricsError;
use crate::flow::Flow;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// One stage of the enrichment chain.
///
/// `configure` runs once, before `start`, with the enricher's options table;
/// a malformed option aborts collector startup. `start` allocates resources
/// (database handles, background tasks) and must fail fast when one is
/// unavailable. `enrich` runs once per flow, concurrently across ingestion
/// workers; it only adds attributes and never fails — a lookup miss simply
/// leaves an attribute out or defaulted. `close` releases resources at
/// shutdown; its errors are reported but not fatal.
pub trait Enricher: Send + Sync {
    fn configure(&mut self, _opts: &EnricherOptions) -> crate::Result<()> {
        Ok(())
    }

    fn start(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn enrich(&self, flow: &mut Flow);

    fn close(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Instantiates an enricher by its registry name, `None` for unknown names.
pub fn create(name: &str) -> Option<Box<dyn Enricher>> {
    match name {
        "maxmind_country" => Some(Box::new(MaxmindCountry::new())),
        "maxmind_asn" => Some(Box::new(MaxmindAsn::new())),
        "interface_mapper" => Some(Box::<InterfaceName>::default()),
        "protocol_name" => Some(Box::new(ProtocolName)),
        "host_alias" => Some(Box::<HostAlias>::default()),
        "reverse_dns" => Some(Box::new(ReverseDns::new())),
        _ => None,
    }
}

/// Private, reserved, multicast and otherwise non-routable IPv4 ranges.
const LOCAL_CIDRS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "233.252.0.0/24",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

static LOCAL_NETS: OnceLock<Vec<Ipv4Net>> = OnceLock::new();

/// Whether an address falls inside the built-in local/reserved range table.
pub fn is_local_ip(ip: Ipv4Addr) -> bool {
    let nets = LOCAL_NETS.get_or_init(|| {
        LOCAL_CIDRS
            .iter()
            .map(|cidr| cidr.parse().expect("built-in CIDR table entries parse"))
            .collect()
    });
    nets.iter().any(|net| net.contains(&ip))
}

pub(crate) fn bool_option(
    opts: &EnricherOptions,
    enricher: &str,
    key: &str,
) -> crate::Result<Option<bool>> {
    match opts.get(key) {
        None => Ok(None),
        Some(value) => value.as_bool().map(Some).ok_or_else(|| {
            FlowMetricsError::InvalidConfig(format!("{enricher}: {key} must be a boolean"))
        }),
    }
}

pub(crate) fn string_option(
    opts: &EnricherOptions,
    enricher: &str,
    key: &str,
) -> crate::Result<Option<String>> {
    match opts.get(key) {
        None => Ok(None),
        Some(value) => value.as_str().map(|s| Some(s.to_string())).ok_or_else(|| {
            FlowMetricsError::InvalidConfig(format!("{enricher}: {key} must be a string"))
        }),
    }
}

pub(crate) fn seconds_option(
    opts: &EnricherOptions,
    enricher: &str,
    key: &str,
) -> crate::Result<Option<u64>> {
    match opts.get(key) {
        None => Ok(None),
        Some(value) => match value.as_integer() {
            Some(secs) if secs > 0 => Ok(Some(secs as u64)),
            _ => Err(FlowMetricsError::InvalidConfig(format!(
                "{enricher}: {key} must be a positive number of seconds"
            ))),
        },
    }
}
