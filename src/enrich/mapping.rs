use super::Enricher;
use crate::config::EnricherOptions;
use crate::error::FlowMetricsError;
use crate::flow::Flow;
use std::collections::HashMap;

/// Maps interface indices to human names via a configured table. The whole
/// options table is the mapping, keyed by the index in base 10.
#[derive(Default)]
pub struct InterfaceName {
    mapping: HashMap<String, String>,
}

impl Enricher for InterfaceName {
    fn configure(&mut self, opts: &EnricherOptions) -> crate::Result<()> {
        self.mapping.clear();
        for (key, value) in opts {
            let name = value.as_str().ok_or_else(|| {
                FlowMetricsError::InvalidConfig(format!(
                    "interface_mapper: value for index {key:?} must be a string"
                ))
            })?;
            self.mapping.insert(key.clone(), name.to_string());
        }
        Ok(())
    }

    fn enrich(&self, flow: &mut Flow) {
        for (attr, dest) in [
            ("input_interface", "input_interface_name"),
            ("output_interface", "output_interface_name"),
        ] {
            if let Some(index) = flow.as_u32(attr) {
                if let Some(name) = self.mapping.get(&index.to_string()) {
                    flow.add_attr(dest, name.as_str());
                }
            }
        }
    }
}

/// Names well-known IP protocol numbers; everything else becomes
/// `other (<n>)`.
pub struct ProtocolName;

impl Enricher for ProtocolName {
    fn enrich(&self, flow: &mut Flow) {
        if let Some(proto) = flow.as_u32("proto") {
            let name = match proto {
                1 => "icmp".to_string(),
                2 => "igmp".to_string(),
                6 => "tcp".to_string(),
                17 => "udp".to_string(),
                n => format!("other ({n})"),
            };
            flow.add_attr("proto_name", name);
        }
    }
}

/// Maps endpoint addresses to configured aliases. Unlike the other
/// enrichers this one always writes its attributes, falling back to
/// `"unknown"` so the alias labels never go missing.
#[derive(Default)]
pub struct HostAlias {
    aliases: HashMap<String, String>,
}

impl HostAlias {
    fn alias_attr(&self, flow: &mut Flow, attr: &str, dest: &str) {
        if let Some(ip) = flow.as_ip(attr) {
            if let Some(alias) = self.aliases.get(&ip.to_string()) {
                flow.add_attr(dest, alias.as_str());
                return;
            }
        }
        flow.add_attr(dest, "unknown");
    }
}

impl Enricher for HostAlias {
    fn configure(&mut self, opts: &EnricherOptions) -> crate::Result<()> {
        self.aliases.clear();
        if let Some(value) = opts.get("alias_map") {
            let table = value.as_table().ok_or_else(|| {
                FlowMetricsError::InvalidConfig("host_alias: alias_map must be a table".to_string())
            })?;
            for (ip, alias) in table {
                let alias = alias.as_str().ok_or_else(|| {
                    FlowMetricsError::InvalidConfig(format!(
                        "host_alias: alias for {ip:?} must be a string"
                    ))
                })?;
                self.aliases.insert(ip.clone(), alias.to_string());
            }
        }
        Ok(())
    }

    fn enrich(&self, flow: &mut Flow) {
        self.alias_attr(flow, "source_ip", "source_host_alias");
        self.alias_attr(flow, "destination_ip", "destination_host_alias");
    }
}
