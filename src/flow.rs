use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// One attribute value carried by a [`Flow`].
///
/// The closed set of variants lets label converters match exhaustively, so a
/// converter applied to an attribute of the wrong type is an explicit,
/// detectable condition rather than a stray downcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Ipv4(Ipv4Addr),
    U32(u32),
    U64(u64),
    Str(String),
}

impl AttrValue {
    /// Human-readable type tag, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Ipv4(_) => "ipv4",
            AttrValue::U32(_) => "uint32",
            AttrValue::U64(_) => "uint64",
            AttrValue::Str(_) => "string",
        }
    }
}

impl From<Ipv4Addr> for AttrValue {
    fn from(v: Ipv4Addr) -> Self {
        AttrValue::Ipv4(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::U32(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::U64(v)
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

/// Normalized attribute bag for one decoded flow record.
///
/// Built once per received record, filtered read-only, mutated append-only by
/// the enricher chain, consumed read-only by the metric entries and discarded
/// when the pipeline call returns. Absence of a key is distinct from a zero
/// value.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    attrs: HashMap<String, AttrValue>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an attribute value.
    pub fn add_attr(&mut self, attr: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(attr.into(), value.into());
    }

    /// Attribute value as an IPv4 address, `None` on absence or type mismatch.
    pub fn as_ip(&self, attr: &str) -> Option<Ipv4Addr> {
        match self.attrs.get(attr) {
            Some(AttrValue::Ipv4(ip)) => Some(*ip),
            _ => None,
        }
    }

    /// Attribute value as a u32, `None` on absence or type mismatch.
    pub fn as_u32(&self, attr: &str) -> Option<u32> {
        match self.attrs.get(attr) {
            Some(AttrValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Attribute value as a u64, `None` on absence or type mismatch.
    pub fn as_u64(&self, attr: &str) -> Option<u64> {
        match self.attrs.get(attr) {
            Some(AttrValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    /// Attribute value as a string slice, `None` on absence or type mismatch.
    pub fn as_str(&self, attr: &str) -> Option<&str> {
        match self.attrs.get(attr) {
            Some(AttrValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Raw attribute value.
    pub fn raw(&self, attr: &str) -> Option<&AttrValue> {
        self.attrs.get(attr)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// Record type discriminator of a decoded flow message. Only NetFlow v5
/// records are processed; everything else is silently ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    #[default]
    NetflowV5,
    Other,
}

/// Decoded flow record as handed over by the upstream record source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMessage {
    #[serde(default)]
    pub kind: RecordKind,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    #[serde(default)]
    pub src_as: u32,
    #[serde(default)]
    pub dst_as: u32,
    #[serde(default)]
    pub proto: u32,
    #[serde(default)]
    pub src_port: u32,
    #[serde(default)]
    pub dst_port: u32,
    #[serde(default)]
    pub in_if: u32,
    #[serde(default)]
    pub out_if: u32,
    #[serde(default = "unspecified_addr")]
    pub next_hop: Ipv4Addr,
    #[serde(default = "unspecified_addr")]
    pub sampler_address: Ipv4Addr,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub packets: u64,
}

fn unspecified_addr() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl From<&FlowMessage> for Flow {
    fn from(msg: &FlowMessage) -> Self {
        let mut flow = Flow::new();
        flow.add_attr("source_ip", msg.src_addr);
        flow.add_attr("destination_ip", msg.dst_addr);
        // AS number 0 means "not reported", not a real AS
        if msg.src_as != 0 {
            flow.add_attr("source_as", msg.src_as);
        }
        if msg.dst_as != 0 {
            flow.add_attr("destination_as", msg.dst_as);
        }
        flow.add_attr("proto", msg.proto);
        flow.add_attr("source_port", msg.src_port);
        flow.add_attr("destination_port", msg.dst_port);
        flow.add_attr("input_interface", msg.in_if);
        flow.add_attr("output_interface", msg.out_if);
        flow.add_attr("next_hop", msg.next_hop);
        flow.add_attr("sampler", msg.sampler_address);
        flow.add_attr("bytes", msg.bytes);
        flow.add_attr("packets", msg.packets);
        flow
    }
}
