use crate::config::LabelSpec;
use crate::error::FlowMetricsError;
use crate::flow::{AttrValue, Flow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Converter {
    Ipv4,
    Str,
    Uint32,
    Uint64,
    Static,
}

impl Converter {
    fn parse(kind: &str) -> crate::Result<Self> {
        match kind {
            "ipv4" => Ok(Converter::Ipv4),
            "str" => Ok(Converter::Str),
            "uint32" => Ok(Converter::Uint32),
            "uint64" => Ok(Converter::Uint64),
            "static" => Ok(Converter::Static),
            other => Err(FlowMetricsError::InvalidConfig(format!(
                "unknown label converter {other:?}"
            ))),
        }
    }
}

/// Renders one metric label value from a flow attribute.
///
/// Compiled once at startup from a [`LabelSpec`]; `apply` runs per flow. A
/// label declared with a converter that does not fit its attribute's type is
/// a configuration bug and aborts the process, it is not a per-flow
/// condition.
pub struct LabelProcessor {
    attr: String,
    converter: Converter,
    on_missing: String,
}

impl LabelProcessor {
    pub fn new(spec: &LabelSpec) -> crate::Result<Self> {
        let on_missing = match spec.on_missing.as_deref() {
            None | Some("empty_str") => String::new(),
            Some(literal) => literal.to_string(),
        };
        Ok(Self {
            attr: spec.value.clone(),
            converter: Converter::parse(&spec.converter)?,
            on_missing,
        })
    }

    pub fn apply(&self, flow: &Flow) -> String {
        if self.converter == Converter::Static {
            return self.attr.clone();
        }
        match flow.raw(&self.attr) {
            Some(value) => self.render(value),
            None => self.on_missing.clone(),
        }
    }

    fn render(&self, value: &AttrValue) -> String {
        match (self.converter, value) {
            (Converter::Ipv4, AttrValue::Ipv4(ip)) => ip.to_string(),
            (Converter::Str, AttrValue::Str(s)) => s.clone(),
            (Converter::Uint32, AttrValue::U32(v)) => v.to_string(),
            (Converter::Uint64, AttrValue::U64(v)) => v.to_string(),
            (converter, value) => panic!(
                "label attribute {:?} carries a {} value, not renderable with the {:?} converter",
                self.attr,
                value.type_name(),
                converter
            ),
        }
    }
}
