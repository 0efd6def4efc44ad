use crate::config::FilterRule;
use crate::enrich::is_local_ip;
use crate::error::FlowMetricsError;
use crate::flow::Flow;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

type FilterFn = Box<dyn Fn(&Flow) -> bool + Send + Sync>;

/// One compiled filter rule. A matching flow is dropped by the pipeline.
pub struct FlowMatcher {
    predicate: FilterFn,
}

impl FlowMatcher {
    /// Compiles a configured rule into a predicate. Exactly one rule variant
    /// must be set; malformed literals fail here, at startup.
    pub fn compile(rule: &FilterRule) -> crate::Result<Self> {
        if rule.local_to_local == Some(true) {
            return Ok(Self::local_to_local());
        }
        if let Some(cidr) = &rule.cidr {
            return Self::cidr(&rule.match_attr, cidr);
        }
        if let Some(ip) = &rule.is {
            return Ok(Self::is_ip(&rule.match_attr, ip));
        }
        if let Some(literal) = &rule.is_uint32 {
            return Self::is_uint32(&rule.match_attr, literal);
        }
        Err(FlowMetricsError::InvalidFilter(format!(
            "rule on {:?} selects no variant (expected one of cidr, is, is_uint32, local_to_local)",
            rule.match_attr
        )))
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        (self.predicate)(flow)
    }

    fn cidr(attr: &str, cidr: &str) -> crate::Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|e| FlowMetricsError::InvalidFilter(format!("bad CIDR {cidr:?}: {e}")))?;
        let attr = attr.to_string();
        Ok(Self {
            predicate: Box::new(move |flow| match flow.as_ip(&attr) {
                Some(ip) => net.contains(&ip),
                None => false,
            }),
        })
    }

    fn is_ip(attr: &str, literal: &str) -> Self {
        // An unparsable literal only matches flows that also lack the
        // attribute, mirroring the nil-equals-nil semantics of the rule.
        let want: Option<Ipv4Addr> = literal.parse().ok();
        let attr = attr.to_string();
        Self {
            predicate: Box::new(move |flow| match (flow.as_ip(&attr), want) {
                (None, None) => true,
                (Some(have), Some(want)) => have == want,
                _ => false,
            }),
        }
    }

    fn is_uint32(attr: &str, literal: &str) -> crate::Result<Self> {
        let want: u32 = literal.parse().map_err(|_| {
            FlowMetricsError::InvalidFilter(format!("bad uint32 literal {literal:?}"))
        })?;
        let attr = attr.to_string();
        Ok(Self {
            predicate: Box::new(move |flow| flow.as_u32(&attr) == Some(want)),
        })
    }

    fn local_to_local() -> Self {
        Self {
            predicate: Box::new(|flow| {
                matches!(flow.as_ip("source_ip"), Some(src) if is_local_ip(src))
                    && matches!(flow.as_ip("destination_ip"), Some(dst) if is_local_ip(dst))
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_fn(predicate: impl Fn(&Flow) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(attr: &str) -> FilterRule {
        FilterRule {
            match_attr: attr.to_string(),
            cidr: None,
            is: None,
            is_uint32: None,
            local_to_local: None,
        }
    }

    fn flow_with_source(ip: [u8; 4]) -> Flow {
        let mut flow = Flow::new();
        flow.add_attr("source_ip", Ipv4Addr::from(ip));
        flow
    }

    #[test]
    fn cidr_rule_matches_subnet() {
        let mut r = rule("source_ip");
        r.cidr = Some("192.168.1.0/24".to_string());
        let matcher = FlowMatcher::compile(&r).unwrap();

        assert!(matcher.matches(&flow_with_source([192, 168, 1, 14])));
        assert!(!matcher.matches(&flow_with_source([10, 11, 12, 13])));
    }

    #[test]
    fn cidr_rule_never_matches_missing_attribute() {
        let mut r = rule("source_ip");
        r.cidr = Some("0.0.0.0/0".to_string());
        let matcher = FlowMatcher::compile(&r).unwrap();
        assert!(!matcher.matches(&Flow::new()));
    }

    #[test]
    fn invalid_cidr_fails_to_compile() {
        let mut r = rule("source_ip");
        r.cidr = Some("300.0.0.0/24".to_string());
        assert!(FlowMatcher::compile(&r).is_err());
    }

    #[test]
    fn is_rule_requires_equality() {
        let mut r = rule("source_ip");
        r.is = Some("192.168.1.14".to_string());
        let matcher = FlowMatcher::compile(&r).unwrap();

        assert!(matcher.matches(&flow_with_source([192, 168, 1, 14])));
        assert!(!matcher.matches(&flow_with_source([10, 11, 12, 13])));
        assert!(!matcher.matches(&Flow::new()));
    }

    #[test]
    fn is_rule_with_bad_literal_matches_only_missing_attribute() {
        let mut r = rule("source_ip");
        r.is = Some("not-an-ip".to_string());
        let matcher = FlowMatcher::compile(&r).unwrap();

        assert!(matcher.matches(&Flow::new()));
        assert!(!matcher.matches(&flow_with_source([10, 11, 12, 13])));
    }

    #[test]
    fn is_uint32_rule() {
        let mut r = rule("source_as");
        r.is_uint32 = Some("10".to_string());
        let matcher = FlowMatcher::compile(&r).unwrap();

        let mut flow = Flow::new();
        flow.add_attr("source_as", 10u32);
        assert!(matcher.matches(&flow));

        flow.add_attr("source_as", 11u32);
        assert!(!matcher.matches(&flow));
        assert!(!matcher.matches(&Flow::new()));
    }

    #[test]
    fn is_uint32_rule_with_bad_literal_fails_to_compile() {
        let mut r = rule("source_as");
        r.is_uint32 = Some("ten".to_string());
        assert!(FlowMatcher::compile(&r).is_err());
    }

    #[test]
    fn local_to_local_rule() {
        let mut r = rule("");
        r.local_to_local = Some(true);
        let matcher = FlowMatcher::compile(&r).unwrap();

        let mut both_local = Flow::new();
        both_local.add_attr("source_ip", Ipv4Addr::new(192, 168, 0, 10));
        both_local.add_attr("destination_ip", Ipv4Addr::new(10, 0, 0, 1));
        assert!(matcher.matches(&both_local));

        let mut one_remote = Flow::new();
        one_remote.add_attr("source_ip", Ipv4Addr::new(192, 168, 0, 10));
        one_remote.add_attr("destination_ip", Ipv4Addr::new(8, 8, 8, 8));
        assert!(!matcher.matches(&one_remote));

        assert!(!matcher.matches(&Flow::new()));
    }

    #[test]
    fn empty_rule_fails_to_compile() {
        assert!(FlowMatcher::compile(&rule("source_ip")).is_err());
    }
}
