use super::{bool_option, is_local_ip, seconds_option, Enricher};
use crate::config::EnricherOptions;
use crate::error::FlowMetricsError;
use crate::flow::Flow;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

const UNKNOWN: &str = "unknown";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Window within which a query line and its reply line are paired up.
const SESSION_TTL: Duration = Duration::from_secs(60);

type ResolverFn = Box<dyn Fn(Ipv4Addr) -> Option<String> + Send + Sync>;

struct PiholeTailer {
    child: Child,
    thread: Option<JoinHandle<()>>,
}

/// Adds `source_dns` / `destination_dns` via reverse resolution.
///
/// Resolutions are cached per IP for `cache_duration` with a strict TTL
/// (reads do not renew it, so a stale reverse mapping cannot keep itself
/// alive) and a loader that collapses concurrent misses for one key onto a
/// single blocking lookup. `lookup_local` / `lookup_remote` gate whether a
/// class of addresses is resolved at all; a disabled class is labeled
/// `"local"` / `"remote"` without a DNS call. With `ip_as_unknown` the
/// literal address stands in wherever `"unknown"` or a class literal would
/// be used. `tail_pihole` additionally streams the pihole query log and
/// answers lookups from the observed query/reply correlation first.
pub struct ReverseDns {
    ttl: Duration,
    lookup_local: bool,
    lookup_remote: bool,
    ip_as_unknown: bool,
    tail_pihole: bool,
    cache: Cache<String, String>,
    pihole_results: Cache<String, String>,
    resolver: ResolverFn,
    tailer: Mutex<Option<PiholeTailer>>,
}

impl ReverseDns {
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            lookup_local: false,
            lookup_remote: true,
            ip_as_unknown: false,
            tail_pihole: false,
            cache: Cache::builder().time_to_live(DEFAULT_CACHE_TTL).build(),
            pihole_results: Cache::builder().time_to_idle(DEFAULT_CACHE_TTL).build(),
            resolver: Box::new(system_lookup),
            tailer: Mutex::new(None),
        }
    }

    fn class_fallback(&self, ip: Ipv4Addr, class: &str) -> String {
        if self.ip_as_unknown {
            ip.to_string()
        } else {
            class.to_string()
        }
    }

    fn resolve(&self, ip: Ipv4Addr) -> String {
        let local = is_local_ip(ip);
        if local && !self.lookup_local {
            return self.class_fallback(ip, "local");
        }
        if !local && !self.lookup_remote {
            return self.class_fallback(ip, "remote");
        }

        let key = ip.to_string();
        if self.tail_pihole {
            if let Some(name) = self.pihole_results.get(&key) {
                return name;
            }
        }

        let resolved = self.cache.get_with(key, || {
            debug!(ip = %ip, "reverse lookup");
            match (self.resolver)(ip) {
                Some(name) => {
                    let name = name.trim_end_matches('.').to_string();
                    if name.is_empty() {
                        UNKNOWN.to_string()
                    } else {
                        name
                    }
                }
                None => UNKNOWN.to_string(),
            }
        });
        if resolved == UNKNOWN && self.ip_as_unknown {
            ip.to_string()
        } else {
            resolved
        }
    }
}

impl Default for ReverseDns {
    fn default() -> Self {
        Self::new()
    }
}

impl Enricher for ReverseDns {
    fn configure(&mut self, opts: &EnricherOptions) -> crate::Result<()> {
        if let Some(secs) = seconds_option(opts, "reverse_dns", "cache_duration")? {
            self.ttl = Duration::from_secs(secs);
        }
        if let Some(v) = bool_option(opts, "reverse_dns", "lookup_local")? {
            self.lookup_local = v;
        }
        if let Some(v) = bool_option(opts, "reverse_dns", "lookup_remote")? {
            self.lookup_remote = v;
        }
        if let Some(v) = bool_option(opts, "reverse_dns", "ip_as_unknown")? {
            self.ip_as_unknown = v;
        }
        if let Some(v) = bool_option(opts, "reverse_dns", "tail_pihole")? {
            self.tail_pihole = v;
        }
        Ok(())
    }

    fn start(&mut self) -> crate::Result<()> {
        self.cache = Cache::builder().time_to_live(self.ttl).build();

        if self.tail_pihole {
            self.pihole_results = Cache::builder().time_to_idle(self.ttl).build();
            info!("tailing pihole for DNS correlation");
            let mut child = Command::new("pihole")
                .arg("-t")
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()?;
            let stdout = child.stdout.take().ok_or_else(|| {
                FlowMetricsError::Enricher("pihole stdout is not captured".to_string())
            })?;
            let results = self.pihole_results.clone();
            let thread = std::thread::Builder::new()
                .name("pihole-tail".to_string())
                .spawn(move || tail_pihole(BufReader::new(stdout), results))?;
            *self.tailer.lock() = Some(PiholeTailer {
                child,
                thread: Some(thread),
            });
        }

        Ok(())
    }

    fn enrich(&self, flow: &mut Flow) {
        for (attr, dest) in [
            ("source_ip", "source_dns"),
            ("destination_ip", "destination_dns"),
        ] {
            if let Some(ip) = flow.as_ip(attr) {
                flow.add_attr(dest, self.resolve(ip));
            }
        }
    }

    fn close(&self) -> crate::Result<()> {
        if let Some(mut tailer) = self.tailer.lock().take() {
            let killed = tailer.child.kill();
            let _ = tailer.child.wait();
            if let Some(thread) = tailer.thread.take() {
                let _ = thread.join();
            }
            killed?;
        }
        Ok(())
    }
}

fn system_lookup(ip: Ipv4Addr) -> Option<String> {
    match dns_lookup::lookup_addr(&IpAddr::V4(ip)) {
        Ok(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Consumes pihole log lines until the stream ends, publishing correlated
/// query/answer pairs into `results`.
fn tail_pihole<R: BufRead>(reader: R, results: Cache<String, String>) {
    let sessions: Cache<String, String> = Cache::builder().time_to_idle(SESSION_TTL).build();
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        correlate_line(&line, &sessions, &results);
    }
    debug!("pihole stream closed");
}

/// Parses one dnsmasq-style log line. A `query` action stages the queried
/// hostname under its session id; a later `cached`/`reply` action for the
/// same session that names a concrete result address publishes
/// address -> hostname. CNAME placeholders are not addresses and are
/// skipped.
fn correlate_line(line: &str, sessions: &Cache<String, String>, results: &Cache<String, String>) {
    let bits: Vec<&str> = line.split_whitespace().collect();
    if bits.len() < 7 {
        return;
    }
    let session_id = bits[1];
    let action = bits[3];
    if action.starts_with("query") {
        sessions.insert(session_id.to_string(), bits[4].to_string());
    } else if (action == "cached" || action == "reply") && bits[5] == "is" && bits[6] != "<CNAME>" {
        if let Some(query) = sessions.get(session_id) {
            debug!(query = %query, result = bits[6], "correlated pihole answer");
            results.insert(bits[6].to_string(), query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn local_ip() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 0, 10)
    }

    fn remote_ip() -> Ipv4Addr {
        Ipv4Addr::new(8, 8, 8, 8)
    }

    fn panicking_resolver() -> ResolverFn {
        Box::new(|ip| panic!("unexpected lookup of {ip}"))
    }

    #[test]
    fn local_addresses_are_not_resolved_by_default() {
        let mut rdns = ReverseDns::new();
        rdns.resolver = panicking_resolver();
        assert_eq!(rdns.resolve(local_ip()), "local");
    }

    #[test]
    fn disabled_remote_lookup_yields_class_literal() {
        let mut rdns = ReverseDns::new();
        rdns.lookup_remote = false;
        rdns.resolver = panicking_resolver();
        assert_eq!(rdns.resolve(remote_ip()), "remote");
    }

    #[test]
    fn ip_as_unknown_replaces_class_literals() {
        let mut rdns = ReverseDns::new();
        rdns.lookup_remote = false;
        rdns.ip_as_unknown = true;
        rdns.resolver = panicking_resolver();
        assert_eq!(rdns.resolve(local_ip()), "192.168.0.10");
        assert_eq!(rdns.resolve(remote_ip()), "8.8.8.8");
    }

    #[test]
    fn failed_lookup_falls_back_to_unknown() {
        let mut rdns = ReverseDns::new();
        rdns.resolver = Box::new(|_| None);
        assert_eq!(rdns.resolve(remote_ip()), "unknown");
    }

    #[test]
    fn failed_lookup_with_ip_as_unknown_uses_the_address() {
        let mut rdns = ReverseDns::new();
        rdns.ip_as_unknown = true;
        rdns.resolver = Box::new(|_| None);
        assert_eq!(rdns.resolve(remote_ip()), "8.8.8.8");
    }

    #[test]
    fn resolved_names_are_trimmed_and_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut rdns = ReverseDns::new();
        rdns.resolver = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some("dns.google.".to_string())
        });

        assert_eq!(rdns.resolve(remote_ip()), "dns.google");
        assert_eq!(rdns.resolve(remote_ip()), "dns.google");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lookup_local_resolves_local_addresses() {
        let mut rdns = ReverseDns::new();
        rdns.lookup_local = true;
        rdns.resolver = Box::new(|_| Some("printer.lan".to_string()));
        assert_eq!(rdns.resolve(local_ip()), "printer.lan");
    }

    #[test]
    fn concurrent_misses_collapse_onto_one_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut rdns = ReverseDns::new();
        rdns.resolver = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            Some("dns.google".to_string())
        });
        let rdns = Arc::new(rdns);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rdns = rdns.clone();
                std::thread::spawn(move || rdns.resolve(remote_ip()))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), "dns.google");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pihole_results_take_precedence_over_resolution() {
        let mut rdns = ReverseDns::new();
        rdns.tail_pihole = true;
        rdns.resolver = panicking_resolver();
        rdns.pihole_results
            .insert("8.8.8.8".to_string(), "dns.google".to_string());
        assert_eq!(rdns.resolve(remote_ip()), "dns.google");
    }

    #[test]
    fn enrich_adds_both_directions() {
        let mut rdns = ReverseDns::new();
        rdns.resolver = Box::new(|_| Some("dns.google".to_string()));
        let mut flow = Flow::new();
        flow.add_attr("source_ip", remote_ip());
        flow.add_attr("destination_ip", local_ip());
        rdns.enrich(&mut flow);
        assert_eq!(flow.as_str("source_dns"), Some("dns.google"));
        assert_eq!(flow.as_str("destination_dns"), Some("local"));
    }

    #[test]
    fn configure_rejects_wrong_option_types() {
        let mut rdns = ReverseDns::new();
        let mut opts = EnricherOptions::new();
        opts.insert(
            "tail_pihole".to_string(),
            toml::Value::String("yes".to_string()),
        );
        assert!(rdns.configure(&opts).is_err());

        let mut opts = EnricherOptions::new();
        opts.insert(
            "cache_duration".to_string(),
            toml::Value::Boolean(true),
        );
        assert!(rdns.configure(&opts).is_err());
    }

    #[test]
    fn configure_applies_options() {
        let mut rdns = ReverseDns::new();
        let mut opts = EnricherOptions::new();
        opts.insert("cache_duration".to_string(), toml::Value::Integer(120));
        opts.insert("lookup_local".to_string(), toml::Value::Boolean(true));
        opts.insert("lookup_remote".to_string(), toml::Value::Boolean(false));
        opts.insert("ip_as_unknown".to_string(), toml::Value::Boolean(true));
        rdns.configure(&opts).unwrap();
        assert_eq!(rdns.ttl, Duration::from_secs(120));
        assert!(rdns.lookup_local);
        assert!(!rdns.lookup_remote);
        assert!(rdns.ip_as_unknown);
    }

    fn caches() -> (Cache<String, String>, Cache<String, String>) {
        (
            Cache::builder().time_to_idle(SESSION_TTL).build(),
            Cache::builder().time_to_idle(DEFAULT_CACHE_TTL).build(),
        )
    }

    #[test]
    fn query_then_reply_publishes_a_correlation() {
        let (sessions, results) = caches();
        correlate_line(
            "Jul7 1234 dnsmasq: query[A] example.com from 192.168.0.5",
            &sessions,
            &results,
        );
        correlate_line(
            "Jul7 1234 dnsmasq: reply example.com is 93.184.216.34",
            &sessions,
            &results,
        );
        assert_eq!(
            results.get("93.184.216.34").as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn cached_action_also_publishes() {
        let (sessions, results) = caches();
        correlate_line(
            "Jul7 77 dnsmasq: query[AAAA] cdn.example.net from 10.0.0.2",
            &sessions,
            &results,
        );
        correlate_line(
            "Jul7 77 dnsmasq: cached cdn.example.net is 203.0.113.9",
            &sessions,
            &results,
        );
        assert_eq!(results.get("203.0.113.9").as_deref(), Some("cdn.example.net"));
    }

    #[test]
    fn cname_placeholders_are_skipped() {
        let (sessions, results) = caches();
        correlate_line(
            "Jul7 1234 dnsmasq: query[A] example.com from 192.168.0.5",
            &sessions,
            &results,
        );
        correlate_line(
            "Jul7 1234 dnsmasq: reply example.com is <CNAME>",
            &sessions,
            &results,
        );
        assert_eq!(results.get("<CNAME>"), None);
    }

    #[test]
    fn replies_without_a_staged_query_are_ignored() {
        let (sessions, results) = caches();
        correlate_line(
            "Jul7 999 dnsmasq: reply example.com is 93.184.216.34",
            &sessions,
            &results,
        );
        assert_eq!(results.get("93.184.216.34"), None);
    }

    #[test]
    fn short_lines_are_ignored() {
        let (sessions, results) = caches();
        correlate_line("too short", &sessions, &results);
        sessions.run_pending_tasks();
        assert_eq!(sessions.entry_count(), 0);
    }
}
