use super::{is_local_ip, string_option, Enricher};
use crate::config::EnricherOptions;
use crate::flow::Flow;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;

const DEFAULT_MMDB_DIR: &str = "/usr/share/GeoIP";

/// Adds `source_country` / `destination_country` ISO codes from a
/// GeoLite2-Country database. Local addresses short-circuit to `"local"`
/// without a database query; addresses the database does not know become
/// `"Unknown"`; database errors leave the attribute out.
pub struct MaxmindCountry {
    dir: PathBuf,
    db: Option<Reader<Vec<u8>>>,
}

impl MaxmindCountry {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_MMDB_DIR),
            db: None,
        }
    }

    fn lookup_country(&self, ip: std::net::Ipv4Addr) -> Option<String> {
        if is_local_ip(ip) {
            return Some("local".to_string());
        }
        let db = self.db.as_ref()?;
        match db.lookup::<geoip2::Country>(IpAddr::V4(ip)) {
            Ok(record) => {
                let iso = record
                    .country
                    .and_then(|c| c.iso_code)
                    .filter(|code| !code.is_empty())
                    .unwrap_or("Unknown");
                Some(iso.to_string())
            }
            Err(MaxMindDBError::AddressNotFoundError(_)) => Some("Unknown".to_string()),
            Err(_) => None,
        }
    }
}

impl Default for MaxmindCountry {
    fn default() -> Self {
        Self::new()
    }
}

impl Enricher for MaxmindCountry {
    fn configure(&mut self, opts: &EnricherOptions) -> crate::Result<()> {
        if let Some(dir) = string_option(opts, "maxmind_country", "mmdb_dir")? {
            self.dir = PathBuf::from(dir);
        }
        info!(dir = %self.dir.display(), "using directory for country GeoIP");
        Ok(())
    }

    fn start(&mut self) -> crate::Result<()> {
        let path = self.dir.join("GeoLite2-Country.mmdb");
        self.db = Some(Reader::open_readfile(&path)?);
        Ok(())
    }

    fn enrich(&self, flow: &mut Flow) {
        for (attr, dest) in [
            ("source_ip", "source_country"),
            ("destination_ip", "destination_country"),
        ] {
            if let Some(ip) = flow.as_ip(attr) {
                if let Some(country) = self.lookup_country(ip) {
                    flow.add_attr(dest, country);
                }
            }
        }
    }
}

/// Adds `{source,destination}_asn_org` and `{source,destination}_asn_num`
/// from a GeoLite2-ASN database. Local addresses are skipped entirely; a
/// record without an organization name adds neither attribute.
pub struct MaxmindAsn {
    dir: PathBuf,
    db: Option<Reader<Vec<u8>>>,
}

impl MaxmindAsn {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_MMDB_DIR),
            db: None,
        }
    }
}

impl Default for MaxmindAsn {
    fn default() -> Self {
        Self::new()
    }
}

impl Enricher for MaxmindAsn {
    fn configure(&mut self, opts: &EnricherOptions) -> crate::Result<()> {
        if let Some(dir) = string_option(opts, "maxmind_asn", "mmdb_dir")? {
            self.dir = PathBuf::from(dir);
        }
        info!(dir = %self.dir.display(), "using directory for ASN GeoIP");
        Ok(())
    }

    fn start(&mut self) -> crate::Result<()> {
        let path = self.dir.join("GeoLite2-ASN.mmdb");
        self.db = Some(Reader::open_readfile(&path)?);
        Ok(())
    }

    fn enrich(&self, flow: &mut Flow) {
        let Some(db) = self.db.as_ref() else {
            return;
        };
        for dir in ["source", "destination"] {
            let Some(ip) = flow.as_ip(&format!("{dir}_ip")) else {
                continue;
            };
            if is_local_ip(ip) {
                continue;
            }
            let Ok(record) = db.lookup::<geoip2::Asn>(IpAddr::V4(ip)) else {
                continue;
            };
            if let Some(org) = record
                .autonomous_system_organization
                .filter(|org| !org.is_empty())
            {
                flow.add_attr(format!("{dir}_asn_org"), org);
                flow.add_attr(
                    format!("{dir}_asn_num"),
                    record.autonomous_system_number.unwrap_or(0),
                );
            }
        }
    }
}
