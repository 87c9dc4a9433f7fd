//! GeoIP lookup for the client's direct-vs-tunneled dispatch decision.
//!
//! Near-direct port of `rule/geoip.rs`'s `GeoIpReader`; grounded also in
//! `internal/client/geo.go::Country`, which resolves a domain to an IP via
//! DNS first when it isn't already a literal address.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::{geoip2, Reader};
use parking_lot::RwLock;
use tracing::{debug, warn};

pub struct GeoIpReader {
    reader: RwLock<Option<Reader<Vec<u8>>>>,
}

impl GeoIpReader {
    pub fn new(path: &str) -> Self {
        let reader = Self::load(path);
        if reader.is_none() {
            warn!(path, "GeoIP database not found, country lookups will return empty");
        }
        GeoIpReader {
            reader: RwLock::new(reader),
        }
    }

    fn load(path: &str) -> Option<Reader<Vec<u8>>> {
        if !Path::new(path).exists() {
            return None;
        }
        Reader::open_readfile(path).ok()
    }

    /// ISO country code for `ip`, or `None` if the database isn't loaded or
    /// the address isn't found (private ranges routinely miss).
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        let guard = self.reader.read();
        let reader = guard.as_ref()?;
        match reader.lookup::<geoip2::Country>(ip) {
            Ok(country) => {
                let code = country.country?.iso_code?.to_uppercase();
                debug!(%ip, code, "geoip lookup");
                Some(code)
            }
            Err(_) => None,
        }
    }
}

impl Default for GeoIpReader {
    fn default() -> Self {
        GeoIpReader::new("GeoLite2-Country.mmdb")
    }
}

/// Decide direct-vs-tunneled for a resolved destination IP: CN or an
/// unresolvable/private lookup goes direct (§4.5).
pub fn should_go_direct(reader: &GeoIpReader, ip: Option<IpAddr>) -> bool {
    match ip.and_then(|ip| reader.lookup(ip)) {
        Some(code) => code == "CN",
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_lookups_are_none() {
        let reader = GeoIpReader::new("nonexistent.mmdb");
        assert_eq!(reader.lookup("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn unresolved_lookup_goes_direct() {
        let reader = GeoIpReader::new("nonexistent.mmdb");
        assert!(should_go_direct(&reader, Some("1.2.3.4".parse().unwrap())));
        assert!(should_go_direct(&reader, None));
    }
}
