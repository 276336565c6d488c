//! Peer-address enrichment using MaxMind GeoLite2/GeoIP2 databases

use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Geolocation attributes attached to a connection
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeoAttributes {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub isp: Option<String>,
}

#[derive(Debug, Error)]
pub enum EnrichError {
    /// The address is private, loopback or otherwise not attributable
    #[error("address {0} is not enrichable")]
    NotEnrichable(IpAddr),
    #[error("no geolocation database loaded")]
    Unavailable,
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Where a connection's enrichment stands. Resolution may land before or
/// after the connection closes; a record can stay `Pending` forever.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Enrichment {
    Pending,
    Resolved(GeoAttributes),
    Failed { reason: String },
    Skipped,
}

impl Enrichment {
    pub fn from_result(result: Result<GeoAttributes, EnrichError>) -> Self {
        match result {
            Ok(attrs) => Enrichment::Resolved(attrs),
            Err(EnrichError::NotEnrichable(_)) => Enrichment::Skipped,
            Err(e) => Enrichment::Failed {
                reason: e.to_string(),
            },
        }
    }
}

/// Resolves a peer address to geolocation attributes without blocking the
/// accept path of the caller.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoAttributes, EnrichError>;
}

pub type SharedEnricher = Arc<dyn Enricher>;

/// MaxMind-backed enricher. The City database provides everything except the
/// ISP, which comes from an optional second database.
pub struct GeoDb {
    city: Option<Reader<Vec<u8>>>,
    isp: Option<Reader<Vec<u8>>>,
}

impl GeoDb {
    pub fn new(city_path: &str, isp_path: &str) -> Self {
        Self {
            city: open_reader(city_path, "City"),
            isp: open_reader(isp_path, "ISP"),
        }
    }

    /// Check if the City database is loaded
    pub fn is_available(&self) -> bool {
        self.city.is_some()
    }

    fn lookup(&self, ip: IpAddr) -> Result<GeoAttributes, EnrichError> {
        if !is_enrichable(&ip) {
            return Err(EnrichError::NotEnrichable(ip));
        }
        let reader = self.city.as_ref().ok_or(EnrichError::Unavailable)?;

        let city: geoip2::City = reader
            .lookup(ip)
            .map_err(|e| EnrichError::Lookup(e.to_string()))?;

        let mut attrs = GeoAttributes {
            country: city
                .country
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string()),
            country_code: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(|s| s.to_string()),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|s| s.first())
                .and_then(|s| s.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string()),
            city: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|n| n.get("en"))
                .map(|s| s.to_string()),
            postal_code: city
                .postal
                .as_ref()
                .and_then(|p| p.code)
                .map(|s| s.to_string()),
            ..Default::default()
        };

        if let Some(location) = city.location.as_ref() {
            attrs.latitude = location.latitude;
            attrs.longitude = location.longitude;
            attrs.timezone = location.time_zone.map(|s| s.to_string());
        }

        if let Some(isp_reader) = self.isp.as_ref() {
            let lookup: Result<geoip2::Isp, _> = isp_reader.lookup(ip);
            if let Ok(isp) = lookup {
                attrs.isp = isp.isp.map(|s| s.to_string());
            }
        }

        Ok(attrs)
    }
}

#[async_trait]
impl Enricher for GeoDb {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoAttributes, EnrichError> {
        self.lookup(ip)
    }
}

fn open_reader(path: &str, label: &str) -> Option<Reader<Vec<u8>>> {
    if path.is_empty() {
        return None;
    }
    if !Path::new(path).exists() {
        warn!("GeoIP {} database not found at: {}", label, path);
        return None;
    }
    match Reader::open_readfile(path) {
        Ok(reader) => {
            info!("GeoIP {} database loaded: {}", label, path);
            Some(reader)
        }
        Err(e) => {
            warn!("Failed to load GeoIP {} database: {}", label, e);
            None
        }
    }
}

/// Strip the IPv4-mapped-IPv6 prefix so that `::ffff:1.2.3.4` and `1.2.3.4`
/// count as the same peer.
pub fn normalize_addr(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Private and local addresses carry no useful attribution
fn is_enrichable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            !(ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified())
        }
        IpAddr::V6(ipv6) => !(ipv6.is_loopback() || ipv6.is_unspecified()),
    }
}
