//! GeoIP 国家代码查询（MaxMind mmdb 格式）

use std::net::IpAddr;
use std::path::Path;
use tracing::trace;

/// 按 IP 查询 ISO 国家代码
pub trait CountryLookup: Send + Sync {
    fn country(&self, ip: IpAddr) -> Option<String>;
}

pub struct GeoIpDb {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl std::fmt::Debug for GeoIpDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIpDb")
            .field("database_type", &self.reader.metadata.database_type)
            .finish()
    }
}

impl GeoIpDb {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read geoip database {}: {}", path.display(), e))?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> anyhow::Result<Self> {
        let reader = maxminddb::Reader::from_source(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse geoip database: {}", e))?;
        Ok(Self { reader })
    }
}

impl CountryLookup for GeoIpDb {
    fn country(&self, ip: IpAddr) -> Option<String> {
        match self.reader.lookup::<maxminddb::geoip2::Country>(ip) {
            Ok(record) => record.country.and_then(|c| c.iso_code).map(|s| s.to_string()),
            Err(e) => {
                trace!("geoip lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}
