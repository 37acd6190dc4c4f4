//! hosts 文件

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

/// hosts 应答的 TTL（秒）
pub const HOSTS_TTL: u32 = 6;

#[cfg(windows)]
const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(not(windows))]
const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// 主机名到地址的静态映射
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    records: HashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    /// 读取系统 hosts 文件，读取失败时返回空表
    pub fn system() -> Self {
        match Self::load(DEFAULT_HOSTS_PATH) {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Failed to read hosts file {}: {}", DEFAULT_HOSTS_PATH, e);
                Self::default()
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut records: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(ip) = fields.next() else { continue };
            let Ok(ip) = ip.parse::<IpAddr>() else {
                debug!("skip hosts line: {}", line);
                continue;
            };
            for host in fields {
                records.entry(host.to_ascii_lowercase()).or_default().push(ip);
            }
        }
        Self { records }
    }

    /// 查找主机名对应的第一个地址
    pub fn lookup(&self, host: &str) -> Option<IpAddr> {
        let host = super::trim_domain(host).to_ascii_lowercase();
        self.records.get(&host).and_then(|ips| ips.first().copied())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_hosts() {
        let hosts = Hosts::parse(
            "# comment\n127.0.0.1 localhost local.test\n::1 localhost ip6-localhost\n10.0.0.1 Box.LAN # trailing\nbad line\n",
        );
        assert_eq!(hosts.lookup("localhost"), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(hosts.lookup("local.test."), Some("127.0.0.1".parse().unwrap()));
        assert_eq!(hosts.lookup("ip6-localhost"), Some("::1".parse().unwrap()));
        assert_eq!(hosts.lookup("box.lan"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(hosts.lookup("bad"), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "192.168.1.10 nas").unwrap();
        let hosts = Hosts::load(file.path()).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts.lookup("nas"), Some("192.168.1.10".parse().unwrap()));
    }
}
