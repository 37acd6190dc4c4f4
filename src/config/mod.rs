//! 配置模块
//!
//! TOML 配置文件的结构、校验，以及由配置构造解析器、拨号器等运行时组件。

pub mod local;
pub mod rules;
pub mod server;

pub use local::{FakeDnsConfig, LocalConfig};
pub use rules::{MatchConfig, MatchEntry, RulesConfig};
pub use server::ServerConfig;

use crate::dns::ResolverOptions;
use crate::rule::{CountryLookup, GeoIpDb};
use crate::transport::TcpDialer;
use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 顶层配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: Vec<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    /// 出站网卡
    #[serde(default)]
    pub iface: String,
    /// 未指定网卡时使用默认路由所在网卡
    #[serde(default)]
    pub auto_detect_iface: bool,
    /// `RUST_LOG` 未设置时的日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// GeoIP 数据库路径
    #[serde(default)]
    pub geoip_db: String,
    /// UDP 会话空闲超时（秒）
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: u64,
    /// TCP 拨号超时（秒）
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: Vec::new(),
            local: None,
            rules: RulesConfig::default(),
            iface: String::new(),
            auto_detect_iface: false,
            log_level: default_log_level(),
            geoip_db: String::new(),
            udp_timeout: default_udp_timeout(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_udp_timeout() -> u64 {
    10
}

fn default_dial_timeout() -> u64 {
    10
}

/// 配置文件对应的运行角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Local,
    Server,
}

/// 从文件加载配置
pub fn load_config_from_file<T>(path: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config = toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

impl Config {
    /// 启用的服务器条目
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.server.iter().filter(|s| !s.disable)
    }

    /// 按运行角色验证配置
    pub fn validate(&self, role: Role) -> Result<()> {
        let mut names = HashSet::new();
        for server in self.enabled_servers() {
            server.validate()?;
            if !names.insert(server.name()) {
                return Err(anyhow!("Duplicate server name {:?}", server.name()));
            }
        }
        if self.udp_timeout == 0 || self.dial_timeout == 0 {
            return Err(anyhow!("Timeout must be greater than 0"));
        }
        match role {
            Role::Server => {
                if names.is_empty() {
                    return Err(anyhow!("No server is configured"));
                }
                if let Some(s) = self.enabled_servers().find(|s| s.ssr.is_some()) {
                    return Err(anyhow!("Server {} is ssr, which is only supported as a client", s.name()));
                }
            }
            Role::Local => {
                let local = self.local.as_ref().ok_or_else(|| anyhow!("Missing [local] section"))?;
                local.validate()?;
                for server in self.enabled_servers() {
                    server.validate_upstream()?;
                }
                self.rules.validate()?;
                if self.rules.needs_geoip() && self.geoip_db.is_empty() {
                    return Err(anyhow!("GEOIP rules require geoip_db"));
                }
                for name in [&self.rules.direct_to, &self.rules.global_to] {
                    if !name.is_empty() && name != "direct" && name != "global" && !names.contains(name.as_str()) {
                        return Err(anyhow!("Unknown proxy {:?} in rules", name));
                    }
                }
            }
        }
        Ok(())
    }

    /// 出站网卡：显式配置优先，其次自动探测
    pub fn outbound_iface(&self) -> Option<String> {
        if !self.iface.is_empty() {
            return Some(self.iface.clone());
        }
        if !self.auto_detect_iface {
            return None;
        }
        let iface = crate::utils::default_route_iface();
        if let Some(name) = &iface {
            info!("auto detect outbound interface: {}", name);
        }
        iface
    }

    pub fn tcp_dialer(&self) -> TcpDialer {
        TcpDialer::new(self.outbound_iface(), Duration::from_secs(self.dial_timeout))
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout)
    }

    /// 本地端解析器选项，启用 TUN 时打开 FakeIP
    pub fn resolver_options(&self, tcp: TcpDialer) -> Result<ResolverOptions> {
        let local = self.local.clone().unwrap_or_default();
        let fake_ip = if local.enable_tun {
            Some(local.tun.net()?)
        } else {
            None
        };
        Ok(ResolverOptions {
            nameservers: local.fake_dns.nameservers,
            system_nameservers: local.fake_dns.system_nameservers,
            hosts_path: local.fake_dns.hosts,
            fake_ip,
            fake_filter: local.fake_dns.filter,
            tcp,
            ..Default::default()
        })
    }

    /// 存在 GEOIP 规则时加载数据库
    pub fn geoip(&self) -> Result<Option<Arc<dyn CountryLookup>>> {
        if !self.rules.needs_geoip() {
            return Ok(None);
        }
        let db = GeoIpDb::open(&self.geoip_db)?;
        Ok(Some(Arc::new(db)))
    }
}

/// 带注释的配置模板
pub fn template(role: Role) -> &'static str {
    match role {
        Role::Local => LOCAL_TEMPLATE,
        Role::Server => SERVER_TEMPLATE,
    }
}

const SERVER_TEMPLATE: &str = r#"# mini-ss server
log_level = "info"
# iface = "eth0"

[[server]]
name = "default"
addr = "0.0.0.0:8388"
password = "change-me"
method = "aes-256-gcm"
# tcp | kcp | quic | ws | obfs | grpc | ssh
transport = "tcp"
# same-port udp relay, tcp transport only
udp = true

# [[server]]
# name = "kcp"
# addr = "0.0.0.0:8389"
# password = "change-me"
# method = "chacha20-ietf-poly1305"
# transport = "kcp"
# [server.kcp]
# crypt = "aes"
# key = "kcp-key"
# mode = "fast"
"#;

const LOCAL_TEMPLATE: &str = r#"# mini-ss local
log_level = "info"
# iface = ""
# auto_detect_iface = true
# geoip_db = "Country.mmdb"

[[server]]
name = "proxy"
addr = "127.0.0.1:8388"
password = "change-me"
method = "aes-256-gcm"
transport = "tcp"
udp = true
# [server.ssr]
# obfs = "http_simple"
# protocol = "auth_aes128_md5"

[local]
socks_addr = "127.0.0.1:1080"
http_addr = "127.0.0.1:8080"
# mixed_addr = "127.0.0.1:7890"
# socks_auth = "user:password"
# tcp_tun_addr = ["127.0.0.1:2222=example.com:22"]
# udp_tun_addr = ["127.0.0.1:5353=8.8.8.8:53"]
enable_tun = false

[local.tun]
name = ""
cidr = "198.18.0.1/16"
mtu = 1350

[local.fake_dns]
# listen = "127.0.0.1:5353"
nameservers = ["8.8.8.8", "tcp://1.1.1.1"]
hijack = ["any:53"]
filter = []

[rules]
# match | global | direct
mode = "match"
direct_to = ""
global_to = ""

[rules.match]
others = "proxy"

[[rules.match.domain_suffix]]
proxy = "direct"
value = ["cn", "local"]

[[rules.match.ipcidr]]
proxy = "direct"
value = ["127.0.0.0/8", "10.0.0.0/8", "192.168.0.0/16"]
"#;
