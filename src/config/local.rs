//! 本地端配置

use crate::protocol::socks5::Credentials;
use crate::protocol::Address;
use crate::tun::TunConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// 本地入站配置，地址为空表示不启用对应入站
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub socks_addr: String,
    pub http_addr: String,
    pub mixed_addr: String,
    /// `user:password`
    pub socks_auth: String,
    pub http_auth: String,
    /// 是否处理 SOCKS5 UDP ASSOCIATE
    pub socks_udp: bool,
    /// TCP 端口转发 `local=remote`
    pub tcp_tun_addr: Vec<String>,
    /// UDP 端口转发 `local=remote`
    pub udp_tun_addr: Vec<String>,
    pub enable_tun: bool,
    pub tun: TunConfig,
    pub fake_dns: FakeDnsConfig,
}

/// DNS 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeDnsConfig {
    /// 额外的本地 DNS 监听地址，为空时不监听
    pub listen: String,
    /// 上游名字服务器：`8.8.8.8`、`tcp://1.1.1.1`、`tls://dns.google:853`
    pub nameservers: Vec<String>,
    /// 追加系统配置的名字服务器
    pub system_nameservers: bool,
    /// TUN 模式下额外劫持的 DNS 目标
    pub hijack: Vec<String>,
    /// 不分配 FakeIP 的域名后缀
    pub filter: Vec<String>,
    /// hosts 文件路径，为空时使用系统默认位置
    pub hosts: String,
}

impl Default for FakeDnsConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            nameservers: Vec::new(),
            system_nameservers: true,
            hijack: Vec::new(),
            filter: Vec::new(),
            hosts: String::new(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            socks_addr: String::new(),
            http_addr: String::new(),
            mixed_addr: String::new(),
            socks_auth: String::new(),
            http_auth: String::new(),
            socks_udp: true,
            tcp_tun_addr: Vec::new(),
            udp_tun_addr: Vec::new(),
            enable_tun: false,
            tun: TunConfig::default(),
            fake_dns: FakeDnsConfig::default(),
        }
    }
}

/// 解析 `local=remote` 形式的端口转发
pub fn split_tun_addr(s: &str) -> Result<(String, String)> {
    let (local, remote) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("tun address invalid: {:?}", s))?;
    let (local, remote) = (local.trim(), remote.trim());
    remote
        .parse::<Address>()
        .map_err(|e| anyhow!("tun address invalid: {:?}: {}", s, e))?;
    if local.is_empty() {
        return Err(anyhow!("tun address invalid: {:?}", s));
    }
    Ok((local.to_string(), remote.to_string()))
}

fn parse_auth(name: &str, auth: &str) -> Result<Option<Credentials>> {
    if auth.is_empty() {
        return Ok(None);
    }
    Credentials::parse(auth)
        .map(Some)
        .ok_or_else(|| anyhow!("Invalid {} auth, expect \"user:password\"", name))
}

impl LocalConfig {
    pub fn validate(&self) -> Result<()> {
        self.socks_credentials()?;
        self.http_credentials()?;
        for s in self.tcp_tun_addr.iter().chain(&self.udp_tun_addr) {
            split_tun_addr(s)?;
        }
        self.hijack_addrs()?;
        if self.enable_tun {
            self.tun.validate()?;
        }
        let any = !self.socks_addr.is_empty()
            || !self.http_addr.is_empty()
            || !self.mixed_addr.is_empty()
            || !self.tcp_tun_addr.is_empty()
            || !self.udp_tun_addr.is_empty()
            || self.enable_tun;
        if !any {
            return Err(anyhow!("No local listener is configured"));
        }
        Ok(())
    }

    pub fn socks_credentials(&self) -> Result<Option<Credentials>> {
        parse_auth("socks", &self.socks_auth)
    }

    pub fn http_credentials(&self) -> Result<Option<Credentials>> {
        parse_auth("http", &self.http_auth)
    }

    /// 劫持地址，省略端口时为 53，`any` 表示任意 IP
    pub fn hijack_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.fake_dns
            .hijack
            .iter()
            .map(|h| {
                let h = h.trim_start_matches("udp://").trim_start_matches("tcp://");
                let h = h.replacen("any:", "0.0.0.0:", 1);
                let h = if h == "any" { "0.0.0.0".to_string() } else { h };
                h.parse::<SocketAddr>()
                    .or_else(|_| format!("{}:53", h).parse::<SocketAddr>())
                    .map_err(|_| anyhow!("Invalid dns hijack address {:?}", h))
            })
            .collect()
    }
}
