//! 服务器条目配置
//!
//! 同一份条目既用于服务端监听，也用于本地端连接上游代理。

use crate::crypto::CipherSuite;
use crate::protocol::Address;
use crate::relay::{ProxyCipher, ProxyTcpRelayer};
use crate::selector::PacketProxy;
use crate::ssr::{SsrConfig, SsrContext};
use crate::transport::{Dialer, TcpDialer, TransportKind, TransportOptions};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 单个服务器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 代理名，规则中按此名引用；为空时使用地址
    #[serde(default)]
    pub name: String,
    /// 服务器地址 `host:port`
    pub addr: String,
    pub password: String,
    /// 加密方法
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// 是否启用 UDP 中继，只对 tcp 传输有效
    #[serde(default)]
    pub udp: bool,
    /// 跳过该条目
    #[serde(default)]
    pub disable: bool,
    /// 各传输的参数
    #[serde(flatten)]
    pub opts: TransportOptions,
    /// 存在时启用 ShadowsocksR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssr: Option<SsrConfig>,
}

impl ServerConfig {
    /// 创建新的服务器配置
    pub fn new(name: &str, addr: &str, password: &str, method: &str) -> Self {
        Self {
            name: name.to_string(),
            addr: addr.to_string(),
            password: password.to_string(),
            method: method.to_string(),
            transport: TransportKind::Tcp,
            udp: false,
            disable: false,
            opts: TransportOptions::default(),
            ssr: None,
        }
    }

    /// 代理名
    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.addr
        } else {
            &self.name
        }
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        self.addr
            .parse::<Address>()
            .map_err(|e| anyhow!("Invalid server address {:?}: {}", self.addr, e))?;
        if self.password.is_empty() {
            return Err(anyhow!("Password of server {} cannot be empty", self.name()));
        }
        self.cipher_suite()?;
        if self.ssr.is_some() && self.transport != TransportKind::Tcp {
            return Err(anyhow!(
                "ssr of server {} requires the tcp transport, got {}",
                self.name(),
                self.transport
            ));
        }
        if matches!(self.name.as_str(), "direct" | "global") {
            return Err(anyhow!("Server name {:?} is reserved", self.name));
        }
        Ok(())
    }

    /// 作为上游时端口不能为 0
    pub fn validate_upstream(&self) -> Result<()> {
        let addr: Address = self.addr.parse()?;
        if addr.port() == 0 {
            return Err(anyhow!("Invalid server port in {:?}", self.addr));
        }
        Ok(())
    }

    /// UDP 中继是否可用
    pub fn udp_enabled(&self) -> bool {
        self.udp && self.transport == TransportKind::Tcp
    }

    pub fn cipher_suite(&self) -> Result<CipherSuite> {
        CipherSuite::new(&self.method, &self.password)
            .map_err(|e| anyhow!("Invalid cipher of server {}: {}", self.name(), e))
    }

    /// 本地端连接该服务器使用的加密层
    pub fn proxy_cipher(&self) -> Result<ProxyCipher> {
        let suite = self.cipher_suite()?;
        let Some(ssr) = &self.ssr else {
            return Ok(ProxyCipher::Ss(suite));
        };
        let addr: Address = self.addr.parse()?;
        let ctx = SsrContext::new(suite, &addr.host(), addr.port(), ssr)
            .map_err(|e| anyhow!("Invalid ssr options of server {}: {}", self.name(), e))?;
        Ok(ProxyCipher::Ssr(ctx))
    }

    /// 按所选传输构造拨号器
    pub fn dialer(&self, tcp: TcpDialer) -> Result<Dialer> {
        Dialer::new(self.transport, &self.opts, tcp)
            .map_err(|e| anyhow!("Failed to create {} dialer for {}: {}", self.transport, self.name(), e))
    }

    /// 本地端的 TCP 代理
    pub fn tcp_proxy(&self, dialer: Arc<Dialer>) -> Result<ProxyTcpRelayer> {
        Ok(ProxyTcpRelayer::new(self.name(), self.addr.clone(), dialer, self.proxy_cipher()?))
    }

    /// 本地端的 UDP 代理，未启用 UDP 时返回 None
    pub fn packet_proxy(&self) -> Result<Option<PacketProxy>> {
        if !self.udp_enabled() {
            return Ok(None);
        }
        Ok(Some(PacketProxy {
            name: self.name().to_string(),
            server: self.addr.clone(),
            cipher: self.proxy_cipher()?,
        }))
    }
}

/// 默认加密方法
fn default_method() -> String {
    "aes-256-gcm".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_new() {
        let config = ServerConfig::new("hk", "127.0.0.1:8388", "test_password", "aes-256-gcm");
        assert_eq!(config.name(), "hk");
        assert!(config.validate().is_ok());
        assert!(matches!(config.proxy_cipher().unwrap(), ProxyCipher::Ss(_)));
        assert!(config.packet_proxy().unwrap().is_none());

        let unnamed = ServerConfig::new("", "127.0.0.1:8388", "pw", "aes-256-gcm");
        assert_eq!(unnamed.name(), "127.0.0.1:8388");
    }

    #[test]
    fn test_validate_rejects_bad_entries() {
        assert!(ServerConfig::new("a", "127.0.0.1:8388", "", "aes-256-gcm").validate().is_err());
        assert!(ServerConfig::new("a", "127.0.0.1:8388", "pw", "invalid-method").validate().is_err());
        assert!(ServerConfig::new("a", "no-port", "pw", "aes-256-gcm").validate().is_err());
        assert!(ServerConfig::new("a", "127.0.0.1:0", "pw", "aes-256-gcm").validate().is_ok());
        assert!(ServerConfig::new("a", "127.0.0.1:0", "pw", "aes-256-gcm").validate_upstream().is_err());
        assert!(ServerConfig::new("direct", "127.0.0.1:1", "pw", "aes-256-gcm").validate().is_err());

        let mut ssr_over_ws = ServerConfig::new("a", "127.0.0.1:1", "pw", "aes-128-cfb");
        ssr_over_ws.transport = TransportKind::Ws;
        ssr_over_ws.ssr = Some(SsrConfig::default());
        assert!(ssr_over_ws.validate().is_err());
    }

    #[test]
    fn test_parse_toml_entry() {
        let config: ServerConfig = toml::from_str(
            r#"
name = "ssr-node"
addr = "1.2.3.4:443"
password = "secret"
method = "aes-128-cfb"
udp = true

[ssr]
obfs = "plain"
protocol = "origin"
"#,
        )
        .unwrap();
        assert_eq!(config.transport, TransportKind::Tcp);
        assert!(config.validate().is_ok());
        assert!(matches!(config.proxy_cipher().unwrap(), ProxyCipher::Ssr(_)));
        let packet = config.packet_proxy().unwrap().unwrap();
        assert_eq!(packet.name, "ssr-node");
        assert_eq!(packet.server, "1.2.3.4:443");
    }

    #[test]
    fn test_udp_only_on_tcp_transport() {
        let mut config = ServerConfig::new("a", "127.0.0.1:1", "pw", "aes-256-gcm");
        config.udp = true;
        assert!(config.udp_enabled());
        config.transport = TransportKind::Kcp;
        assert!(!config.udp_enabled());
    }
}
