//! 代理选择器
//!
//! 按注册顺序保存支持 TCP 的代理与其中启用了 UDP 的代理。未知或空代理名一律退回直连。

use crate::relay::{DirectTcpRelayer, ProxyCipher, ProxyTcpRelayer, UdpMode, UdpRelayer};
use crate::rule::{RuleError, Selection};
use crate::transport::TcpDialer;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, warn};

/// 支持 UDP 的代理节点
#[derive(Debug, Clone)]
pub struct PacketProxy {
    pub name: String,
    pub server: String,
    pub cipher: ProxyCipher,
}

/// 选中的 TCP 出口
#[derive(Clone)]
pub enum TcpHandler {
    Direct(DirectTcpRelayer),
    Proxy(ProxyTcpRelayer),
}

impl TcpHandler {
    pub fn name(&self) -> &str {
        match self {
            TcpHandler::Direct(_) => "direct",
            TcpHandler::Proxy(p) => p.name(),
        }
    }

    pub async fn relay<S>(&self, conn: S, remote: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match self {
            TcpHandler::Direct(direct) => direct.relay(conn, remote).await,
            TcpHandler::Proxy(proxy) => proxy.relay_local_to_server(conn, remote).await,
        }
    }
}

/// 选中的 UDP 出口
#[derive(Debug, Clone)]
pub enum PacketHandler {
    Direct,
    Proxy(PacketProxy),
}

impl PacketHandler {
    pub fn name(&self) -> &str {
        match self {
            PacketHandler::Direct => "direct",
            PacketHandler::Proxy(p) => &p.name,
        }
    }

    /// SOCKS5 UDP 关联使用的中继器，报文自带目标地址
    pub fn socks5_relayer(&self) -> UdpRelayer {
        match self {
            PacketHandler::Direct => UdpRelayer::new(UdpMode::Socks5Direct, None),
            PacketHandler::Proxy(p) => UdpRelayer::new(
                UdpMode::Socks5ToServer {
                    server: p.server.clone(),
                },
                Some(p.cipher.clone()),
            ),
        }
    }

    /// 发往固定目标的中继器（端口转发、TUN）
    pub fn fixed_relayer(&self, remote: &str) -> UdpRelayer {
        match self {
            PacketHandler::Direct => UdpRelayer::new(
                UdpMode::Direct {
                    target: remote.to_string(),
                },
                None,
            ),
            PacketHandler::Proxy(p) => UdpRelayer::new(
                UdpMode::ToServer {
                    server: p.server.clone(),
                    remote: remote.to_string(),
                },
                Some(p.cipher.clone()),
            ),
        }
    }
}

/// 代理选择器
#[derive(Clone, Default)]
pub struct Selector {
    direct: DirectTcpRelayer,
    tcp: Vec<ProxyTcpRelayer>,
    udp: Vec<PacketProxy>,
    iface: Option<String>,
    udp_timeout: Option<Duration>,
}

impl Selector {
    pub fn new(tcp: TcpDialer) -> Self {
        let iface = tcp.iface().map(|s| s.to_string());
        Self {
            direct: DirectTcpRelayer::new(tcp),
            tcp: Vec::new(),
            udp: Vec::new(),
            iface,
            udp_timeout: None,
        }
    }

    /// 设置 UDP 出站的空闲超时
    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = Some(timeout);
        self
    }

    /// 注册 TCP 代理，同名代理覆盖并保持原位置
    pub fn add_proxy(&mut self, relayer: ProxyTcpRelayer) {
        match self.tcp.iter_mut().find(|p| p.name() == relayer.name()) {
            Some(slot) => *slot = relayer,
            None => self.tcp.push(relayer),
        }
    }

    /// 注册 UDP 代理
    pub fn add_packet_proxy(&mut self, proxy: PacketProxy) {
        match self.udp.iter_mut().find(|p| p.name == proxy.name) {
            Some(slot) => *slot = proxy,
            None => self.udp.push(proxy),
        }
    }

    pub fn proxy_names(&self) -> Vec<&str> {
        self.tcp.iter().map(|p| p.name()).collect()
    }

    pub fn packet_proxy_names(&self) -> Vec<&str> {
        self.udp.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty()
    }

    /// 按名称选择 TCP 出口
    pub fn select(&self, name: &str) -> TcpHandler {
        if name.is_empty() || name == "direct" {
            return TcpHandler::Direct(self.direct.clone());
        }
        match self.tcp.iter().find(|p| p.name() == name) {
            Some(proxy) => TcpHandler::Proxy(proxy.clone()),
            None => {
                warn!("tcp: try to connect directly since proxy {:?} not found", name);
                TcpHandler::Direct(self.direct.clone())
            }
        }
    }

    /// 按名称选择 UDP 出口
    pub fn select_packet(&self, name: &str) -> PacketHandler {
        if name.is_empty() || name == "direct" {
            return PacketHandler::Direct;
        }
        match self.udp.iter().find(|p| p.name == name) {
            Some(proxy) => PacketHandler::Proxy(proxy.clone()),
            None => {
                warn!("udp: try to connect directly since proxy {:?} not found or udp relay disabled", name);
                PacketHandler::Direct
            }
        }
    }

    /// 按规则选择结果选择 UDP 出口，全局模式取第一个支持 UDP 的代理
    pub fn packet_handler(&self, selection: &Selection) -> PacketHandler {
        match selection {
            Selection::Direct => PacketHandler::Direct,
            Selection::Proxy(name) => self.select_packet(name),
            Selection::Global => match self.udp.first() {
                Some(proxy) => PacketHandler::Proxy(proxy.clone()),
                None => {
                    warn!("udp: no proxy with udp relay enabled, connect directly");
                    PacketHandler::Direct
                }
            },
        }
    }

    /// 为规则选择结果配置 UDP 中继器的出站接口与超时
    pub fn prepare_udp(&self, relayer: UdpRelayer) -> UdpRelayer {
        let relayer = relayer.with_iface(self.iface.clone());
        match self.udp_timeout {
            Some(timeout) => relayer.with_idle_timeout(timeout),
            None => relayer,
        }
    }

    /// 按规则选择结果中继 TCP 连接
    ///
    /// 全局模式下依次尝试每个代理，连接失败时顺延到下一个。
    pub async fn relay_tcp<S>(&self, selection: &Selection, conn: S, remote: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match selection {
            Selection::Direct => self.select("").relay(conn, remote).await,
            Selection::Proxy(name) => self.select(name).relay(conn, remote).await,
            Selection::Global => {
                if self.tcp.is_empty() {
                    return Err(RuleError::EmptyGlobalProxy.into());
                }
                let mut last_err = None;
                for proxy in &self.tcp {
                    info!("Using Proxy: {:?}:{:?}", proxy.name(), proxy.server_addr());
                    match proxy.connect(remote).await {
                        Ok(upstream) => return proxy.relay_connected(conn, upstream, remote).await,
                        Err(e) => {
                            error!(
                                "[GLOBAL] error occurred at ({}:{}->{}), find next proxy, err: {}",
                                proxy.name(),
                                proxy.server_addr(),
                                remote,
                                e
                            );
                            last_err = Some(e);
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| RuleError::EmptyGlobalProxy.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherSuite;
    use crate::relay::relay_server_to_remote;
    use crate::transport::{Dialer, TransportKind, TransportOptions};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxy(name: &str, server: &str) -> ProxyTcpRelayer {
        let dialer = Dialer::new(TransportKind::Tcp, &TransportOptions::default(), TcpDialer::default()).unwrap();
        let suite = CipherSuite::new("chacha20-ietf-poly1305", "pw").unwrap();
        ProxyTcpRelayer::new(name, server, Arc::new(dialer), suite.into())
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr.to_string()
    }

    async fn ss_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let suite = CipherSuite::new("chacha20-ietf-poly1305", "pw").unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let conn = suite.wrap_stream(stream);
                tokio::spawn(async move {
                    let _ = relay_server_to_remote(conn, &TcpDialer::default()).await;
                });
            }
        });
        addr.to_string()
    }

    #[test]
    fn test_select_falls_back_to_direct() {
        let mut selector = Selector::new(TcpDialer::default());
        selector.add_proxy(proxy("A", "127.0.0.1:1"));
        selector.add_proxy(proxy("B", "127.0.0.1:2"));
        selector.add_proxy(proxy("A", "127.0.0.1:3"));
        assert_eq!(selector.proxy_names(), vec!["A", "B"]);

        assert_eq!(selector.select("A").name(), "A");
        assert_eq!(selector.select("").name(), "direct");
        assert_eq!(selector.select("missing").name(), "direct");

        assert_eq!(selector.select_packet("A").name(), "direct");
        selector.add_packet_proxy(PacketProxy {
            name: "A".into(),
            server: "127.0.0.1:3".into(),
            cipher: CipherSuite::new("aes-128-gcm", "pw").unwrap().into(),
        });
        assert_eq!(selector.select_packet("A").name(), "A");
        assert_eq!(selector.packet_handler(&Selection::Global).name(), "A");
    }

    #[test]
    fn test_packet_handler_modes() {
        let direct = PacketHandler::Direct;
        assert_eq!(direct.socks5_relayer().mode(), &UdpMode::Socks5Direct);
        assert_eq!(
            direct.fixed_relayer("1.1.1.1:53").mode(),
            &UdpMode::Direct {
                target: "1.1.1.1:53".into()
            }
        );
        let proxied = PacketHandler::Proxy(PacketProxy {
            name: "P".into(),
            server: "10.0.0.1:8388".into(),
            cipher: CipherSuite::new("aes-128-gcm", "pw").unwrap().into(),
        });
        assert_eq!(
            proxied.fixed_relayer("1.1.1.1:53").mode(),
            &UdpMode::ToServer {
                server: "10.0.0.1:8388".into(),
                remote: "1.1.1.1:53".into()
            }
        );
    }

    #[tokio::test]
    async fn test_global_falls_through_to_next_proxy() {
        let echo = echo_server().await;
        let server = ss_server().await;

        // 第一个代理不可达
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().to_string();
        let mut selector = Selector::new(TcpDialer::default());
        selector.add_proxy(proxy("dead", &dead));
        selector.add_proxy(proxy("alive", &server));

        let (mut client, relay_side) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { selector.relay_tcp(&Selection::Global, relay_side, &echo).await });

        client.write_all(b"hello global").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello global");
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_global_without_proxies() {
        let selector = Selector::new(TcpDialer::default());
        let (_client, relay_side) = tokio::io::duplex(64);
        let err = selector
            .relay_tcp(&Selection::Global, relay_side, "127.0.0.1:80")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), RuleError::EmptyGlobalProxy.to_string());
    }
}
