//! Shadowsocks 服务端
//!
//! 在配置的传输上接受连接，解开加密层后连接目标并双向拷贝。
//! 传输为原始 TCP 且启用了 UDP 时，同一地址上还会运行 UDP 中继。

pub mod tcp;
pub mod udp;

use crate::crypto::CipherSuite;
use crate::transport::{Listener, TcpDialer, TransportKind, TransportOptions};
use anyhow::anyhow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 单个服务端实例
#[derive(Debug, Clone)]
pub struct SsServer {
    name: String,
    addr: String,
    kind: TransportKind,
    opts: TransportOptions,
    cipher: CipherSuite,
    udp: bool,
    udp_timeout: Option<Duration>,
    tcp: TcpDialer,
}

/// 启动后的监听地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAddrs {
    pub tcp: SocketAddr,
    pub udp: Option<SocketAddr>,
}

impl SsServer {
    /// 创建服务端
    ///
    /// # 参数
    /// * `name` - 服务端名称，只用于日志
    /// * `addr` - 监听地址
    /// * `kind` / `opts` - 入站传输
    /// * `cipher` - 入站加密层
    /// * `tcp` - 连接目标时使用的拨号器
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        kind: TransportKind,
        opts: TransportOptions,
        cipher: CipherSuite,
        tcp: TcpDialer,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            kind,
            opts,
            cipher,
            udp: false,
            udp_timeout: None,
            tcp,
        }
    }

    pub fn with_udp(mut self, enabled: bool) -> Self {
        self.udp = enabled;
        self
    }

    pub fn with_udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 绑定并开始服务，`token` 取消时停止
    pub async fn start(&self, token: CancellationToken) -> anyhow::Result<ServerAddrs> {
        let listener = Listener::bind(self.kind, &self.addr, &self.opts)
            .await
            .map_err(|e| anyhow!("Failed to start server {} on {}: {}", self.name, self.addr, e))?;
        let tcp_addr = listener.local_addr();
        info!(
            name = %self.name,
            transport = %self.kind,
            method = %self.cipher.method(),
            "Shadowsocks server listening on {}",
            tcp_addr
        );

        let udp_addr = if self.udp && self.kind == TransportKind::Tcp {
            let relay = udp::UdpServer::new(self.cipher.clone(), self.tcp.iface().map(str::to_string));
            let relay = match self.udp_timeout {
                Some(t) => relay.with_idle_timeout(t),
                None => relay,
            };
            Some(relay.start(tcp_addr, token.clone()).await?)
        } else {
            None
        };

        tokio::spawn(tcp::serve(listener, self.cipher.clone(), self.tcp.clone(), token));
        Ok(ServerAddrs {
            tcp: tcp_addr,
            udp: udp_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{ProxyTcpRelayer, UdpMode, UdpRelayer};
    use crate::transport::Dialer;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    async fn echo_tcp() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = s.read(&mut buf).await {
                        if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_stream_cipher_end_to_end() {
        let token = CancellationToken::new();
        let suite = CipherSuite::new("aes-128-cfb", "12345").unwrap();
        let server = SsServer::new(
            "test",
            "127.0.0.1:0",
            TransportKind::Tcp,
            TransportOptions::default(),
            suite.clone(),
            TcpDialer::default(),
        );
        let addrs = server.start(token.clone()).await.unwrap();
        assert!(addrs.udp.is_none());
        let echo = echo_tcp().await;

        let dialer = Dialer::new(TransportKind::Tcp, &TransportOptions::default(), TcpDialer::default()).unwrap();
        let proxy = ProxyTcpRelayer::new("p", addrs.tcp.to_string(), Arc::new(dialer), suite.into());
        let mut upstream = proxy.connect(&echo.to_string()).await.unwrap();
        upstream.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the tunnel");
        token.cancel();
    }

    #[tokio::test]
    async fn test_udp_aead_end_to_end() {
        let token = CancellationToken::new();
        let suite = CipherSuite::new("chacha20-ietf-poly1305", "pw").unwrap();
        let server = SsServer::new(
            "test",
            "127.0.0.1:0",
            TransportKind::Tcp,
            TransportOptions::default(),
            suite.clone(),
            TcpDialer::default(),
        )
        .with_udp(true);
        let addrs = server.start(token.clone()).await.unwrap();
        let udp_addr = addrs.udp.unwrap();
        assert_eq!(udp_addr.port(), addrs.tcp.port());

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local_addr = local.local_addr().unwrap();
        let relayer = UdpRelayer::new(
            UdpMode::ToServer {
                server: udp_addr.to_string(),
                remote: echo_addr.to_string(),
            },
            Some(suite.into()),
        );
        let relay_token = token.clone();
        tokio::spawn(async move { relayer.relay(local, relay_token).await });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"query", local_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"query");
        token.cancel();
    }
}
