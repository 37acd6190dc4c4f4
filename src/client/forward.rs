//! 固定目标端口转发
//!
//! TCP 转发对每个入站连接直接中继到配置的远端；UDP 转发在一个本地
//! 套接字上运行固定目标的 NAT 中继。

use super::{bind_tcp, spawn_serve, LocalContext};
use crate::protocol::{Address, SharedPacketConn};
use crate::statistic::{TrackerContext, UdpTracker};
use anyhow::{anyhow, Context as _};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// TCP 端口转发
#[derive(Clone)]
pub struct TcpForwarder {
    ctx: LocalContext,
    remote: String,
}

impl TcpForwarder {
    /// `remote` 为 `host:port`
    pub fn new(ctx: LocalContext, remote: &str) -> anyhow::Result<Self> {
        remote
            .parse::<Address>()
            .map_err(|e| anyhow!("Invalid forward target {}: {}", remote, e))?;
        Ok(Self {
            ctx,
            remote: remote.to_string(),
        })
    }

    pub async fn start(self, addr: &str, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let listener = bind_tcp(addr, "tcp-forward").await?;
        let local = listener.local_addr()?;
        info!("TCP forward listening on {} -> {}", local, self.remote);

        let this = Arc::new(self);
        spawn_serve(listener, token, "tcp-forward", move |stream, peer| {
            let this = this.clone();
            async move { this.handle(stream, peer).await }
        });
        Ok(local)
    }

    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let (rule, selection) = self.ctx.route(&self.remote).await?;
        self.ctx
            .relay_tcp(stream, peer, &self.remote, &rule, &selection, "TCP-TUN")
            .await
    }
}

/// UDP 端口转发
#[derive(Clone)]
pub struct UdpForwarder {
    ctx: LocalContext,
    remote: String,
}

impl UdpForwarder {
    pub fn new(ctx: LocalContext, remote: &str) -> anyhow::Result<Self> {
        remote
            .parse::<Address>()
            .map_err(|e| anyhow!("Invalid forward target {}: {}", remote, e))?;
        Ok(Self {
            ctx,
            remote: remote.to_string(),
        })
    }

    pub async fn start(self, addr: &str, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind udp-forward listener on {}", addr))?;
        let local = socket.local_addr()?;
        let (rule, selection) = self
            .ctx
            .route(&self.remote)
            .await
            .map_err(|e| anyhow!("udp forward to {} rejected: {}", self.remote, e))?;
        let handler = self.ctx.selector.packet_handler(&selection);
        let relayer = self.ctx.selector.prepare_udp(handler.fixed_relayer(&self.remote));
        info!("UDP forward listening on {} -> {} via {}", local, self.remote, handler.name());

        let context = TrackerContext {
            src: local.to_string(),
            dst: self.remote.clone(),
            network: "UDP".to_string(),
            kind: "UDP-TUN".to_string(),
            rule: rule.kind.to_string(),
            proxy: handler.name().to_string(),
        };
        let conn: SharedPacketConn = Arc::new(UdpTracker::new(socket, self.ctx.statistic.clone(), context));
        tokio::spawn(async move {
            if let Err(e) = relayer.relay(conn, token).await {
                error!("udp forward on {} stopped: {}", local, e);
            }
        });
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{direct_context, drop_context, echo_server};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_forward() {
        let token = CancellationToken::new();
        let echo = echo_server().await;
        let addr = TcpForwarder::new(direct_context(), &echo.to_string())
            .unwrap()
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"forward").await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"forward");
        token.cancel();
    }

    #[tokio::test]
    async fn test_udp_forward() {
        let token = CancellationToken::new();
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let addr = UdpForwarder::new(direct_context(), &echo_addr.to_string())
            .unwrap()
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, addr);
        token.cancel();
    }

    #[tokio::test]
    async fn test_forward_rejects_bad_target() {
        assert!(TcpForwarder::new(direct_context(), "no-port").is_err());
        let fwd = UdpForwarder::new(drop_context(), "1.1.1.1:53").unwrap();
        assert!(fwd.start("127.0.0.1:0", CancellationToken::new()).await.is_err());
    }
}
