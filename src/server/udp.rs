//! 服务端 UDP 中继
//!
//! 入站数据报解密后带有目标地址头，按客户端源地址做 NAT 映射转发到目标，
//! 回包加上来源地址头后加密发回。

use crate::crypto::CipherSuite;
use crate::protocol::SharedPacketConn;
use crate::relay::{CipherPacketConn, UdpMode, UdpRelayer};
use anyhow::Context as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 服务端 UDP 中继
#[derive(Debug, Clone)]
pub struct UdpServer {
    cipher: CipherSuite,
    iface: Option<String>,
    idle_timeout: Option<Duration>,
}

impl UdpServer {
    pub fn new(cipher: CipherSuite, iface: Option<String>) -> Self {
        Self {
            cipher,
            iface,
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// 绑定 `addr` 并开始中继，返回实际监听地址
    pub async fn start(self, addr: SocketAddr, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind udp relay on {}", addr))?;
        let local = socket.local_addr()?;
        info!("UDP relay listening on {}", local);

        let conn: SharedPacketConn = Arc::new(CipherPacketConn::new(socket, self.cipher.clone().into()));
        let relayer = UdpRelayer::new(UdpMode::ServerToRemote, None).with_iface(self.iface.clone());
        let relayer = match self.idle_timeout {
            Some(t) => relayer.with_idle_timeout(t),
            None => relayer,
        };
        tokio::spawn(async move {
            if let Err(e) = relayer.relay(conn, token).await {
                error!("udp relay on {} stopped: {}", local, e);
            }
        });
        Ok(local)
    }
}
