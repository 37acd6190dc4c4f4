//! 传输层
//!
//! 本地与服务端之间的字节流可以跑在多种传输上。每种传输提供一个拨号器和一个监听函数，
//! 监听端把握手完成的连接送入通道，由 [`Listener`] 统一交给上层。
//! KCP、QUIC、gRPC、SSH 在一条会话上复用多条子流，会话由 [`pool::ConnPool`] 管理。

pub mod grpc;
pub mod kcp;
pub mod obfs;
pub mod pool;
pub mod quic;
pub mod smux;
pub mod ssh;
pub mod tcp;
pub mod tls;
pub mod ws;

use crate::protocol::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use self::grpc::{GrpcDialer, GrpcOptions};
pub use self::kcp::{KcpDialer, KcpOptions};
pub use self::obfs::{ObfsDialer, ObfsOptions};
pub use self::quic::{QuicDialer, QuicOptions};
pub use self::ssh::{SshDialer, SshOptions};
pub use self::tcp::TcpDialer;
pub use self::tls::TlsOptions;
pub use self::ws::{WsDialer, WsOptions};

/// 监听端交付的连接：连接本身与对端地址
pub type Accepted = (BoxStream, SocketAddr);

/// 等待上层取走的已握手连接数
const ACCEPT_BACKLOG: usize = 128;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    #[error("Invalid transport option: {0}")]
    InvalidOption(String),

    #[error("Connection pool closed")]
    PoolClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind {0}: {1}")]
    Bind(String, io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => e,
            TransportError::Bind(_, ref inner) => io::Error::new(inner.kind(), e.to_string()),
            TransportError::InvalidOption(_) | TransportError::Unsupported(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            }
            TransportError::PoolClosed => io::Error::new(io::ErrorKind::NotConnected, e.to_string()),
            e => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

/// 传输类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    #[serde(alias = "default")]
    Tcp,
    Kcp,
    Quic,
    #[serde(alias = "websocket")]
    Ws,
    Obfs,
    Grpc,
    Ssh,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Kcp => "kcp",
            Self::Quic => "quic",
            Self::Ws => "ws",
            Self::Obfs => "obfs",
            Self::Grpc => "grpc",
            Self::Ssh => "ssh",
        }
    }

    /// 是否在会话上复用多条子流
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Self::Kcp | Self::Quic | Self::Grpc | Self::Ssh)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" | "tcp" => Ok(Self::Tcp),
            "kcp" => Ok(Self::Kcp),
            "quic" => Ok(Self::Quic),
            "ws" | "websocket" => Ok(Self::Ws),
            "obfs" => Ok(Self::Obfs),
            "grpc" => Ok(Self::Grpc),
            "ssh" => Ok(Self::Ssh),
            other => Err(TransportError::Unsupported(other.to_string())),
        }
    }
}

/// 各传输的参数，只有与所选传输对应的那一项生效
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub kcp: KcpOptions,
    pub ws: WsOptions,
    pub obfs: ObfsOptions,
    pub quic: QuicOptions,
    pub grpc: GrpcOptions,
    pub ssh: SshOptions,
}

/// 出站拨号器
pub enum Dialer {
    Tcp(TcpDialer),
    Kcp(KcpDialer),
    Quic(QuicDialer),
    Ws(WsDialer),
    Obfs(ObfsDialer),
    Grpc(GrpcDialer),
    Ssh(SshDialer),
}

impl Dialer {
    /// 按传输类型构造拨号器，`tcp` 提供网卡绑定与拨号超时
    pub fn new(kind: TransportKind, opts: &TransportOptions, tcp: TcpDialer) -> Result<Self, TransportError> {
        let iface = tcp.iface().map(str::to_string);
        Ok(match kind {
            TransportKind::Tcp => Self::Tcp(tcp),
            TransportKind::Kcp => Self::Kcp(KcpDialer::new(opts.kcp.clone(), iface)?),
            TransportKind::Quic => Self::Quic(QuicDialer::new(opts.quic.clone(), iface)?),
            TransportKind::Ws => Self::Ws(WsDialer::new(opts.ws.clone(), tcp)?),
            TransportKind::Obfs => Self::Obfs(ObfsDialer::new(opts.obfs.clone(), tcp)),
            TransportKind::Grpc => Self::Grpc(GrpcDialer::new(opts.grpc.clone(), tcp)?),
            TransportKind::Ssh => Self::Ssh(SshDialer::new(opts.ssh.clone(), tcp)?),
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Tcp(_) => TransportKind::Tcp,
            Self::Kcp(_) => TransportKind::Kcp,
            Self::Quic(_) => TransportKind::Quic,
            Self::Ws(_) => TransportKind::Ws,
            Self::Obfs(_) => TransportKind::Obfs,
            Self::Grpc(_) => TransportKind::Grpc,
            Self::Ssh(_) => TransportKind::Ssh,
        }
    }

    /// 建立到 `addr` 的一条字节流
    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        match self {
            Self::Tcp(d) => Ok(Box::new(d.connect(addr).await?)),
            Self::Kcp(d) => d.dial(addr).await,
            Self::Quic(d) => d.dial(addr).await,
            Self::Ws(d) => d.dial(addr).await,
            Self::Obfs(d) => d.dial(addr).await,
            Self::Grpc(d) => d.dial(addr).await,
            Self::Ssh(d) => d.dial(addr).await,
        }
    }

    /// 关闭池化的会话
    pub async fn close(&self) {
        match self {
            Self::Kcp(d) => d.close().await,
            Self::Quic(d) => d.close().await,
            Self::Grpc(d) => d.close().await,
            Self::Ssh(d) => d.close().await,
            Self::Tcp(_) | Self::Ws(_) | Self::Obfs(_) => {}
        }
    }
}

/// 入站监听器，丢弃时停止监听
pub struct Listener {
    kind: TransportKind,
    rx: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl Listener {
    pub async fn bind(kind: TransportKind, addr: &str, opts: &TransportOptions) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let token = CancellationToken::new();
        let local_addr = match kind {
            TransportKind::Tcp => tcp::listen(addr, tx, token.clone()).await?,
            TransportKind::Kcp => kcp::listen(addr, opts.kcp.clone(), tx, token.clone()).await?,
            TransportKind::Quic => quic::listen(addr, opts.quic.clone(), tx, token.clone()).await?,
            TransportKind::Ws => ws::listen(addr, opts.ws.clone(), tx, token.clone()).await?,
            TransportKind::Obfs => obfs::listen(addr, opts.obfs.clone(), tx, token.clone()).await?,
            TransportKind::Grpc => grpc::listen(addr, opts.grpc.clone(), tx, token.clone()).await?,
            TransportKind::Ssh => ssh::listen(addr, opts.ssh.clone(), tx, token.clone()).await?,
        };
        Ok(Self {
            kind,
            rx,
            local_addr,
            token,
        })
    }

    /// 等待下一条已握手的连接
    pub async fn accept(&mut self) -> io::Result<Accepted> {
        tokio::select! {
            conn = self.rx.recv() => conn.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "listener closed")
            }),
            _ = self.token.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_kind_parse() {
        assert_eq!("".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("default".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("WebSocket".parse::<TransportKind>().unwrap(), TransportKind::Ws);
        assert_eq!("grpc".parse::<TransportKind>().unwrap(), TransportKind::Grpc);
        assert!("http2".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Kcp.to_string(), "kcp");
        assert!(TransportKind::Ssh.is_multiplexed());
        assert!(!TransportKind::Obfs.is_multiplexed());
    }

    #[test]
    fn test_kind_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            transport: TransportKind,
        }
        let w: Wrapper = toml::from_str("transport = \"websocket\"").unwrap();
        assert_eq!(w.transport, TransportKind::Ws);
        let w: Wrapper = toml::from_str("transport = \"quic\"").unwrap();
        assert_eq!(w.transport, TransportKind::Quic);
    }

    #[test]
    fn test_error_into_io() {
        let e: io::Error = TransportError::InvalidOption("x".to_string()).into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);
        let e: io::Error = TransportError::Io(io::ErrorKind::TimedOut.into()).into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);
    }

    async fn roundtrip(kind: TransportKind) {
        let opts = TransportOptions::default();
        let mut listener = Listener::bind(kind, "127.0.0.1:0", &opts).await.unwrap();
        let addr = listener.local_addr().to_string();
        let dialer = Dialer::new(kind, &opts, TcpDialer::default()).unwrap();
        assert_eq!(dialer.kind(), kind);

        let mut conn = dialer.dial(&addr).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn.flush().await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        accepted.write_all(b"pong").await.unwrap();
        accepted.flush().await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        dialer.close().await;
    }

    #[tokio::test]
    async fn test_dialer_and_listener() {
        for kind in [
            TransportKind::Tcp,
            TransportKind::Ws,
            TransportKind::Obfs,
            TransportKind::Kcp,
            TransportKind::Grpc,
        ] {
            roundtrip(kind).await;
        }
    }

    #[tokio::test]
    async fn test_closed_listener() {
        let mut listener = Listener::bind(TransportKind::Tcp, "127.0.0.1:0", &TransportOptions::default())
            .await
            .unwrap();
        listener.close();
        let err = listener.accept().await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_bind_error() {
        let listener = Listener::bind(TransportKind::Tcp, "127.0.0.1:0", &TransportOptions::default())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();
        let err = Listener::bind(TransportKind::Tcp, &addr, &TransportOptions::default()).await;
        assert!(matches!(err, Err(TransportError::Bind(_, _))));
    }
}
