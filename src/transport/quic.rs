//! QUIC 传输
//!
//! 每个连接池槽位持有一条 QUIC 连接，每次请求在上面打开一条双向流。
//! 打开流失败时关闭该槽位并重拨一次。

use super::pool::{ConnPool, PoolSession};
use super::tcp::{bind_to_device, is_global_unicast};
use super::tls::{client_config, server_config, TlsOptions};
use super::{Accepted, TransportError};
use crate::protocol::BoxStream;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, Endpoint, EndpointConfig, IdleTimeout, RecvStream, SendStream, TransportConfig, VarInt};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// QUIC ALPN
pub const ALPN: [&[u8]; 2] = [b"http/3", b"quic/v1"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicOptions {
    /// 握手超时（秒）
    pub handshake_idle_timeout: u64,
    /// keepalive 间隔（秒）
    pub keepalive: u64,
    /// 最大空闲时间（秒）
    pub max_idle_timeout: u64,
    pub conns: usize,
    pub tls: TlsOptions,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self {
            handshake_idle_timeout: 5,
            keepalive: 30,
            max_idle_timeout: 30,
            conns: 3,
            tls: TlsOptions::default(),
        }
    }
}

impl QuicOptions {
    fn transport_config(&self, max_streams: u32) -> Result<TransportConfig, TransportError> {
        let mut config = TransportConfig::default();
        let idle = IdleTimeout::try_from(Duration::from_secs(self.max_idle_timeout))
            .map_err(|e| TransportError::InvalidOption(format!("quic max_idle_timeout: {}", e)))?;
        config.max_idle_timeout(Some(idle));
        if self.keepalive > 0 {
            config.keep_alive_interval(Some(Duration::from_secs(self.keepalive)));
        }
        config.max_concurrent_bidi_streams(VarInt::from_u32(max_streams));
        Ok(config)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_idle_timeout.max(1))
    }
}

/// 池中的一条 QUIC 连接，持有其所属端点
#[derive(Clone)]
pub struct QuicSession {
    conn: Connection,
    _endpoint: Endpoint,
}

impl PoolSession for QuicSession {
    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"");
    }
}

pub struct QuicDialer {
    opts: QuicOptions,
    client: quinn::ClientConfig,
    iface: Option<String>,
    pool: ConnPool<QuicSession>,
}

impl QuicDialer {
    pub fn new(opts: QuicOptions, iface: Option<String>) -> Result<Self, TransportError> {
        let mut tls_opts = opts.tls.clone();
        // 未配置 CA 时不校验服务端证书
        if tls_opts.ca_path.is_empty() {
            tls_opts.insecure = true;
        }
        let crypto = QuicClientConfig::try_from(client_config(&tls_opts, &ALPN)?)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let mut client = quinn::ClientConfig::new(Arc::new(crypto));
        client.transport_config(Arc::new(opts.transport_config(100)?));
        Ok(Self {
            pool: ConnPool::new(opts.conns),
            opts,
            client,
            iface,
        })
    }

    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        self.pool
            .open(
                || self.dial_session(addr),
                |session| async move {
                    let (send, recv) = session.conn.open_bi().await.map_err(|e| {
                        io::Error::new(io::ErrorKind::Other, format!("failed to open quic stream: {}", e))
                    })?;
                    Ok(Box::new(QuicStream::new(send, recv)) as BoxStream)
                },
            )
            .await
    }

    async fn dial_session(&self, addr: &str) -> io::Result<QuicSession> {
        let peer = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr)))?;
        let socket = local_udp(peer, self.iface.as_deref())?;
        let endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(quinn::TokioRuntime))?;

        let server_name = if self.opts.tls.hostname.is_empty() {
            peer.ip().to_string()
        } else {
            self.opts.tls.hostname.clone()
        };
        let connecting = endpoint
            .connect_with(self.client.clone(), peer, &server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("quic connect: {}", e)))?;
        let conn = tokio::time::timeout(self.opts.handshake_timeout(), connecting)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "quic handshake timed out"))?
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, format!("quic handshake: {}", e)))?;
        trace!(local = ?endpoint.local_addr().ok(), "quic dial new conn to {}", peer);
        Ok(QuicSession {
            conn,
            _endpoint: endpoint,
        })
    }

    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

fn local_udp(peer: SocketAddr, iface: Option<&str>) -> io::Result<std::net::UdpSocket> {
    let (domain, bind): (Domain, SocketAddr) = if peer.is_ipv4() {
        (Domain::IPV4, ([0, 0, 0, 0], 0).into())
    } else {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into())
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(iface) = iface {
        if is_global_unicast(&peer.ip()) {
            bind_to_device(&socket, iface)?;
        }
    }
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// 监听 QUIC，接受到的每条双向流送入 `tx`
pub async fn listen(
    addr: &str,
    opts: QuicOptions,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let crypto = QuicServerConfig::try_from(server_config(&opts.tls, &ALPN)?)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut server = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server.transport_config(Arc::new(opts.transport_config(65535)?));
    let bind = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| TransportError::InvalidOption(format!("invalid listen address {}", addr)))?;
    let endpoint = Endpoint::server(server, bind)?;
    let local_addr = endpoint.local_addr()?;
    info!("QUIC server listening on {}", local_addr);

    tokio::spawn(async move {
        loop {
            let incoming = tokio::select! {
                _ = token.cancelled() => break,
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                }
            };
            let tx = tx.clone();
            let token = token.clone();
            let handshake = opts.handshake_timeout();
            tokio::spawn(async move {
                let conn = match tokio::time::timeout(handshake, incoming).await {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        debug!("quic handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        debug!("quic handshake timed out");
                        return;
                    }
                };
                let remote = conn.remote_address();
                trace!("quic accept connection: {}", remote);
                serve_connection(conn, remote, tx, token).await;
            });
        }
        endpoint.close(VarInt::from_u32(0), b"");
    });
    Ok(local_addr)
}

async fn serve_connection(conn: Connection, remote: SocketAddr, tx: mpsc::Sender<Accepted>, token: CancellationToken) {
    loop {
        let (send, recv) = tokio::select! {
            _ = token.cancelled() => break,
            r = conn.accept_bi() => match r {
                Ok(pair) => pair,
                Err(e) => {
                    trace!("quic connection {} closed: {}", remote, e);
                    return;
                }
            }
        };
        if tx.send((Box::new(QuicStream::new(send, recv)), remote)).await.is_err() {
            break;
        }
    }
    conn.close(VarInt::from_u32(0), b"");
}

/// QUIC 双向流
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}
