//! TCP 传输
//!
//! 出站连接支持绑定网卡（Linux 上为 `SO_BINDTODEVICE`）以及双栈竞速；
//! 入站连接统一设置 180 秒的 TCP keepalive。

use super::{Accepted, TransportError};
use crate::protocol::BoxStream;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// 默认拨号超时
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// 入站握手（TLS、WebSocket 升级等）超时
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// 入站连接的 keepalive 周期
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

/// 是否为可路由的单播地址；回环、链路本地、组播和未指定地址不绑定网卡
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() || link_local)
        }
    }
}

/// 把套接字绑定到指定网卡
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn bind_to_device(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn bind_to_device(_socket: &Socket, iface: &str) -> io::Result<()> {
    debug!(iface, "interface binding is only supported on linux");
    Ok(())
}

/// TCP 拨号器
#[derive(Debug, Clone)]
pub struct TcpDialer {
    iface: Option<String>,
    timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(None, DEFAULT_DIAL_TIMEOUT)
    }
}

impl TcpDialer {
    /// 创建拨号器
    ///
    /// # 参数
    /// * `iface` - 出站网卡名，为空表示不绑定
    /// * `timeout` - 整个拨号过程的超时
    pub fn new(iface: Option<String>, timeout: Duration) -> Self {
        let iface = iface.filter(|name| !name.is_empty());
        Self { iface, timeout }
    }

    pub fn iface(&self) -> Option<&str> {
        self.iface.as_deref()
    }

    /// 连接 `host:port`，同时拥有 IPv4 与 IPv6 地址时两个地址族并发竞速
    pub async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, self.connect_inner(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {} timed out after {:?}", addr, self.timeout),
            )),
        }
    }

    async fn connect_inner(&self, addr: &str) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host(addr).await?.collect();
        let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) = addrs.into_iter().partition(|a| a.is_ipv4());
        match (v4.is_empty(), v6.is_empty()) {
            (true, true) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}", addr),
            )),
            (false, true) => self.connect_family(&v4).await,
            (true, false) => self.connect_family(&v6).await,
            (false, false) => {
                trace!(addr, "dual-stack dial");
                let attempts = vec![
                    Box::pin(self.connect_family(&v4)),
                    Box::pin(self.connect_family(&v6)),
                ];
                let (stream, _) = futures::future::select_ok(attempts).await?;
                Ok(stream)
            }
        }
    }

    /// 依次尝试同一地址族内的地址
    async fn connect_family(&self, addrs: &[SocketAddr]) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address");
        for addr in addrs {
            match self.connect_addr(*addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Failed to connect to {}: {}", addr, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// 连接单个地址
    pub async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if let Some(iface) = &self.iface {
            if is_global_unicast(&addr.ip()) {
                bind_to_device(&socket, iface)?;
            }
        }
        socket.set_nonblocking(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// 给入站连接设置 keepalive
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// 接受一个连接并设置 keepalive
pub async fn accept_keepalive(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, peer) = listener.accept().await?;
    if let Err(e) = set_keepalive(&stream) {
        debug!("Failed to set keepalive for {}: {}", peer, e);
    }
    Ok((stream, peer))
}

/// 绑定监听地址
pub async fn bind(addr: &str) -> Result<TcpListener, TransportError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| TransportError::Bind(addr.to_string(), e))
}

/// 在 `listener` 上循环接受连接，每个连接经 `upgrade` 握手后送入 `tx`
///
/// 握手失败只记录日志，不影响监听。
pub fn spawn_accept_loop<F, Fut>(
    listener: TcpListener,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
    upgrade: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<BoxStream>> + Send + 'static,
{
    let upgrade = Arc::new(upgrade);
    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                r = accept_keepalive(&listener) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        continue;
                    }
                }
            };
            let tx = tx.clone();
            let upgrade = upgrade.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade(stream, peer)).await {
                    Ok(Ok(conn)) => {
                        let _ = tx.send((conn, peer)).await;
                    }
                    Ok(Err(e)) => debug!("handshake with {} failed: {}", peer, e),
                    Err(_) => debug!("handshake with {} timed out", peer),
                }
            });
        }
    });
}

/// 监听原始 TCP
pub async fn listen(addr: &str, tx: mpsc::Sender<Accepted>, token: CancellationToken) -> Result<SocketAddr, TransportError> {
    let listener = bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("TCP server listening on {}", local_addr);
    spawn_accept_loop(listener, tx, token, |stream, _| async move { Ok(Box::new(stream) as BoxStream) });
    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast(&"8.8.8.8".parse().unwrap()));
        assert!(is_global_unicast(&"192.168.1.1".parse().unwrap()));
        assert!(!is_global_unicast(&"127.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast(&"0.0.0.0".parse().unwrap()));
        assert!(!is_global_unicast(&"224.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast(&"fe80::1".parse().unwrap()));
        assert!(is_global_unicast(&"2001:db8::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = accept_keepalive(&listener).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let dialer = TcpDialer::new(Some(String::new()), Duration::from_secs(2));
        assert!(dialer.iface().is_none());
        let mut stream = dialer.connect(&addr.to_string()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_delivers_streams() {
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let addr = listen("127.0.0.1:0", tx, token.clone()).await.unwrap();
        let mut client = TcpDialer::default().connect(&addr.to_string()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let (mut conn, peer) = rx.recv().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        token.cancel();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let dialer = TcpDialer::default();
        assert!(dialer.connect(&addr.to_string()).await.is_err());
    }
}
