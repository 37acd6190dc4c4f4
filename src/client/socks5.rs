//! SOCKS5 入站
//!
//! CONNECT 经规则引擎选路后交给选择器中继；UDP ASSOCIATE 在本地开一个
//! UDP 套接字驱动 NAT 中继，控制连接关闭时中继随之结束。

use super::{bind_tcp, spawn_serve, LocalContext};
use crate::protocol::socks5::{self, Command, Credentials, ReplyCode};
use crate::protocol::{Address, SharedPacketConn};
use crate::statistic::{TrackerContext, UdpTracker};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SOCKS5 代理
#[derive(Clone)]
pub struct Socks5Listener {
    ctx: LocalContext,
    auth: Option<Credentials>,
    udp: bool,
    udp_ip: IpAddr,
}

impl Socks5Listener {
    pub fn new(ctx: LocalContext, auth: Option<Credentials>) -> Self {
        Self {
            ctx,
            auth,
            udp: true,
            udp_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    /// 是否处理 UDP ASSOCIATE
    pub fn with_udp(mut self, enabled: bool) -> Self {
        self.udp = enabled;
        self
    }

    /// UDP 中继套接字绑定的地址，同时写入 UDP ASSOCIATE 应答
    pub(crate) fn with_udp_ip(mut self, ip: IpAddr) -> Self {
        self.udp_ip = ip;
        self
    }

    /// 绑定 `addr` 并开始服务，返回实际监听地址
    pub async fn start(self, addr: &str, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let listener = bind_tcp(addr, "socks5").await?;
        let local = listener.local_addr()?;
        let this = self.with_udp_ip(local.ip());
        info!("SOCKS5 proxy listening on {}", local);

        let this = Arc::new(this);
        let session_token = token.clone();
        spawn_serve(listener, token, "socks5", move |stream, peer| {
            let this = this.clone();
            let token = session_token.clone();
            async move { this.handle(stream, peer, token).await }
        });
        Ok(local)
    }

    /// 处理一个 SOCKS5 会话
    pub async fn handle<S>(&self, mut stream: S, peer: SocketAddr, token: CancellationToken) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        socks5::negotiate(&mut stream, self.auth.as_ref()).await?;
        let request = socks5::read_request(&mut stream).await?;
        match request.command {
            Command::Connect => self.connect(stream, peer, request.address).await,
            Command::UdpAssociate if self.udp => self.associate(stream, peer, request.address, token).await,
            command => {
                socks5::write_reply(&mut stream, ReplyCode::CommandNotSupported, &socks5::unspecified()).await?;
                Err(socks5::Socks5Error::UnsupportedCommand(command.code()).into())
            }
        }
    }

    async fn connect<S>(&self, mut stream: S, peer: SocketAddr, address: Address) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let target = self.ctx.target_of(&address);
        let (rule, selection) = match self.ctx.route(&target).await {
            Ok(v) => v,
            Err(e) => {
                socks5::write_reply(&mut stream, ReplyCode::ConnectionNotAllowed, &socks5::unspecified()).await?;
                return Err(e.into());
            }
        };
        socks5::write_reply(&mut stream, ReplyCode::Succeeded, &socks5::unspecified()).await?;
        self.ctx
            .relay_tcp(stream, peer, &target, &rule, &selection, "SOCKS")
            .await
    }

    async fn associate<S>(&self, mut stream: S, peer: SocketAddr, address: Address, token: CancellationToken) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let target = self.ctx.target_of(&address);
        let (rule, selection) = match self.ctx.route(&target).await {
            Ok(v) => v,
            Err(e) => {
                socks5::write_reply(&mut stream, ReplyCode::ConnectionNotAllowed, &socks5::unspecified()).await?;
                return Err(e.into());
            }
        };

        let socket = UdpSocket::bind(SocketAddr::new(self.udp_ip, 0)).await?;
        let port = socket.local_addr()?.port();
        let reply_ip = if self.udp_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.udp_ip
        };
        socks5::write_reply(&mut stream, ReplyCode::Succeeded, &Address::SocketAddr(SocketAddr::new(reply_ip, port))).await?;

        let handler = self.ctx.selector.packet_handler(&selection);
        let relayer = self.ctx.selector.prepare_udp(handler.socks5_relayer());
        let context = TrackerContext {
            src: peer.to_string(),
            dst: target.clone(),
            network: "UDP".to_string(),
            kind: "SOCKS".to_string(),
            rule: rule.kind.to_string(),
            proxy: handler.name().to_string(),
        };
        let conn: SharedPacketConn = Arc::new(UdpTracker::new(socket, self.ctx.statistic.clone(), context));
        debug!(peer = %peer, port, proxy = handler.name(), "socks5 udp associate");

        let udp_token = token.child_token();
        let relay_token = udp_token.clone();
        let relay = tokio::spawn(async move { relayer.relay(conn, relay_token).await });

        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = udp_token.cancelled() => break,
                r = stream.read(&mut buf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
            }
        }
        udp_token.cancel();
        match relay.await {
            Ok(Err(e)) => warn!("socks5 udp relay for {} ended: {}", peer, e),
            Err(e) => warn!("socks5 udp relay for {} panicked: {}", peer, e),
            Ok(Ok(())) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{direct_context, drop_context, echo_server};
    use crate::protocol::socks5::{client_request, decode_udp_packet, encode_udp_packet, Socks5Error};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_connect_direct() {
        let token = CancellationToken::new();
        let ctx = direct_context();
        let addr = Socks5Listener::new(ctx, None).start("127.0.0.1:0", token.clone()).await.unwrap();
        let echo = echo_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let bind = client_request(&mut stream, None, Command::Connect, &Address::from(echo)).await.unwrap();
        assert_eq!(bind, socks5::unspecified());
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        token.cancel();
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let token = CancellationToken::new();
        let creds = Credentials::new("user", "pass");
        let addr = Socks5Listener::new(direct_context(), Some(creds.clone()))
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let echo = echo_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(client_request(&mut stream, Some(&creds), Command::Connect, &Address::from(echo)).await.is_ok());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let wrong = Credentials::new("user", "nope");
        assert!(matches!(
            client_request(&mut stream, Some(&wrong), Command::Connect, &Address::from(echo)).await,
            Err(Socks5Error::AuthFailed)
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn test_connect_dropped_by_rule() {
        let token = CancellationToken::new();
        let addr = Socks5Listener::new(drop_context(), None).start("127.0.0.1:0", token.clone()).await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let target: Address = "example.com:80".parse().unwrap();
        assert!(matches!(
            client_request(&mut stream, None, Command::Connect, &target).await,
            Err(Socks5Error::Rejected(ReplyCode::ConnectionNotAllowed))
        ));
        token.cancel();
    }

    #[tokio::test]
    async fn test_udp_associate_direct() {
        let token = CancellationToken::new();
        let addr = Socks5Listener::new(direct_context(), None).start("127.0.0.1:0", token.clone()).await.unwrap();

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let mut control = TcpStream::connect(addr).await.unwrap();
        let bind = client_request(&mut control, None, Command::UdpAssociate, &socks5::unspecified())
            .await
            .unwrap();
        let relay_addr = bind.socket_addr().unwrap();
        assert_eq!(relay_addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = encode_udp_packet(&Address::from(echo_addr), b"dns?");
        client.send_to(&packet, relay_addr).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let (from, payload) = decode_udp_packet(&buf[..n]).unwrap();
        assert_eq!(from, Address::from(echo_addr));
        assert_eq!(payload, b"dns?");

        drop(control);
        token.cancel();
    }

    #[tokio::test]
    async fn test_udp_associate_disabled() {
        let token = CancellationToken::new();
        let addr = Socks5Listener::new(direct_context(), None)
            .with_udp(false)
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let mut control = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            client_request(&mut control, None, Command::UdpAssociate, &socks5::unspecified()).await,
            Err(Socks5Error::Rejected(ReplyCode::CommandNotSupported))
        ));
        token.cancel();
    }
}
