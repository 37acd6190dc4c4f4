//! 混合端口
//!
//! 首字节为 0x05 按 SOCKS5 处理，否则按 HTTP 代理处理。

use super::{bind_tcp, spawn_serve, HttpListener, LocalContext, Socks5Listener};
use crate::protocol::socks5::{Credentials, SOCKS5_VERSION};
use crate::protocol::PrefixedStream;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

/// SOCKS5 与 HTTP 共用一个端口
#[derive(Clone)]
pub struct MixedListener {
    socks: Socks5Listener,
    http: HttpListener,
}

impl MixedListener {
    /// `socks_auth` 与 `http_auth` 分别作用于两种协议
    pub fn new(ctx: LocalContext, socks_auth: Option<Credentials>, http_auth: Option<Credentials>) -> Self {
        Self {
            socks: Socks5Listener::new(ctx.clone(), socks_auth),
            http: HttpListener::new(ctx, http_auth),
        }
    }

    /// 是否处理 SOCKS5 UDP ASSOCIATE
    pub fn with_udp(mut self, enabled: bool) -> Self {
        self.socks = self.socks.with_udp(enabled);
        self
    }

    pub async fn start(mut self, addr: &str, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let listener = bind_tcp(addr, "mixed").await?;
        let local = listener.local_addr()?;
        self.socks = self.socks.with_udp_ip(local.ip());
        info!("Mixed proxy listening on {}", local);

        let this = Arc::new(self);
        let session_token = token.clone();
        spawn_serve(listener, token, "mixed", move |stream, peer| {
            let this = this.clone();
            let token = session_token.clone();
            async move { this.handle(stream, peer, token).await }
        });
        Ok(local)
    }

    pub async fn handle<S>(&self, mut stream: S, peer: SocketAddr, token: CancellationToken) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let first = stream.read_u8().await?;
        let stream = PrefixedStream::new(vec![first], stream);
        if first == SOCKS5_VERSION {
            trace!(peer = %peer, "mixed: socks5");
            self.socks.handle(stream, peer, token).await
        } else {
            trace!(peer = %peer, "mixed: http");
            self.http.handle(stream, peer).await
        }
    }
}
