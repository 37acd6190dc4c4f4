//! HTTP 代理入站

use super::{bind_tcp, spawn_serve, LocalContext};
use crate::protocol::http;
use crate::protocol::socks5::Credentials;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// HTTP / CONNECT 代理
#[derive(Clone)]
pub struct HttpListener {
    ctx: LocalContext,
    auth: Option<Credentials>,
}

impl HttpListener {
    pub fn new(ctx: LocalContext, auth: Option<Credentials>) -> Self {
        Self { ctx, auth }
    }

    /// 绑定 `addr` 并开始服务，返回实际监听地址
    pub async fn start(self, addr: &str, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let listener = bind_tcp(addr, "http").await?;
        let local = listener.local_addr()?;
        info!("HTTP proxy listening on {}", local);

        let this = Arc::new(self);
        spawn_serve(listener, token, "http", move |stream, peer| {
            let this = this.clone();
            async move { this.handle(stream, peer).await }
        });
        Ok(local)
    }

    /// 处理一个 HTTP 代理会话
    ///
    /// 只解析首个请求，之后的字节原样经隧道转发。规则拒绝时回 403。
    pub async fn handle<S>(&self, mut stream: S, peer: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request = http::accept_request(&mut stream, self.auth.as_ref()).await?;
        let target = self.ctx.target_of(&request.target);
        let (rule, selection) = match self.ctx.route(&target).await {
            Ok(v) => v,
            Err(e) => {
                http::write_status(&mut stream, 403, "Forbidden", &[("Connection", "close")]).await?;
                return Err(e.into());
            }
        };
        let stream = request.establish(stream).await?;
        self.ctx
            .relay_tcp(stream, peer, &target, &rule, &selection, "HTTP")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{direct_context, drop_context, echo_server};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_connect_tunnel() {
        let token = CancellationToken::new();
        let addr = HttpListener::new(direct_context(), None)
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let echo = echo_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", echo, echo);
        stream.write_all(req.as_bytes()).await.unwrap();
        let expected = b"HTTP/1.1 200 Connection Established\r\nProxy-agent: mini-ss/1.0\r\n\r\n";
        let mut reply = vec![0u8; expected.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], &expected[..]);

        stream.write_all(b"tunnel").await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");
        token.cancel();
    }

    #[tokio::test]
    async fn test_forward_plain_request() {
        let token = CancellationToken::new();
        let addr = HttpListener::new(direct_context(), None)
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let seen = tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let (head, _) = http::read_request_head(&mut s).await.unwrap();
            s.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            String::from_utf8(head).unwrap()
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "GET http://{}/index.html HTTP/1.1\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
            upstream_addr
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut reply = vec![0u8; 27];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], b"HTTP/1.1 204 No Content\r\n\r\n");

        let head = seen.await.unwrap();
        assert_eq!(
            head,
            format!("GET /index.html HTTP/1.1\r\nAccept: */*\r\nHost: {}", upstream_addr)
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_dropped_request_gets_403() {
        let token = CancellationToken::new();
        let addr = HttpListener::new(drop_context(), None)
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"CONNECT blocked.test:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 403"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_auth_required() {
        let token = CancellationToken::new();
        let addr = HttpListener::new(direct_context(), Some(Credentials::new("u", "p")))
            .start("127.0.0.1:0", token.clone())
            .await
            .unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET http://a.test/ HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let reply = String::from_utf8(reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 407"));
        assert!(reply.contains("Proxy-Authenticate: Basic realm=\"mini-ss\""));
        token.cancel();
    }
}
