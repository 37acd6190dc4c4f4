//! WebSocket 传输
//!
//! 客户端在配置的路径上发起 HTTP/1.1 升级（可选 TLS），之后每次写入作为一个二进制消息发送。
//! 服务端校验路径与 `Host`，不匹配时拒绝升级。

use super::tcp::{bind, spawn_accept_loop, TcpDialer};
use super::tls::{acceptor, connector, server_name, TlsOptions};
use super::{Accepted, TransportError};
use crate::protocol::BoxStream;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/106.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsOptions {
    pub host: String,
    pub path: String,
    pub user_agent: String,
    pub snd_buffer: usize,
    pub rev_buffer: usize,
    /// permessage-deflate，当前不支持，仅保留配置项
    pub compress: bool,
    pub tls: TlsOptions,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            host: "www.baidu.com".to_string(),
            path: "/ws".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            snd_buffer: 4096,
            rev_buffer: 4096,
            compress: false,
            tls: TlsOptions::default(),
        }
    }
}

impl WsOptions {
    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.write_buffer_size = self.snd_buffer;
        config
    }
}

pub struct WsDialer {
    opts: WsOptions,
    tcp: TcpDialer,
    tls: Option<TlsConnector>,
}

impl WsDialer {
    pub fn new(opts: WsOptions, tcp: TcpDialer) -> Result<Self, TransportError> {
        if opts.compress {
            warn!("websocket compression is not supported, ignored");
        }
        let tls = if opts.tls.enable {
            Some(connector(&opts.tls, &[])?)
        } else {
            None
        };
        Ok(Self { opts, tcp, tls })
    }

    fn request(&self, addr: &str) -> io::Result<http::Request<()>> {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        let mut builder = http::Request::builder()
            .method("GET")
            .uri(format!("{}://{}{}", scheme, addr, self.opts.path))
            .header("Host", &self.opts.host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        if !self.opts.user_agent.is_empty() {
            builder = builder.header("User-Agent", &self.opts.user_agent);
        }
        builder
            .body(())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad websocket request: {}", e)))
    }

    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        let stream = self.tcp.connect(addr).await?;
        let request = self.request(addr)?;
        let config = Some(self.opts.ws_config());
        match &self.tls {
            Some(tls) => {
                let name = server_name(&self.opts.tls, addr)?;
                let stream = tls.connect(name, stream).await?;
                let (ws, _) = tokio_tungstenite::client_async_with_config(request, stream, config)
                    .await
                    .map_err(ws_error)?;
                Ok(Box::new(WsStream::new(ws)))
            }
            None => {
                let (ws, _) = tokio_tungstenite::client_async_with_config(request, stream, config)
                    .await
                    .map_err(ws_error)?;
                Ok(Box::new(WsStream::new(ws)))
            }
        }
    }
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("websocket: {}", e))
}

/// 服务端升级前的请求校验
fn check_request(opts: &WsOptions, req: &Request) -> Result<(), ErrorResponse> {
    let reject = |status: http::StatusCode| {
        let mut resp = ErrorResponse::new(None);
        *resp.status_mut() = status;
        resp
    };
    if req.uri().path() != opts.path {
        return Err(reject(http::StatusCode::NOT_FOUND));
    }
    if !opts.host.is_empty() {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        if host != opts.host {
            return Err(reject(http::StatusCode::FORBIDDEN));
        }
    }
    Ok(())
}

async fn accept<S>(stream: S, opts: WsOptions) -> io::Result<BoxStream>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let config = Some(opts.ws_config());
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| check_request(&opts, req).map(|_| resp),
        config,
    )
    .await
    .map_err(ws_error)?;
    Ok(Box::new(WsStream::new(ws)))
}

pub async fn listen(
    addr: &str,
    opts: WsOptions,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let tls: Option<TlsAcceptor> = if opts.tls.enable {
        Some(acceptor(&opts.tls, &[])?)
    } else {
        None
    };
    let listener = bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(path = %opts.path, tls = tls.is_some(), "WebSocket server listening on {}", local_addr);
    spawn_accept_loop(listener, tx, token, move |stream, peer| {
        let opts = opts.clone();
        let tls = tls.clone();
        async move {
            debug!("websocket upgrade from {}", peer);
            match tls {
                Some(tls) => accept(tls.accept(stream).await?, opts).await,
                None => accept(stream, opts).await,
            }
        }
    });
    Ok(local_addr)
}

/// 把 WebSocket 二进制消息流适配为字节流
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            offset: 0,
            eof: false,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            if self.offset < self.pending.len() {
                let n = (self.pending.len() - self.offset).min(buf.remaining());
                let start = self.offset;
                buf.put_slice(&self.pending[start..start + n]);
                self.offset += n;
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }
            match futures::ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    self.pending = data;
                    self.offset = 0;
                }
                Some(Ok(Message::Text(text))) => {
                    self.pending = text.into_bytes();
                    self.offset = 0;
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.eof = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(ws_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        futures::ready!(self.inner.poll_ready_unpin(cx)).map_err(ws_error)?;
        self.inner
            .start_send_unpin(Message::Binary(buf.to_vec()))
            .map_err(ws_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(ws_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tls::tests::{self_signed, server_opts};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo(mut rx: mpsc::Receiver<Accepted>) {
        while let Some((mut stream, _)) = rx.recv().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            stream.write_all(&buf[..n]).await.unwrap();
                            stream.flush().await.unwrap();
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_upgrade_request_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let n = stream.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        let dialer = WsDialer::new(WsOptions::default(), TcpDialer::default()).unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(500), dialer.dial(&addr.to_string())).await;
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(request.contains("Host: www.baidu.com\r\n") || request.contains("host: www.baidu.com\r\n"));
        assert!(request.to_ascii_lowercase().contains("upgrade: websocket"));
        assert!(request.to_ascii_lowercase().contains("sec-websocket-key: "));
    }

    #[tokio::test]
    async fn test_echo_over_websocket() {
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let addr = listen("127.0.0.1:0", WsOptions::default(), tx, token.clone()).await.unwrap();
        tokio::spawn(echo(rx));

        let dialer = WsDialer::new(WsOptions::default(), TcpDialer::default()).unwrap();
        let mut stream = dialer.dial(&addr.to_string()).await.unwrap();
        stream.write_all(b"over websocket").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over websocket");
        token.cancel();
    }

    #[tokio::test]
    async fn test_host_mismatch_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let addr = listen("127.0.0.1:0", WsOptions::default(), tx, token.clone()).await.unwrap();
        let opts = WsOptions {
            host: "other.example".to_string(),
            ..Default::default()
        };
        let dialer = WsDialer::new(opts, TcpDialer::default()).unwrap();
        assert!(dialer.dial(&addr.to_string()).await.is_err());

        let opts = WsOptions {
            path: "/other".to_string(),
            ..Default::default()
        };
        let dialer = WsDialer::new(opts, TcpDialer::default()).unwrap();
        assert!(dialer.dial(&addr.to_string()).await.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn test_wss_echo() {
        let (cert, key) = self_signed();
        let server = WsOptions {
            tls: server_opts(&cert, &key),
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let addr = listen("127.0.0.1:0", server, tx, token.clone()).await.unwrap();
        tokio::spawn(echo(rx));

        let client = WsOptions {
            tls: TlsOptions {
                enable: true,
                hostname: "localhost".to_string(),
                ca_path: cert.path().to_string_lossy().into_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        let dialer = WsDialer::new(client, TcpDialer::default()).unwrap();
        let mut stream = dialer.dial(&addr.to_string()).await.unwrap();
        stream.write_all(b"secure").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secure");
        token.cancel();
    }
}
