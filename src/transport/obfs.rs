//! HTTP 混淆传输
//!
//! 客户端在第一段数据前附加一个伪造的 WebSocket 升级请求，服务端回一个伪造的
//! `101 Switching Protocols`（冒充 nginx），此后双方直接传输原始字节。
//! 请求方法、`Upgrade` 或 `Host` 不符时服务端返回 503 并断开。

use super::tcp::{bind, spawn_accept_loop, TcpDialer};
use super::{Accepted, TransportError};
use crate::conn::PendingWrite;
use crate::protocol::BoxStream;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const KEY_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/106.0.0.0 Safari/537.36";
/// HTTP 头的最大长度
const MAX_HEADER_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfsOptions {
    pub host: String,
}

impl Default for ObfsOptions {
    fn default() -> Self {
        Self {
            host: "www.baidu.com".to_string(),
        }
    }
}

/// `Sec-WebSocket-Accept` = base64(SHA1(key || GUID))
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(KEY_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn challenge_key() -> String {
    base64::engine::general_purpose::STANDARD.encode(crate::crypto::random_bytes(16))
}

fn client_request(host: &str) -> Vec<u8> {
    format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nUpgrade: websocket\r\n\r\n",
        host,
        USER_AGENT,
        challenge_key()
    )
    .into_bytes()
}

/// RFC 1123 格式的 GMT 时间
pub fn http_date(secs: u64) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    let weekday = DAYS[(days % 7) as usize];

    // 公历日期换算
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        weekday,
        day,
        MONTHS[(month - 1) as usize],
        year,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// 读取一个完整的 HTTP 头，返回头部与其后多读到的数据
async fn read_header<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof before http header end"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_header_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEADER_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "http header too large"));
        }
    }
}

struct RequestHead {
    method: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let mut lines = text.split("\r\n");
        let method = lines.next()?.split(' ').next()?.to_string();
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        Some(Self { method, headers })
    }

    fn header(&self, name: &str) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    }
}

/// 混淆连接
pub struct ObfsStream<S> {
    inner: S,
    /// 第一次写入前要发送的头部
    prefix: Option<Vec<u8>>,
    pending: PendingWrite,
    /// 客户端在第一次读取时丢弃服务端的响应头
    drain_response: bool,
    header: Vec<u8>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> ObfsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 客户端：请求头随第一段数据一起发出
    pub fn client(inner: S, host: &str) -> Self {
        Self {
            inner,
            prefix: Some(client_request(host)),
            pending: PendingWrite::default(),
            drain_response: true,
            header: Vec::new(),
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    /// 服务端：校验请求并回应升级
    ///
    /// 请求中已带有数据时，响应头推迟到第一次写入时一起发出。
    pub async fn server(mut inner: S, host: &str) -> io::Result<Self> {
        let (raw, rest) = read_header(&mut inner).await?;
        let head = RequestHead::parse(&raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed http request"))?;
        let now = crate::utils::current_timestamp_secs();
        if head.method != "GET" || head.header("upgrade") != "websocket" || head.header("host") != host {
            let resp = format!(
                "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nDate: {}\r\n\r\n",
                http_date(now)
            );
            let _ = inner.write_all(resp.as_bytes()).await;
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "bad request"));
        }
        let resp = format!(
            "HTTP/1.1 101 Switching Protocols\r\nServer: nginx/1.10.0\r\nDate: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            http_date(now),
            compute_accept_key(head.header("sec-websocket-key"))
        )
        .into_bytes();
        let prefix = if rest.is_empty() {
            inner.write_all(&resp).await?;
            None
        } else {
            Some(resp)
        };
        Ok(Self {
            inner,
            prefix,
            pending: PendingWrite::default(),
            drain_response: false,
            header: Vec::new(),
            read_buf: rest,
            read_pos: 0,
        })
    }

    fn poll_drain_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut chunk = [0u8; 1024];
        while self.drain_response {
            let mut rb = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
            if rb.filled().is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof before obfs response",
                )));
            }
            self.header.extend_from_slice(rb.filled());
            if let Some(end) = find_header_end(&self.header) {
                if !self.header.starts_with(b"HTTP/1.1 101") {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "obfs handshake rejected",
                    )));
                }
                self.read_buf = self.header.split_off(end);
                self.read_pos = 0;
                self.header = Vec::new();
                self.drain_response = false;
            } else if self.header.len() > MAX_HEADER_SIZE {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, "obfs response too large")));
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for ObfsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_response(cx))?;
        if this.read_pos < this.read_buf.len() {
            let n = (this.read_buf.len() - this.read_pos).min(buf.remaining());
            buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            if this.read_pos == this.read_buf.len() {
                this.read_buf = Vec::new();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for ObfsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match this.prefix.take() {
                Some(prefix) => {
                    let out = this.pending.fill(buf.len());
                    out.extend_from_slice(&prefix);
                    out.extend_from_slice(buf);
                }
                None => return Pin::new(&mut this.inner).poll_write(cx, buf),
            }
        }
        this.pending.poll_drain(Pin::new(&mut this.inner), cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            ready!(this.pending.poll_drain(Pin::new(&mut this.inner), cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            ready!(this.pending.poll_drain(Pin::new(&mut this.inner), cx))?;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

pub struct ObfsDialer {
    opts: ObfsOptions,
    tcp: TcpDialer,
}

impl ObfsDialer {
    pub fn new(opts: ObfsOptions, tcp: TcpDialer) -> Self {
        Self { opts, tcp }
    }

    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        let stream = self.tcp.connect(addr).await?;
        Ok(Box::new(ObfsStream::client(stream, &self.opts.host)))
    }
}

pub async fn listen(
    addr: &str,
    opts: ObfsOptions,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let listener = bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(host = %opts.host, "Obfs server listening on {}", local_addr);
    let host = opts.host;
    spawn_accept_loop(listener, tx, token, move |stream, peer| {
        let host = host.clone();
        async move {
            debug!("obfs handshake from {}", peer);
            let conn = ObfsStream::server(stream, &host).await?;
            Ok(Box::new(conn) as BoxStream)
        }
    });
    Ok(local_addr)
}
