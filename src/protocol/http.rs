//! HTTP 代理协议
//!
//! 解析 HTTP/1.1 请求头，处理 `CONNECT` 隧道与普通请求的转发改写，
//! 以及 `Proxy-Authorization` 的 Basic 认证。

use crate::protocol::address::AddressError;
use crate::protocol::socks5::Credentials;
use crate::protocol::traits::PrefixedStream;
use crate::protocol::Address;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// 请求头最大长度
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// `Proxy-Agent` 头的取值
pub const PROXY_AGENT: &str = "mini-ss/1.0";

/// 逐跳头部，转发前删除
///
/// `Transfer-Encoding` 不在其中：请求体按原样透传，分块编码必须保留。
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "upgrade",
];

/// HTTP 代理错误
#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error("malformed http request: {0}")]
    Malformed(String),
    #[error("http request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("proxy authentication required")]
    AuthRequired,
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<HttpProxyError> for io::Error {
    fn from(e: HttpProxyError) -> Self {
        match e {
            HttpProxyError::Io(e) => e,
            HttpProxyError::AuthRequired => io::Error::new(io::ErrorKind::PermissionDenied, e),
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

/// 解析后的请求头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// 解析不含结尾空行的请求头
    pub fn parse(head: &[u8]) -> Result<Self, HttpProxyError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HttpProxyError::Malformed("request head is not utf-8".to_string()))?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HttpProxyError::Malformed("empty request line".to_string()))?;

        let mut parts = request_line.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v), None) if v.starts_with("HTTP/") => (m, u, v),
            _ => {
                return Err(HttpProxyError::Malformed(format!(
                    "bad request line: {}",
                    request_line
                )))
            }
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpProxyError::Malformed(format!("bad header line: {}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// 按名称（不区分大小写）取第一个头部
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 校验 `Proxy-Authorization: Basic ...`
    pub fn authorized(&self, creds: &Credentials) -> bool {
        let Some(value) = self.header("Proxy-Authorization") else {
            return false;
        };
        let Some((scheme, token)) = value.split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(token.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, pass)) => user == creds.username && pass == creds.password,
            None => false,
        }
    }

    /// 请求的目标地址
    ///
    /// `CONNECT` 取 `host:port`；其它方法取绝对 URI 的 authority，
    /// 缺省时退回 `Host` 头，端口默认 80。
    pub fn target(&self) -> Result<Address, HttpProxyError> {
        if self.is_connect() {
            return Ok(parse_host_port(&self.uri, 443)?);
        }
        match split_absolute_uri(&self.uri)? {
            Some((authority, _)) => Ok(parse_host_port(&authority, 80)?),
            None => {
                let host = self
                    .header("Host")
                    .ok_or_else(|| HttpProxyError::Malformed("missing host".to_string()))?;
                Ok(parse_host_port(host, 80)?)
            }
        }
    }

    /// 删除逐跳头部，包括 `Connection` 中点名的头部
    pub fn strip_hop_headers(&mut self) {
        let named: Vec<String> = self
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
            .flat_map(|(_, v)| v.split(',').map(|s| s.trim().to_ascii_lowercase()))
            .filter(|s| !s.is_empty())
            .collect();
        self.headers.retain(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !HOP_HEADERS.contains(&k.as_str()) && !named.contains(&k)
        });
    }

    /// 将绝对 URI 改写为 origin-form，并补齐 `Host` 头
    pub fn to_origin_form(&mut self) -> Result<(), HttpProxyError> {
        if let Some((authority, path)) = split_absolute_uri(&self.uri)? {
            self.uri = path;
            if self.header("Host").is_none() {
                self.headers.push(("Host".to_string(), authority));
            }
        }
        Ok(())
    }

    /// 序列化为请求头字节（含结尾空行）
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// 拆分绝对 URI 为 `(authority, path)`；origin-form 返回 `None`
fn split_absolute_uri(uri: &str) -> Result<Option<(String, String)>, HttpProxyError> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Ok(None);
    };
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(HttpProxyError::UnsupportedScheme(scheme.to_string()));
    }
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    if authority.is_empty() {
        return Err(HttpProxyError::Malformed(format!("missing host in {}", uri)));
    }
    let path = match &rest[end..] {
        "" => "/".to_string(),
        p if p.starts_with('/') => p.to_string(),
        p => format!("/{}", p),
    };
    Ok(Some((authority.to_string(), path)))
}

/// 解析 `host[:port]`，IPv6 需带方括号
pub fn parse_host_port(s: &str, default_port: u16) -> Result<Address, AddressError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| AddressError::InvalidHostOrPort(s.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse::<i64>()
                .map_err(|_| AddressError::InvalidHostOrPort(s.to_string()))?,
            None if tail.is_empty() => default_port as i64,
            None => return Err(AddressError::InvalidHostOrPort(s.to_string())),
        };
        return Address::from_host_port(host, port);
    }
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<i64>()
                .map_err(|_| AddressError::InvalidHostOrPort(s.to_string()))?;
            Address::from_host_port(host, port)
        }
        None => Address::from_host_port(s, default_port as i64),
    }
}

/// 读取完整请求头
///
/// # 返回
/// `(请求头, 已读入但属于请求体的剩余字节)`
pub async fn read_request_head<S>(stream: &mut S) -> Result<(Vec<u8>, Vec<u8>), HttpProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let mut scanned: usize = 0;
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpProxyError::Malformed("unexpected eof in request head".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let from = scanned.saturating_sub(3);
        if let Some(pos) = buf[from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let end = from + pos + 4;
            let leftover = buf.split_off(end);
            buf.truncate(end - 4);
            return Ok((buf, leftover));
        }
        scanned = buf.len();
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }
    }
}

/// 写一个无正文的状态应答
pub async fn write_status<S>(stream: &mut S, status: u16, reason: &str, extra: &[(&str, &str)]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (k, v) in extra {
        out.push_str(&format!("{}: {}\r\n", k, v));
    }
    out.push_str("Content-Length: 0\r\n\r\n");
    stream.write_all(out.as_bytes()).await?;
    stream.flush().await
}

/// 隧道建立应答
pub async fn write_connect_established<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = format!(
        "HTTP/1.1 200 Connection Established\r\nProxy-agent: {}\r\n\r\n",
        PROXY_AGENT
    );
    stream.write_all(reply.as_bytes()).await?;
    stream.flush().await
}

/// 已通过认证、目标已解析的代理请求
#[derive(Debug)]
pub struct ProxyRequest {
    pub request: HttpRequest,
    pub target: Address,
    leftover: Vec<u8>,
}

impl ProxyRequest {
    /// 建立到客户端的数据通道
    ///
    /// `CONNECT` 先回 200，返回的流从隧道数据开始；普通请求返回的流
    /// 先吐出改写后的请求头和已读入的请求体。
    pub async fn establish<S>(self, mut stream: S) -> Result<PrefixedStream<S>, HttpProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut req = self.request;
        if req.is_connect() {
            write_connect_established(&mut stream).await?;
            debug!(target = %self.target, "http connect");
            return Ok(PrefixedStream::new(self.leftover, stream));
        }
        req.strip_hop_headers();
        req.to_origin_form()?;
        let mut prefix = req.to_bytes();
        prefix.extend_from_slice(&self.leftover);
        debug!(method = %req.method, target = %self.target, "http forward");
        Ok(PrefixedStream::new(prefix, stream))
    }
}

/// 读取并校验代理请求
///
/// 认证失败回 407，请求不合法或非 http 绝对 URI 回 400。
pub async fn accept_request<S>(stream: &mut S, auth: Option<&Credentials>) -> Result<ProxyRequest, HttpProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_request_head(stream).await?;
    let request = match HttpRequest::parse(&head) {
        Ok(req) => req,
        Err(e) => {
            let _ = write_status(stream, 400, "Bad Request", &[("Connection", "close")]).await;
            return Err(e);
        }
    };

    if let Some(creds) = auth {
        if !request.authorized(creds) {
            write_status(
                stream,
                407,
                "Proxy Authentication Required",
                &[
                    ("Proxy-Authenticate", "Basic realm=\"mini-ss\""),
                    ("Connection", "close"),
                    ("Proxy-Connection", "close"),
                    ("Proxy-Agent", PROXY_AGENT),
                ],
            )
            .await?;
            return Err(HttpProxyError::AuthRequired);
        }
    }

    let target = match request.target() {
        Ok(target) => target,
        Err(e) => {
            write_status(stream, 400, "Bad Request", &[("Connection", "close")]).await?;
            return Err(e);
        }
    };
    Ok(ProxyRequest {
        request,
        target,
        leftover,
    })
}

/// 完成代理握手，返回目标与数据通道
pub async fn handshake<S>(
    mut stream: S,
    auth: Option<&Credentials>,
) -> Result<(Address, PrefixedStream<S>), HttpProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = accept_request(&mut stream, auth).await?;
    let target = request.target.clone();
    Ok((target, request.establish(stream).await?))
}
