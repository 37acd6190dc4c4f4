//! SSR 混淆插件
//!
//! 混淆层直接作用在底层连接上，位于流加密之下。
//! 读方向可能需要回写握手数据，因此连接同时要求可读可写。

use super::tools::{append_rand_bytes, hmac_sha1};
use crate::conn::PendingWrite;
use rand::seq::SliceRandom;
use rand::Rng;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const TLS_VERSION: [u8; 2] = [0x03, 0x03];
const TLS_CHUNK_SIZE: usize = 2048;
const MAX_HANDSHAKE_SIZE: usize = 64 * 1024;
const HTTP_HEAD_LEN: usize = 30;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/44.0",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_10_5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/46.0.2490.86 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 10_0 like Mac OS X) AppleWebKit/602.1.38 (KHTML, like Gecko) Version/10.0 Mobile/14A300 Safari/602.1",
];

/// 混淆插件种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsKind {
    Plain,
    HttpSimple,
    HttpPost,
    RandomHead,
    Tls12TicketAuth,
}

impl ObfsKind {
    pub fn overhead(&self) -> usize {
        match self {
            ObfsKind::Tls12TicketAuth => 5,
            _ => 0,
        }
    }
}

impl FromStr for ObfsKind {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "plain" => Ok(ObfsKind::Plain),
            "http_simple" => Ok(ObfsKind::HttpSimple),
            "http_post" => Ok(ObfsKind::HttpPost),
            "random_head" => Ok(ObfsKind::RandomHead),
            "tls1.2_ticket_auth" | "tls1.2_ticket_fastauth" => Ok(ObfsKind::Tls12TicketAuth),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("obfs {} not supported", other),
            )),
        }
    }
}

/// 一个代理共享的混淆参数
#[derive(Debug)]
pub struct ObfsContext {
    kind: ObfsKind,
    host: String,
    port: u16,
    param: String,
    key: Vec<u8>,
    iv_size: usize,
    client_id: [u8; 32],
}

impl ObfsContext {
    pub fn new(kind: ObfsKind, host: &str, port: u16, param: &str, key: &[u8], iv_size: usize) -> Self {
        let mut client_id = [0u8; 32];
        rand::thread_rng().fill(&mut client_id);
        Self {
            kind,
            host: host.to_string(),
            port,
            param: param.to_string(),
            key: key.to_vec(),
            iv_size,
            client_id,
        }
    }

    pub fn kind(&self) -> ObfsKind {
        self.kind
    }

    fn tls_hmac(&self, data: &[u8]) -> Vec<u8> {
        let mut key = self.key.clone();
        key.extend_from_slice(&self.client_id);
        hmac_sha1(&key, data)
    }

    /// 混淆参数中的主机列表，未配置时使用服务器地址
    fn hosts(&self) -> (Vec<String>, Option<String>) {
        let mut hosts = if self.param.is_empty() {
            self.host.as_str()
        } else {
            self.param.as_str()
        };
        let mut body = None;
        if let Some(pos) = hosts.find('#') {
            body = Some(hosts[pos + 1..].replace("\\n", "\r\n").replace('\n', "\r\n"));
            hosts = &hosts[..pos];
        }
        let list = hosts
            .split(',')
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        (list, body)
    }
}

#[derive(Debug)]
enum ObfsState {
    Plain,
    Http {
        post: bool,
        sent_header: bool,
        recv_header: bool,
    },
    RandomHead {
        sent_header: bool,
        raw_trans_sent: bool,
        raw_trans_recv: bool,
        send_buffer: Vec<u8>,
    },
    Tls {
        // 0 未开始，1 已发 ClientHello，8 握手完成
        status: u8,
        send_buffer: Vec<u8>,
    },
}

/// 套上混淆层的连接
pub struct ObfsConn<S> {
    inner: S,
    ctx: Arc<ObfsContext>,
    state: ObfsState,
    rbuf: Vec<u8>,
    decoded: Vec<u8>,
    dpos: usize,
    eof: bool,
    pending: PendingWrite,
    reply: Vec<u8>,
    reply_pos: usize,
}

impl<S> ObfsConn<S> {
    pub fn new(inner: S, ctx: Arc<ObfsContext>) -> Self {
        let state = match ctx.kind {
            ObfsKind::Plain => ObfsState::Plain,
            ObfsKind::HttpSimple | ObfsKind::HttpPost => ObfsState::Http {
                post: ctx.kind == ObfsKind::HttpPost,
                sent_header: false,
                recv_header: false,
            },
            ObfsKind::RandomHead => ObfsState::RandomHead {
                sent_header: false,
                raw_trans_sent: false,
                raw_trans_recv: false,
                send_buffer: Vec::new(),
            },
            ObfsKind::Tls12TicketAuth => ObfsState::Tls {
                status: 0,
                send_buffer: Vec::new(),
            },
        };
        Self {
            inner,
            ctx,
            state,
            rbuf: Vec::new(),
            decoded: Vec::new(),
            dpos: 0,
            eof: false,
            pending: PendingWrite::default(),
            reply: Vec::new(),
            reply_pos: 0,
        }
    }

    /// 编码要写出的数据；返回空表示数据已被缓存
    fn encode(&mut self, data: &[u8]) -> Vec<u8> {
        let ctx = self.ctx.clone();
        match &mut self.state {
            ObfsState::Plain => data.to_vec(),
            ObfsState::Http {
                post, sent_header, ..
            } => {
                if *sent_header {
                    return data.to_vec();
                }
                *sent_header = true;
                http_request(&ctx, *post, data)
            }
            ObfsState::RandomHead {
                sent_header,
                raw_trans_sent,
                send_buffer,
                ..
            } => {
                if *raw_trans_sent {
                    return data.to_vec();
                }
                send_buffer.extend_from_slice(data);
                if *sent_header {
                    return Vec::new();
                }
                *sent_header = true;
                let mut head = Vec::new();
                append_rand_bytes(&mut head, rand::thread_rng().gen_range(0..96) + 4);
                let crc = 0xffff_ffffu32.wrapping_sub(crc32fast::hash(&head));
                head.extend_from_slice(&crc.to_le_bytes());
                head
            }
            ObfsState::Tls {
                status,
                send_buffer,
            } => {
                if *status == 8 {
                    let mut out = Vec::with_capacity(data.len() + 5 * (data.len() / TLS_CHUNK_SIZE + 1));
                    pack_tls_records(&mut out, data);
                    return out;
                }
                pack_tls_records(send_buffer, data);
                if *status == 0 {
                    *status = 1;
                    return tls_client_hello(&ctx);
                }
                Vec::new()
            }
        }
    }

    /// 处理读到的原始数据
    fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        let ctx = self.ctx.clone();
        match &mut self.state {
            ObfsState::Plain => self.decoded.extend_from_slice(data),
            ObfsState::Http { recv_header, .. } => {
                if *recv_header {
                    self.decoded.extend_from_slice(data);
                    return Ok(());
                }
                self.rbuf.extend_from_slice(data);
                if let Some(pos) = find_subslice(&self.rbuf, b"\r\n\r\n") {
                    *recv_header = true;
                    self.decoded.extend_from_slice(&self.rbuf[pos + 4..]);
                    self.rbuf.clear();
                } else if self.rbuf.len() > MAX_HANDSHAKE_SIZE {
                    return Err(invalid("http obfs response header too long"));
                }
            }
            ObfsState::RandomHead {
                raw_trans_sent,
                raw_trans_recv,
                send_buffer,
                ..
            } => {
                if *raw_trans_recv {
                    self.decoded.extend_from_slice(data);
                    return Ok(());
                }
                // 丢弃服务端的第一段数据，然后发出缓存的数据
                *raw_trans_recv = true;
                *raw_trans_sent = true;
                self.reply.append(send_buffer);
            }
            ObfsState::Tls {
                status,
                send_buffer,
            } => {
                self.rbuf.extend_from_slice(data);
                if *status != 8 {
                    let Some(end) = tls_server_hello_end(&self.rbuf)? else {
                        if self.rbuf.len() > MAX_HANDSHAKE_SIZE {
                            return Err(invalid("tls obfs handshake too long"));
                        }
                        return Ok(());
                    };
                    verify_server_hello(&ctx, &self.rbuf[..end])?;
                    self.rbuf.drain(..end);

                    let mut finish = vec![0x14, TLS_VERSION[0], TLS_VERSION[1], 0x00, 0x01, 0x01];
                    finish.extend_from_slice(&[0x16, TLS_VERSION[0], TLS_VERSION[1], 0x00, 0x20]);
                    append_rand_bytes(&mut finish, 22);
                    let mac = ctx.tls_hmac(&finish);
                    finish.extend_from_slice(&mac[..10]);
                    finish.append(send_buffer);
                    self.reply.extend_from_slice(&finish);
                    *status = 8;
                }
                while self.rbuf.len() >= 5 {
                    if self.rbuf[0] != 0x17 || self.rbuf[1..3] != TLS_VERSION {
                        return Err(invalid("tls obfs unexpected record"));
                    }
                    let len = u16::from_be_bytes([self.rbuf[3], self.rbuf[4]]) as usize;
                    if self.rbuf.len() < 5 + len {
                        break;
                    }
                    self.decoded.extend_from_slice(&self.rbuf[5..5 + len]);
                    self.rbuf.drain(..5 + len);
                }
            }
        }
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> ObfsConn<S> {
    fn poll_reply(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.reply_pos < self.reply.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.reply[self.reply_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.reply_pos += n;
        }
        if !self.reply.is_empty() {
            self.reply.clear();
            self.reply_pos = 0;
            ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ObfsConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            ready!(this.poll_reply(cx))?;
            if this.dpos < this.decoded.len() {
                let n = buf.remaining().min(this.decoded.len() - this.dpos);
                buf.put_slice(&this.decoded[this.dpos..this.dpos + n]);
                this.dpos += n;
                if this.dpos == this.decoded.len() {
                    this.decoded.clear();
                    this.dpos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 8192];
            let mut rb = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
            let n = rb.filled().len();
            if n == 0 {
                this.eof = true;
                continue;
            }
            this.feed(&tmp[..n])?;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfsConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_reply(cx))?;
        if this.pending.is_empty() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let encoded = this.encode(buf);
            if encoded.is_empty() {
                return Poll::Ready(Ok(buf.len()));
            }
            this.pending.fill(buf.len()).extend_from_slice(&encoded);
        }
        this.pending.poll_drain(Pin::new(&mut this.inner), cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_reply(cx))?;
        if !this.pending.is_empty() {
            ready!(this.pending.poll_drain(Pin::new(&mut this.inner), cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_reply(cx))?;
        if !this.pending.is_empty() {
            ready!(this.pending.poll_drain(Pin::new(&mut this.inner), cx))?;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn url_encode_head(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 3);
    for b in data {
        s.push_str(&format!("%{:02x}", b));
    }
    s
}

fn http_request(ctx: &ObfsContext, post: bool, data: &[u8]) -> Vec<u8> {
    let head_size = ctx.iv_size + HTTP_HEAD_LEN;
    let head_len = if data.len() > head_size + 64 {
        head_size + rand::thread_rng().gen_range(0..65)
    } else {
        data.len()
    };
    let (head, rest) = data.split_at(head_len);

    let (hosts, body) = ctx.hosts();
    let host = hosts
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_else(|| ctx.host.clone());
    let port = if ctx.port == 80 {
        String::new()
    } else {
        format!(":{}", ctx.port)
    };

    let mut req = format!(
        "{} /{} HTTP/1.1\r\nHost: {}{}\r\n",
        if post { "POST" } else { "GET" },
        url_encode_head(head),
        host,
        port
    );
    match body {
        Some(body) => {
            req.push_str(&body);
            req.push_str("\r\n\r\n");
        }
        None => {
            let ua = USER_AGENTS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(USER_AGENTS[0]);
            req.push_str(&format!("User-Agent: {}\r\n", ua));
            req.push_str("Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n");
            req.push_str("Accept-Language: en-US,en;q=0.8\r\nAccept-Encoding: gzip, deflate\r\n");
            if post {
                req.push_str(&format!(
                    "Content-Type: multipart/form-data; boundary={}\r\n",
                    crate::utils::random_string(32)
                ));
            }
            req.push_str("DNT: 1\r\nConnection: keep-alive\r\n\r\n");
        }
    }
    let mut out = req.into_bytes();
    out.extend_from_slice(rest);
    out
}

fn pack_tls_records(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(TLS_CHUNK_SIZE) {
        out.extend_from_slice(&[0x17, TLS_VERSION[0], TLS_VERSION[1]]);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
}

fn tls_auth_data(ctx: &ObfsContext) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    let mut data = now.to_be_bytes().to_vec();
    append_rand_bytes(&mut data, 18);
    let mac = ctx.tls_hmac(&data);
    data.extend_from_slice(&mac[..10]);
    data
}

fn tls_sni(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let mut entry = vec![0x00];
    entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
    entry.extend_from_slice(name);

    let mut ext = vec![0x00, 0x00];
    ext.extend_from_slice(&(entry.len() as u16 + 2).to_be_bytes());
    ext.extend_from_slice(&(entry.len() as u16).to_be_bytes());
    ext.extend_from_slice(&entry);
    ext
}

fn tls_client_hello(ctx: &ObfsContext) -> Vec<u8> {
    let mut body = TLS_VERSION.to_vec();
    body.extend_from_slice(&tls_auth_data(ctx));
    body.push(0x20);
    body.extend_from_slice(&ctx.client_id);
    body.extend_from_slice(&[
        0x00, 0x1c, 0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9, 0xcc, 0xa8, 0xcc, 0x14, 0xcc, 0x13, 0xc0,
        0x0a, 0xc0, 0x14, 0xc0, 0x09, 0xc0, 0x13, 0x00, 0x9c, 0x00, 0x35, 0x00, 0x2f, 0x00, 0x0a,
        0x01, 0x00,
    ]);

    let mut host = if ctx.param.is_empty() {
        ctx.host.clone()
    } else {
        ctx.param.clone()
    };
    if host.ends_with(|c: char| c.is_ascii_digit()) {
        host.clear();
    }
    let hosts: Vec<&str> = host.split(',').collect();
    let host = hosts.choose(&mut rand::thread_rng()).copied().unwrap_or("");

    let mut ext = vec![0xff, 0x01, 0x00, 0x01, 0x00];
    ext.extend_from_slice(&tls_sni(host));
    ext.extend_from_slice(&[0x00, 0x17, 0x00, 0x00]);
    let mut ticket = Vec::new();
    append_rand_bytes(&mut ticket, 16 * (rand::thread_rng().gen_range(0..17) + 8));
    ext.extend_from_slice(&[0x00, 0x23]);
    ext.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
    ext.extend_from_slice(&ticket);
    ext.extend_from_slice(&[
        0x00, 0x0d, 0x00, 0x16, 0x00, 0x14, 0x06, 0x01, 0x06, 0x03, 0x05, 0x01, 0x05, 0x03, 0x04,
        0x01, 0x04, 0x03, 0x03, 0x01, 0x03, 0x03, 0x02, 0x01, 0x02, 0x03,
    ]);
    ext.extend_from_slice(&[0x00, 0x05, 0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00]);
    ext.extend_from_slice(&[0x00, 0x12, 0x00, 0x00]);
    ext.extend_from_slice(&[0x75, 0x50, 0x00, 0x00]);
    ext.extend_from_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]);
    ext.extend_from_slice(&[0x00, 0x0a, 0x00, 0x06, 0x00, 0x04, 0x00, 0x17, 0x00, 0x18]);

    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![0x01, 0x00];
    handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// 找到服务端握手的结尾：ChangeCipherSpec 之后的第一个握手记录
fn tls_server_hello_end(buf: &[u8]) -> io::Result<Option<usize>> {
    let mut pos = 0;
    let mut seen_ccs = false;
    while pos + 5 <= buf.len() {
        let kind = buf[pos];
        if !matches!(kind, 0x14 | 0x16) {
            return Err(invalid("tls obfs unexpected handshake record"));
        }
        let len = u16::from_be_bytes([buf[pos + 3], buf[pos + 4]]) as usize;
        if pos + 5 + len > buf.len() {
            return Ok(None);
        }
        pos += 5 + len;
        if kind == 0x14 {
            seen_ccs = true;
        } else if seen_ccs {
            return Ok(Some(pos));
        }
    }
    Ok(None)
}

fn verify_server_hello(ctx: &ObfsContext, buf: &[u8]) -> io::Result<()> {
    if buf.len() < 53 {
        return Err(invalid("tls obfs server hello too short"));
    }
    if ctx.tls_hmac(&buf[11..33])[..10] != buf[33..43] {
        return Err(invalid("tls obfs server hello auth failed"));
    }
    let n = buf.len();
    if ctx.tls_hmac(&buf[..n - 10])[..10] != buf[n - 10..] {
        return Err(invalid("tls obfs server finished auth failed"));
    }
    Ok(())
}
