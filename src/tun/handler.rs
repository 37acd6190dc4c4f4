//! TUN 流量处理
//!
//! 网络栈交上来的 TCP 连接与 UDP 报文在这里完成 DNS 劫持、FakeIP 反查和
//! 规则匹配，然后交给选择器中继。

use crate::client::LocalContext;
use crate::dns::{DnsServer, Resolver};
use crate::protocol::{Address, PacketConn, SharedPacketConn};
use crate::relay::UDP_IDLE_TIMEOUT;
use crate::rule::{RuleMode, Selection};
use crate::statistic::{TrackerContext, UdpTracker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// 网络栈中的一个 UDP 报文：载荷、源地址、目的地址
pub type UdpMsg = (Vec<u8>, SocketAddr, SocketAddr);

/// 每个 UDP 会话缓存的入站报文数
const SESSION_QUEUE: usize = 64;

type SessionKey = (SocketAddr, SocketAddr);

/// TUN 连接处理器
pub struct TunHandler {
    ctx: LocalContext,
    resolver: Arc<Resolver>,
    dns: DnsServer,
    /// 伪造 DNS 服务地址
    dns_addr: SocketAddr,
    hijack: Vec<SocketAddr>,
    sessions: Mutex<HashMap<SessionKey, mpsc::Sender<Vec<u8>>>>,
}

impl TunHandler {
    pub fn new(ctx: LocalContext, resolver: Arc<Resolver>, dns_addr: SocketAddr) -> Self {
        Self {
            ctx,
            dns: DnsServer::new(resolver.clone()),
            resolver,
            dns_addr,
            hijack: Vec::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 额外劫持的 DNS 地址，IP 为未指定地址时匹配任意 IP 的同端口
    pub fn with_hijack(mut self, hijack: Vec<SocketAddr>) -> Self {
        self.hijack = hijack;
        self
    }

    pub fn dns_addr(&self) -> SocketAddr {
        self.dns_addr
    }

    /// 是否由本地 DNS 服务应答
    pub fn is_hijack(&self, dst: SocketAddr) -> bool {
        if dst == self.dns_addr || (dst.ip().is_loopback() && dst.port() == 53) {
            return true;
        }
        self.hijack
            .iter()
            .any(|h| h.port() == dst.port() && (h.ip().is_unspecified() || h.ip() == dst.ip()))
    }

    fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.resolver.fake_ip().is_some_and(|f| f.is_fake_ip(ip))
    }

    /// 目标地址对应的规则匹配串
    ///
    /// FakeIP 换回域名；DIRECT 模式下再解析出真实地址并回填记录。
    /// 没有记录时返回 None。
    pub async fn target_of(&self, dst: SocketAddr) -> Option<String> {
        let Some(fake) = self.resolver.fake_ip().filter(|f| f.is_fake_ip(dst.ip())) else {
            return Some(dst.to_string());
        };
        let Some(record) = fake.find_by_ip(dst.ip()) else {
            warn!("fake ip {} has no record", dst.ip());
            return None;
        };
        if self.ctx.ruler.mode() != RuleMode::Direct {
            return Some(format!("{}:{}", record.domain, dst.port()));
        }
        let ip = match record.real_ip {
            Some(ip) => ip,
            None => {
                let ip = self.resolver.lookup_host(&record.domain).await?;
                fake.set_real_ip(&record.domain, ip);
                ip
            }
        };
        Some(SocketAddr::new(ip, dst.port()).to_string())
    }

    /// 直连出口不能走系统解析，否则会查到自己的伪造地址
    async fn direct_remote(&self, target: &str) -> io::Result<String> {
        let addr: Address = target.parse()?;
        Ok(self.resolver.resolve_socket_addr(&addr).await?.to_string())
    }

    /// 处理一条被捕获的 TCP 连接
    pub async fn handle_tcp<S>(&self, stream: S, src: SocketAddr, dst: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_hijack(dst) {
            trace!(src = %src, "hijack dns over tcp");
            return self.dns.handle_tcp_stream(stream).await;
        }
        let target = self.target_of(dst).await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no fake dns record for {}", dst))
        })?;
        let (rule, selection) = self.ctx.route(&target).await?;
        let remote = match selection {
            Selection::Direct => self.direct_remote(&target).await?,
            _ => target,
        };
        self.ctx
            .relay_tcp(stream, src, &remote, &rule, &selection, "TCP-TUN")
            .await
    }

    /// 处理一个被捕获的 UDP 报文，应答经 `writer` 写回网络栈
    pub async fn handle_udp(self: &Arc<Self>, msg: UdpMsg, writer: &mpsc::Sender<UdpMsg>, token: &CancellationToken) {
        let (payload, src, dst) = msg;
        if self.is_hijack(dst) {
            if let Some(reply) = self.dns.handle_packet(&payload).await {
                let _ = writer.send((reply, dst, src)).await;
            }
            return;
        }
        if self.is_fake_ip(dst.ip()) {
            trace!("discard udp from {} to fake ip {}", src, dst);
            return;
        }

        let key = (src, dst);
        let existing = self.sessions.lock().get(&key).cloned();
        let tx = match existing {
            Some(tx) => tx,
            None => {
                let (tx, rx) = mpsc::channel(SESSION_QUEUE);
                self.sessions.lock().insert(key, tx.clone());
                let this = self.clone();
                let conn = TunUdpConn {
                    rx: tokio::sync::Mutex::new(rx),
                    writer: writer.clone(),
                    src,
                    dst,
                };
                let token = token.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.relay_udp(conn, token).await {
                        debug!("udp-tun session {} -> {} ended: {}", src, dst, e);
                    }
                    this.sessions.lock().remove(&key);
                });
                tx
            }
        };
        if tx.try_send(payload).is_err() {
            trace!("udp-tun session {} -> {} is busy, drop datagram", src, dst);
        }
    }

    async fn relay_udp(&self, conn: TunUdpConn, token: CancellationToken) -> io::Result<()> {
        let remote = conn.dst.to_string();
        let (rule, selection) = self.ctx.route(&remote).await?;
        let handler = self.ctx.selector.packet_handler(&selection);
        let relayer = self
            .ctx
            .selector
            .prepare_udp(handler.fixed_relayer(&remote))
            .with_inbound_timeout(UDP_IDLE_TIMEOUT);
        let context = TrackerContext {
            src: conn.src.to_string(),
            dst: remote,
            network: "UDP".to_string(),
            kind: "UDP-TUN".to_string(),
            rule: rule.kind.to_string(),
            proxy: handler.name().to_string(),
        };
        let conn: SharedPacketConn = Arc::new(UdpTracker::new(conn, self.ctx.statistic.clone(), context));
        relayer.relay(conn, token).await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// 网络栈里一个 (源, 目的) UDP 会话的报文连接
///
/// 读到的报文都来自 `src`，写出的报文都以 `dst` 为源地址回给 `src`。
struct TunUdpConn {
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    writer: mpsc::Sender<UdpMsg>,
    src: SocketAddr,
    dst: SocketAddr,
}

#[async_trait]
impl PacketConn for TunUdpConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let data = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "udp-tun session closed"))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, self.src))
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        self.writer
            .send((buf.to_vec(), self.dst, self.src))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun writer closed"))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.dst)
    }
}
