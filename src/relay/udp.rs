//! UDP NAT 中继
//!
//! 每个客户端源地址对应一个独立的出站套接字。入站数据报先经过入站变换得到
//! 目标地址与负载，再从该客户端的出站套接字发出；出站套接字上的回包经过出站
//! 变换后写回客户端。出站套接字空闲超过超时时间后关闭并移出映射表。

use super::ProxyCipher;
use crate::protocol::{Address, PacketConn, SharedPacketConn};
use crate::transport::tcp::{bind_to_device, is_global_unicast};
use crate::utils::pool::udp_pool;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 出站套接字的空闲超时
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// SOCKS5 UDP 请求头 `RSV(2) FRAG(1)`
const SOCKS5_UDP_HEADER: [u8; 3] = [0x00, 0x00, 0x00];

/// 带加密层的数据报连接
///
/// 发送时整包加密，接收时整包解密；解密失败的数据报被丢弃。
pub struct CipherPacketConn<P> {
    inner: P,
    cipher: ProxyCipher,
}

impl<P> CipherPacketConn<P> {
    pub fn new(inner: P, cipher: ProxyCipher) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for CipherPacketConn<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut raw = udp_pool().get();
        loop {
            let (n, from) = self.inner.recv_from(&mut raw[..]).await?;
            match self.cipher.decrypt_packet(&raw[..n]) {
                Ok(plain) => {
                    let len = plain.len().min(buf.len());
                    buf[..len].copy_from_slice(&plain[..len]);
                    return Ok((len, from));
                }
                Err(e) => debug!("drop undecryptable datagram from {}: {}", from, e),
            }
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let sealed = self.cipher.encrypt_packet(buf)?;
        self.inner.send_to(&sealed, target).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// 中继方向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpMode {
    /// SOCKS5 UDP 报文直接发往报文内的目标
    Socks5Direct,
    /// 所有数据报直接发往固定目标
    Direct { target: String },
    /// SOCKS5 UDP 报文去掉请求头后交给代理服务器
    Socks5ToServer { server: String },
    /// 所有数据报加上固定目标地址头后交给代理服务器
    ToServer { server: String, remote: String },
    /// 服务端：数据报带地址头，发往解析出的目标
    ServerToRemote,
}

/// 入站变换的结果：发送的负载与目标
#[derive(Debug, PartialEq, Eq)]
struct Outgoing {
    payload: Vec<u8>,
    target: Option<Address>,
}

impl UdpMode {
    /// 代理服务器地址，仅经过代理的方向才有
    fn server(&self) -> Option<&str> {
        match self {
            UdpMode::Socks5ToServer { server } | UdpMode::ToServer { server, .. } => Some(server),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            UdpMode::Socks5Direct => "socks5-direct",
            UdpMode::Direct { .. } => "direct",
            UdpMode::Socks5ToServer { .. } => "socks5-to-server",
            UdpMode::ToServer { .. } => "to-server",
            UdpMode::ServerToRemote => "server-to-remote",
        }
    }

    /// 客户端 → 出站
    ///
    /// `target` 为空表示发往固定目标（代理服务器或直连目标）。
    fn inbound(&self, packet: &[u8], remote: Option<&Address>) -> io::Result<Outgoing> {
        match self {
            UdpMode::Socks5Direct => {
                let body = strip_socks5_header(packet)?;
                let (addr, n) = Address::parse_from_buffer(body)?;
                Ok(Outgoing {
                    payload: body[n..].to_vec(),
                    target: Some(addr),
                })
            }
            UdpMode::Direct { .. } => Ok(Outgoing {
                payload: packet.to_vec(),
                target: None,
            }),
            UdpMode::Socks5ToServer { .. } => {
                let body = strip_socks5_header(packet)?;
                Address::parse_from_buffer(body)?;
                Ok(Outgoing {
                    payload: body.to_vec(),
                    target: None,
                })
            }
            UdpMode::ToServer { .. } => {
                let remote = remote.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing remote"))?;
                let mut payload = Vec::with_capacity(remote.serialized_len() + packet.len());
                remote.write_to_buf(&mut payload);
                payload.extend_from_slice(packet);
                Ok(Outgoing { payload, target: None })
            }
            UdpMode::ServerToRemote => {
                let (addr, n) = Address::parse_from_buffer(packet)?;
                Ok(Outgoing {
                    payload: packet[n..].to_vec(),
                    target: Some(addr),
                })
            }
        }
    }

    /// 出站 → 客户端
    fn outbound(&self, packet: &[u8], from: SocketAddr) -> io::Result<Vec<u8>> {
        match self {
            UdpMode::Socks5Direct => {
                let addr = Address::from(canonical(from));
                let mut out = Vec::with_capacity(3 + addr.serialized_len() + packet.len());
                out.extend_from_slice(&SOCKS5_UDP_HEADER);
                addr.write_to_buf(&mut out);
                out.extend_from_slice(packet);
                Ok(out)
            }
            UdpMode::Direct { .. } => Ok(packet.to_vec()),
            UdpMode::Socks5ToServer { .. } => {
                Address::parse_from_buffer(packet)?;
                let mut out = Vec::with_capacity(3 + packet.len());
                out.extend_from_slice(&SOCKS5_UDP_HEADER);
                out.extend_from_slice(packet);
                Ok(out)
            }
            UdpMode::ToServer { .. } => {
                let (_, n) = Address::parse_from_buffer(packet)?;
                Ok(packet[n..].to_vec())
            }
            UdpMode::ServerToRemote => {
                let addr = Address::from(canonical(from));
                let mut out = Vec::with_capacity(addr.serialized_len() + packet.len());
                addr.write_to_buf(&mut out);
                out.extend_from_slice(packet);
                Ok(out)
            }
        }
    }
}

fn strip_socks5_header(packet: &[u8]) -> io::Result<&[u8]> {
    if packet.len() < 3 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short socks5 udp header"));
    }
    if packet[2] != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "socks5 udp fragment not supported"));
    }
    Ok(&packet[3..])
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// 解析目标地址，域名走系统解析
pub async fn resolve_udp_target(addr: &Address) -> io::Result<SocketAddr> {
    if let Some(sa) = addr.socket_addr() {
        return Ok(sa);
    }
    let host = addr.host();
    let resolved = lookup_host((host.as_str(), addr.port()))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr)));
    resolved
}

/// NAT 表项的出站套接字
///
/// 优先绑定双栈 `[::]:0`，IPv4 目标以映射地址发出，同一表项可以发往两种地址族。
/// 系统不支持双栈时退回 IPv4。收到的源地址统一还原为规范形式。
pub struct NatSocket {
    socket: UdpSocket,
    dual_stack: bool,
}

#[async_trait]
impl PacketConn for NatSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, canonical(from)))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let target = match target {
            SocketAddr::V4(v4) if self.dual_stack => SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()),
            other => other,
        };
        self.socket.send_to(buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

fn bind_udp(dual_stack: bool, iface: Option<&str>) -> io::Result<Socket> {
    let (domain, any) = if dual_stack {
        (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    } else {
        (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    if let Some(iface) = iface {
        bind_to_device(&socket, iface)?;
    }
    socket.bind(&SocketAddr::new(any, 0).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// 绑定一个本地出站 UDP 套接字
///
/// 设置了出站网卡且首个目标是全局单播地址时绑定到该网卡。
pub fn listen_local_udp(iface: Option<&str>, target: SocketAddr) -> io::Result<NatSocket> {
    let iface = iface.filter(|_| is_global_unicast(&target.ip()));
    let (socket, dual_stack) = match bind_udp(true, iface) {
        Ok(socket) => (socket, true),
        Err(e) => {
            debug!("dual-stack udp bind failed: {}, falling back to ipv4", e);
            (bind_udp(false, iface)?, false)
        }
    };
    Ok(NatSocket {
        socket: UdpSocket::from_std(socket.into())?,
        dual_stack,
    })
}

type NatMap = RwLock<HashMap<SocketAddr, SharedPacketConn>>;

/// UDP NAT 中继器
#[derive(Clone)]
pub struct UdpRelayer {
    mode: UdpMode,
    cipher: Option<ProxyCipher>,
    iface: Option<String>,
    idle_timeout: Duration,
    inbound_timeout: Option<Duration>,
}

impl UdpRelayer {
    /// 创建中继器
    ///
    /// # 参数
    /// * `mode` - 中继方向
    /// * `cipher` - 出站到代理服务器的加密层，只对经过代理的方向生效
    pub fn new(mode: UdpMode, cipher: Option<ProxyCipher>) -> Self {
        Self {
            mode,
            cipher,
            iface: None,
            idle_timeout: UDP_IDLE_TIMEOUT,
            inbound_timeout: None,
        }
    }

    pub fn with_iface(mut self, iface: Option<String>) -> Self {
        self.iface = iface.filter(|s| !s.is_empty());
        self
    }

    /// 出站套接字的空闲超时
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// 入站连接的空闲超时，超时后整个中继结束
    pub fn with_inbound_timeout(mut self, timeout: Duration) -> Self {
        self.inbound_timeout = Some(timeout);
        self
    }

    pub fn mode(&self) -> &UdpMode {
        &self.mode
    }

    /// 在 `conn` 上运行中继，直到 `conn` 出错、入站空闲超时或 `token` 被取消
    pub async fn relay(&self, conn: SharedPacketConn, token: CancellationToken) -> io::Result<()> {
        let fixed = match &self.mode {
            UdpMode::Direct { target } => Some(resolve_udp_target(&target.parse()?).await?),
            mode => match mode.server() {
                Some(server) => Some(resolve_udp_target(&server.parse()?).await?),
                None => None,
            },
        };
        let remote: Option<Address> = match &self.mode {
            UdpMode::ToServer { remote, .. } => Some(remote.parse()?),
            _ => None,
        };

        info!(mode = self.mode.name(), local = ?conn.local_addr().ok(), "udp-relay");
        let nat: Arc<NatMap> = Arc::new(RwLock::new(HashMap::new()));
        let child = token.child_token();
        let result = self.relay_loop(&conn, fixed, remote.as_ref(), &nat, &child).await;
        child.cancel();
        nat.write().await.clear();
        result
    }

    async fn relay_loop(
        &self,
        conn: &SharedPacketConn,
        fixed: Option<SocketAddr>,
        remote: Option<&Address>,
        nat: &Arc<NatMap>,
        token: &CancellationToken,
    ) -> io::Result<()> {
        let mut buf = udp_pool().get();
        loop {
            let recv = async {
                match self.inbound_timeout {
                    Some(d) => tokio::time::timeout(d, conn.recv_from(&mut buf[..]))
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "udp inbound idle"))?,
                    None => conn.recv_from(&mut buf[..]).await,
                }
            };
            let (n, client) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                r = recv => match r {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        debug!(mode = self.mode.name(), "udp inbound idle, closing relay");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            };

            let outgoing = match self.mode.inbound(&buf[..n], remote) {
                Ok(v) => v,
                Err(e) => {
                    debug!("drop datagram from {}: {}", client, e);
                    continue;
                }
            };
            let target = match (&outgoing.target, fixed) {
                (Some(addr), _) => match resolve_udp_target(addr).await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("resolve udp target {} failed: {}", addr, e);
                        continue;
                    }
                },
                (None, Some(t)) => t,
                (None, None) => continue,
            };

            let outbound = match self.outbound_for(conn, client, target, fixed, nat, token).await {
                Ok(o) => o,
                Err(e) => {
                    warn!("create udp outbound for {} failed: {}", client, e);
                    continue;
                }
            };
            trace!(client = %client, target = %target, len = outgoing.payload.len(), "udp send");
            if let Err(e) = outbound.send_to(&outgoing.payload, target).await {
                debug!("udp send to {} failed: {}", target, e);
            }
        }
    }

    /// 查找或创建客户端对应的出站套接字
    async fn outbound_for(
        &self,
        conn: &SharedPacketConn,
        client: SocketAddr,
        target: SocketAddr,
        fixed: Option<SocketAddr>,
        nat: &Arc<NatMap>,
        token: &CancellationToken,
    ) -> io::Result<SharedPacketConn> {
        if let Some(existing) = nat.read().await.get(&client) {
            return Ok(existing.clone());
        }
        let mut map = nat.write().await;
        if let Some(existing) = map.get(&client) {
            return Ok(existing.clone());
        }

        let socket = listen_local_udp(self.iface.as_deref(), target)?;
        let outbound: SharedPacketConn = match (&self.cipher, self.mode.server()) {
            (Some(cipher), Some(_)) => Arc::new(CipherPacketConn::new(socket, cipher.clone())),
            _ => Arc::new(socket),
        };
        map.insert(client, outbound.clone());
        drop(map);

        let peer = canonical(fixed.unwrap_or(target));
        debug!(client = %client, peer = %peer, local = ?outbound.local_addr().ok(), "udp nat entry created");
        tokio::spawn(reply_loop(
            self.mode.clone(),
            outbound.clone(),
            conn.clone(),
            client,
            peer,
            self.idle_timeout,
            nat.clone(),
            token.clone(),
        ));
        Ok(outbound)
    }
}

/// 出站 → 客户端的回包循环，空闲超时或出错后移除映射
///
/// 只接受来自 `peer`（表项创建时的首个目标，或固定的服务器/目标）的回包。
#[allow(clippy::too_many_arguments)]
async fn reply_loop(
    mode: UdpMode,
    outbound: SharedPacketConn,
    inbound: SharedPacketConn,
    client: SocketAddr,
    peer: SocketAddr,
    idle: Duration,
    nat: Arc<NatMap>,
    token: CancellationToken,
) {
    let mut buf = udp_pool().get();
    loop {
        let r = tokio::select! {
            _ = token.cancelled() => break,
            r = tokio::time::timeout(idle, outbound.recv_from(&mut buf[..])) => r,
        };
        let (n, from) = match r {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                debug!(client = %client, "udp outbound read failed: {}", e);
                break;
            }
            Err(_) => {
                trace!(client = %client, "udp nat entry idle");
                break;
            }
        };
        let from = canonical(from);
        if from != peer {
            trace!(client = %client, from = %from, "drop datagram from unexpected peer");
            continue;
        }
        match mode.outbound(&buf[..n], from) {
            Ok(packet) => {
                if let Err(e) = inbound.send_to(&packet, client).await {
                    debug!(client = %client, "udp write back failed: {}", e);
                }
            }
            Err(e) => debug!(client = %client, "drop reply: {}", e),
        }
    }

    let mut map = nat.write().await;
    if map.get(&client).is_some_and(|c| Arc::ptr_eq(c, &outbound)) {
        map.remove(&client);
    }
    debug!(client = %client, "udp nat entry removed");
}
