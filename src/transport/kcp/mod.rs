//! KCP 传输
//!
//! 可靠 UDP（KCP）+ 可选 snappy 压缩 + smux 多路复用。
//! 客户端按连接池持有若干个 KCP 会话，每次请求在其中一个会话上打开一条 smux 流。

pub mod crypt;
pub mod fec;
pub mod session;

use self::crypt::{BlockCrypt, CryptKind};
use self::session::{spawn_session, KcpParams, PacketCodec, SessionLink};
use super::pool::ConnPool;
use super::smux::{Session, SmuxConfig};
use super::tcp::{bind_to_device, is_global_unicast};
use super::{Accepted, TransportError};
use crate::conn::CompressConn;
use crate::protocol::BoxStream;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 拨号失败时的重试次数
const DIAL_RETRIES: usize = 3;
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const INBOUND_QUEUE: usize = 1024;
const MAX_DATAGRAM: usize = 2048;

/// KCP 参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KcpOptions {
    /// 块加密密钥
    pub key: String,
    /// 块加密算法
    pub crypt: String,
    /// 预设模式：normal / fast / fast2 / fast3
    pub mode: String,
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
    pub datashard: usize,
    pub parityshard: usize,
    pub dscp: u32,
    pub no_compress: bool,
    pub ack_nodelay: bool,
    pub nodelay: i32,
    pub interval: i32,
    pub resend: i32,
    pub nc: i32,
    pub sockbuf: usize,
    pub smuxver: u8,
    pub smuxbuf: usize,
    pub streambuf: u32,
    /// keepalive 间隔（秒）
    pub keepalive: u64,
    /// 连接池会话数
    pub conns: usize,
}

impl Default for KcpOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            crypt: "none".to_string(),
            mode: "normal".to_string(),
            mtu: 1350,
            sndwnd: 2048,
            rcvwnd: 2048,
            datashard: 10,
            parityshard: 3,
            dscp: 46,
            no_compress: true,
            ack_nodelay: false,
            nodelay: 0,
            interval: 40,
            resend: 2,
            nc: 1,
            sockbuf: 16_777_217,
            smuxver: 1,
            smuxbuf: 16_777_217,
            streambuf: 2_097_152,
            keepalive: 10,
            conns: 3,
        }
    }
}

impl KcpOptions {
    /// 按模式预设得到 `(nodelay, interval, resend, nc)`
    pub fn tuning(&self) -> (i32, i32, i32, i32) {
        match self.mode.as_str() {
            "normal" => (0, 40, 2, 1),
            "fast" => (0, 30, 2, 1),
            "fast2" => (1, 20, 2, 1),
            "fast3" => (1, 10, 2, 1),
            _ => (self.nodelay, self.interval, self.resend, self.nc),
        }
    }

    pub fn params(&self) -> KcpParams {
        let (nodelay, interval, resend, nc) = self.tuning();
        KcpParams {
            nodelay: nodelay != 0,
            interval,
            resend,
            nc: nc != 0,
            snd_wnd: self.sndwnd,
            rcv_wnd: self.rcvwnd,
            mtu: self.mtu,
        }
    }

    pub fn block_crypt(&self) -> Result<BlockCrypt, TransportError> {
        let kind: CryptKind = self
            .crypt
            .parse()
            .map_err(|e| TransportError::InvalidOption(format!("{}", e)))?;
        Ok(BlockCrypt::new(kind, &self.key))
    }

    pub fn smux_config(&self) -> SmuxConfig {
        SmuxConfig {
            version: if self.smuxver == 2 { 2 } else { 1 },
            keepalive_interval: Duration::from_secs(self.keepalive.max(1)),
            max_stream_buffer: self.streambuf,
            ..Default::default()
        }
    }

    fn codec(&self, crypt: &BlockCrypt) -> io::Result<PacketCodec> {
        PacketCodec::new(crypt.clone(), self.datashard, self.parityshard)
    }

    fn wrap<T>(&self, stream: T) -> BoxStream
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.no_compress {
            Box::new(stream)
        } else {
            Box::new(CompressConn::new(stream))
        }
    }
}

/// 按选项设置 UDP 套接字
fn configure_socket(socket: &Socket, opts: &KcpOptions) {
    if opts.sockbuf > 0 {
        if let Err(e) = socket.set_recv_buffer_size(opts.sockbuf) {
            debug!("kcp set recv buffer: {}", e);
        }
        if let Err(e) = socket.set_send_buffer_size(opts.sockbuf) {
            debug!("kcp set send buffer: {}", e);
        }
    }
    if opts.dscp > 0 {
        if let Err(e) = socket.set_tos(opts.dscp << 2) {
            debug!("kcp set dscp: {}", e);
        }
    }
}

fn udp_socket(bind: SocketAddr, opts: &KcpOptions, iface: Option<&str>, peer: Option<SocketAddr>) -> io::Result<UdpSocket> {
    let domain = if bind.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let (Some(iface), Some(peer)) = (iface, peer) {
        if is_global_unicast(&peer.ip()) {
            bind_to_device(&socket, iface)?;
        }
    }
    configure_socket(&socket, opts);
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    UdpSocket::from_std(socket.into())
}

/// KCP 拨号器
pub struct KcpDialer {
    opts: KcpOptions,
    crypt: BlockCrypt,
    iface: Option<String>,
    pool: ConnPool<Session>,
}

impl KcpDialer {
    pub fn new(opts: KcpOptions, iface: Option<String>) -> Result<Self, TransportError> {
        let crypt = opts.block_crypt()?;
        Ok(Self {
            pool: ConnPool::new(opts.conns),
            opts,
            crypt,
            iface,
        })
    }

    /// 在池中的某个会话上打开一条流
    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        self.pool
            .open(
                || self.dial_with_retry(addr),
                |session| async move { Ok(Box::new(session.open_stream().await?) as BoxStream) },
            )
            .await
    }

    async fn dial_with_retry(&self, addr: &str) -> io::Result<Session> {
        let mut last_err = None;
        for attempt in 0..DIAL_RETRIES {
            match self.dial_session(addr).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(attempt, "kcp dial {} failed: {}", addr, e);
                    last_err = Some(e);
                    if attempt + 1 < DIAL_RETRIES {
                        tokio::time::sleep(DIAL_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, format!("dial {} failed", addr))))
    }

    async fn dial_session(&self, addr: &str) -> io::Result<Session> {
        let peer = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", addr)))?;
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(udp_socket(bind, &self.opts, self.iface.as_deref(), Some(peer))?);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        let reader = socket.clone();
        let reader_token = token.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break,
                    r = reader.recv_from(&mut buf) => match r {
                        Ok((n, from)) if from == peer => {
                            if tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!("kcp socket read failed: {}", e);
                            break;
                        }
                    }
                }
            }
            reader_token.cancel();
        });

        let conv: u32 = rand::random();
        let link = SessionLink {
            socket,
            peer,
            inbound: rx,
        };
        let pipe = spawn_session(Some(conv), self.opts.params(), self.opts.codec(&self.crypt)?, link, token.clone());
        let session = Session::client(self.opts.wrap(pipe), self.opts.smux_config());

        // smux 会话关闭时一并结束 KCP 会话
        let watch = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => watch.close(),
                _ = watch_closed(&watch) => token.cancel(),
            }
        });
        debug!(peer = %peer, conv, "kcp session established");
        Ok(session)
    }

    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

async fn watch_closed(session: &Session) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    while !session.is_closed() {
        tick.tick().await;
    }
}

/// 监听 KCP，把每个会话上接受到的 smux 流送入 `tx`
pub async fn listen(
    addr: &str,
    opts: KcpOptions,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let crypt = opts.block_crypt()?;
    let bind = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| TransportError::InvalidOption(format!("invalid listen address {}", addr)))?;
    let socket = Arc::new(udp_socket(bind, &opts, None, None)?);
    let local_addr = socket.local_addr()?;
    info!("KCP server listening on {}", local_addr);

    tokio::spawn(async move {
        let mut sessions: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = tokio::select! {
                _ = token.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("kcp listener read failed: {}", e);
                        continue;
                    }
                }
            };
            let packet = buf[..n].to_vec();
            if let Some(session_tx) = sessions.get(&peer) {
                match session_tx.try_send(packet) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => continue,
                    Err(mpsc::error::TrySendError::Closed(p)) => {
                        sessions.remove(&peer);
                        if let Some(session_tx) = accept_session(&socket, peer, &opts, &crypt, &tx, &token) {
                            let _ = session_tx.try_send(p);
                            sessions.insert(peer, session_tx);
                        }
                    }
                }
            } else if let Some(session_tx) = accept_session(&socket, peer, &opts, &crypt, &tx, &token) {
                let _ = session_tx.try_send(packet);
                sessions.insert(peer, session_tx);
            }
        }
    });
    Ok(local_addr)
}

fn accept_session(
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    opts: &KcpOptions,
    crypt: &BlockCrypt,
    accepted: &mpsc::Sender<Accepted>,
    parent: &CancellationToken,
) -> Option<mpsc::Sender<Vec<u8>>> {
    let codec = match opts.codec(crypt) {
        Ok(codec) => codec,
        Err(e) => {
            warn!("kcp codec: {}", e);
            return None;
        }
    };
    let (session_tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let token = parent.child_token();
    let link = SessionLink {
        socket: socket.clone(),
        peer,
        inbound: rx,
    };
    let pipe = spawn_session(None, opts.params(), codec, link, token.clone());
    let session = Session::server(opts.wrap(pipe), opts.smux_config());
    let accepted = accepted.clone();
    tokio::spawn(async move {
        debug!(peer = %peer, "kcp session accepted");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                r = session.accept_stream() => match r {
                    Ok(stream) => {
                        if accepted.send((Box::new(stream) as BoxStream, peer)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        session.close();
        token.cancel();
    });
    Some(session_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_mode_presets() {
        let mut opts = KcpOptions::default();
        assert_eq!(opts.tuning(), (0, 40, 2, 1));
        opts.mode = "fast3".into();
        assert_eq!(opts.tuning(), (1, 10, 2, 1));
        opts.mode = "manual".into();
        opts.nodelay = 1;
        opts.interval = 15;
        assert_eq!(opts.tuning(), (1, 15, 2, 1));
        assert!(opts.params().nodelay);
    }

    #[test]
    fn test_invalid_crypt_rejected() {
        let opts = KcpOptions {
            crypt: "tea".into(),
            ..Default::default()
        };
        assert!(KcpDialer::new(opts, None).is_err());
    }

    #[tokio::test]
    async fn test_dial_and_listen() {
        let opts = KcpOptions {
            crypt: "aes-128".into(),
            key: "kcp-key".into(),
            mode: "fast3".into(),
            no_compress: false,
            smuxver: 2,
            sndwnd: 256,
            rcvwnd: 256,
            sockbuf: 0,
            dscp: 0,
            conns: 2,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let addr = listen("127.0.0.1:0", opts.clone(), tx, token.clone()).await.unwrap();

        tokio::spawn(async move {
            while let Some((mut stream, _)) = rx.recv().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                                let _ = stream.flush().await;
                            }
                        }
                    }
                });
            }
        });

        let dialer = KcpDialer::new(opts, None).unwrap();
        for round in 0..3u8 {
            let mut stream = dialer.dial(&addr.to_string()).await.unwrap();
            let msg = [round; 100];
            stream.write_all(&msg).await.unwrap();
            stream.flush().await.unwrap();
            let mut back = [0u8; 100];
            stream.read_exact(&mut back).await.unwrap();
            assert_eq!(back, msg);
        }
        dialer.close().await;
        token.cancel();
    }
}
