//! KCP 会话驱动
//!
//! 每个会话由一个任务独占 `kcp::Kcp` 状态机：从 UDP 收到的包经解密、纠错后输入 KCP，
//! KCP 输出的段经纠错编码、加密后发出；应用数据通过一对内存管道与上层交换。

use super::crypt::{BlockCrypt, CRYPT_HEADER_SIZE};
use super::fec::{FecDecoder, FecEncoder, FEC_HEADER_SIZE_PLUS2};
use kcp::Kcp;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// 应用侧管道容量
const PIPE_CAPACITY: usize = 256 * 1024;
const APP_READ_SIZE: usize = 32 * 1024;
/// 两次 update 之间的最长间隔
const MAX_UPDATE_WAIT: Duration = Duration::from_millis(100);

/// KCP 状态机参数
#[derive(Debug, Clone, Copy)]
pub struct KcpParams {
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub nc: bool,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    /// 线路 MTU，KCP 实际 MTU 会扣除加密和纠错头部
    pub mtu: usize,
}

/// 线路上的包编解码：纠错 + 加密
pub struct PacketCodec {
    crypt: BlockCrypt,
    encoder: Option<FecEncoder>,
    decoder: Option<FecDecoder>,
}

impl PacketCodec {
    pub fn new(crypt: BlockCrypt, data_shards: usize, parity_shards: usize) -> io::Result<Self> {
        let (encoder, decoder) = if data_shards > 0 && parity_shards > 0 {
            (
                Some(FecEncoder::new(data_shards, parity_shards)?),
                Some(FecDecoder::new(data_shards, parity_shards)?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            crypt,
            encoder,
            decoder,
        })
    }

    /// 每个包的头部开销
    pub fn overhead(&self) -> usize {
        CRYPT_HEADER_SIZE + if self.encoder.is_some() { FEC_HEADER_SIZE_PLUS2 } else { 0 }
    }

    /// 把一个 KCP 段编码为待发送的包（可能附带校验包）
    pub fn encode(&mut self, segment: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let mut packet = vec![0u8; self.overhead()];
        packet.extend_from_slice(segment);
        let parity = match self.encoder.as_mut() {
            Some(encoder) => encoder.encode(&mut packet[CRYPT_HEADER_SIZE..]),
            None => Vec::new(),
        };
        self.crypt.seal(&mut packet)?;
        let mut out = Vec::with_capacity(1 + parity.len());
        out.push(packet);
        for shard in parity {
            let mut p = vec![0u8; CRYPT_HEADER_SIZE];
            p.extend_from_slice(&shard);
            self.crypt.seal(&mut p)?;
            out.push(p);
        }
        Ok(out)
    }

    /// 解出一个包中可以交给 KCP 的段
    pub fn decode(&mut self, packet: &mut [u8]) -> Vec<Vec<u8>> {
        let payload = match self.crypt.open(packet) {
            Ok(Some(payload)) => payload,
            _ => return Vec::new(),
        };
        match self.decoder.as_mut() {
            Some(decoder) => {
                let (direct, recovered) = decoder.decode(payload);
                direct.into_iter().chain(recovered).collect()
            }
            None => vec![payload.to_vec()],
        }
    }
}

/// KCP 输出回调，段先排队，由驱动任务统一发出
#[derive(Clone, Default)]
struct KcpOutput(Arc<Mutex<Vec<Vec<u8>>>>);

impl KcpOutput {
    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn kcp_error(e: kcp::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("kcp: {:?}", e))
}

/// 会话的网络端点
pub struct SessionLink {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    /// 属于该会话的原始 UDP 包
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// 启动会话驱动任务
///
/// # 参数
/// * `conv` - 会话号；服务端为 `None`，从第一个包中读取
/// * `token` - 驱动任务退出时取消，也可以由外部取消以关闭会话
///
/// # 返回
/// 应用侧的字节流
pub fn spawn_session(
    conv: Option<u32>,
    params: KcpParams,
    codec: PacketCodec,
    link: SessionLink,
    token: CancellationToken,
) -> DuplexStream {
    let (app, driver) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        let peer = link.peer;
        if let Err(e) = drive(conv, params, codec, link, driver, token.clone()).await {
            debug!(peer = %peer, "kcp session error: {}", e);
        }
        token.cancel();
        trace!(peer = %peer, "kcp session closed");
    });
    app
}

async fn drive(
    conv: Option<u32>,
    params: KcpParams,
    mut codec: PacketCodec,
    link: SessionLink,
    pipe: DuplexStream,
    token: CancellationToken,
) -> io::Result<()> {
    let SessionLink {
        socket,
        peer,
        mut inbound,
    } = link;

    let mut early = Vec::new();
    let conv = match conv {
        Some(conv) => conv,
        None => loop {
            let Some(mut packet) = inbound.recv().await else {
                return Ok(());
            };
            let segments = codec.decode(&mut packet);
            if let Some(first) = segments.first().filter(|s| s.len() >= 4) {
                let conv = u32::from_le_bytes([first[0], first[1], first[2], first[3]]);
                early = segments;
                break conv;
            }
        },
    };

    let output = KcpOutput::default();
    let mut kcp = Kcp::new_stream(conv, output.clone());
    kcp.set_nodelay(params.nodelay, params.interval, params.resend, params.nc);
    kcp.set_wndsize(params.snd_wnd, params.rcv_wnd);
    kcp.set_mtu(params.mtu.saturating_sub(codec.overhead())).map_err(kcp_error)?;
    for segment in early {
        let _ = kcp.input(&segment);
    }

    let start = Instant::now();
    let now_ms = move || start.elapsed().as_millis() as u32;
    let (mut app_rd, mut app_wr) = tokio::io::split(pipe);
    let mut read_buf = vec![0u8; APP_READ_SIZE];
    let mut to_app: Vec<u8> = Vec::new();
    let mut to_app_pos = 0usize;
    let mut app_eof = false;

    loop {
        if to_app_pos >= to_app.len() {
            to_app.clear();
            to_app_pos = 0;
            if let Ok(size) = kcp.peeksize() {
                to_app.resize(size, 0);
                match kcp.recv(&mut to_app) {
                    Ok(n) => to_app.truncate(n),
                    Err(_) => to_app.clear(),
                }
            }
        }

        for segment in output.take() {
            for packet in codec.encode(&segment)? {
                if let Err(e) = socket.send_to(&packet, peer).await {
                    trace!(peer = %peer, "kcp send failed: {}", e);
                }
            }
        }

        if app_eof && kcp.wait_snd() == 0 {
            return Ok(());
        }

        let now = now_ms();
        let wait = Duration::from_millis(kcp.check(now).wrapping_sub(now) as u64).min(MAX_UPDATE_WAIT);
        let can_send = !app_eof && kcp.wait_snd() < 2 * params.snd_wnd as usize;
        let has_data = to_app_pos < to_app.len();

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            packet = inbound.recv() => match packet {
                Some(mut packet) => {
                    for segment in codec.decode(&mut packet) {
                        if let Err(e) = kcp.input(&segment) {
                            trace!(peer = %peer, "kcp input rejected: {:?}", e);
                        }
                    }
                    kcp.update(now_ms()).map_err(kcp_error)?;
                }
                None => return Ok(()),
            },
            r = app_rd.read(&mut read_buf), if can_send => match r {
                Ok(0) | Err(_) => app_eof = true,
                Ok(n) => {
                    kcp.send(&read_buf[..n]).map_err(kcp_error)?;
                    kcp.flush().map_err(kcp_error)?;
                }
            },
            r = app_wr.write(&to_app[to_app_pos..]), if has_data => match r {
                Ok(0) | Err(_) => return Ok(()),
                Ok(n) => to_app_pos += n,
            },
            _ = tokio::time::sleep(wait) => {
                kcp.update(now_ms()).map_err(kcp_error)?;
            }
        }
    }
}
