//! 流多路复用
//!
//! 与 xtaci/smux 线路兼容。帧头 8 字节：`ver(1) cmd(1) len(u16 LE) sid(u32 LE)`。
//! 客户端流 ID 为奇数，服务端为偶数。v2 增加按流的窗口更新（UPD）。
//!
//! 会话内部有两个后台任务：读任务把收到的帧分发到各条流，写任务按序发出帧。
//! 数据帧、SYN 和 FIN 走同一个有界队列以保持顺序，NOP 与 UPD 走独立的控制队列。

use bytes::{Buf, Bytes};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use super::pool::PoolSession;

const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;
const CMD_UPD: u8 = 4;

pub const HEADER_SIZE: usize = 8;
const UPD_SIZE: usize = 8;
const INITIAL_PEER_WINDOW: u32 = 262_144;
const DATA_QUEUE: usize = 64;
const ACCEPT_BACKLOG: usize = 1024;

/// 会话配置
#[derive(Debug, Clone)]
pub struct SmuxConfig {
    /// 协议版本，1 或 2
    pub version: u8,
    pub keepalive_interval: Duration,
    /// 超过该时间没有收到任何帧则关闭会话
    pub keepalive_timeout: Duration,
    pub max_frame_size: usize,
    /// v2 中通告给对端的单流窗口
    pub max_stream_buffer: u32,
}

impl Default for SmuxConfig {
    fn default() -> Self {
        Self {
            version: 1,
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            max_frame_size: 32768,
            max_stream_buffer: 65536,
        }
    }
}

#[derive(Debug)]
struct Frame {
    ver: u8,
    cmd: u8,
    sid: u32,
    data: Bytes,
}

impl Frame {
    fn new(ver: u8, cmd: u8, sid: u32, data: Bytes) -> Self {
        Self { ver, cmd, sid, data }
    }

    fn header(&self) -> [u8; HEADER_SIZE] {
        let mut hdr = [0u8; HEADER_SIZE];
        hdr[0] = self.ver;
        hdr[1] = self.cmd;
        hdr[2..4].copy_from_slice(&(self.data.len() as u16).to_le_bytes());
        hdr[4..8].copy_from_slice(&self.sid.to_le_bytes());
        hdr
    }
}

/// 流的共享状态，由读任务和流本身共同访问
#[derive(Default)]
struct StreamShared {
    peer_consumed: AtomicU32,
    peer_window: AtomicU32,
    written: AtomicU32,
    remote_fin: AtomicBool,
    write_waker: AtomicWaker,
}

impl StreamShared {
    fn new() -> Self {
        let shared = Self::default();
        shared.peer_window.store(INITIAL_PEER_WINDOW, Ordering::Relaxed);
        shared
    }

    fn finish(&self) {
        self.remote_fin.store(true, Ordering::Release);
        self.write_waker.wake();
    }
}

struct StreamEntry {
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<StreamShared>,
}

struct SessionInner {
    config: SmuxConfig,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    next_id: AtomicU32,
    data_tx: mpsc::Sender<Frame>,
    ctrl_tx: mpsc::UnboundedSender<Frame>,
    accept_tx: mpsc::Sender<SmuxStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<SmuxStream>>,
    alive: AtomicBool,
    token: CancellationToken,
}

/// 一个多路复用会话，克隆后共享同一个会话
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// 以客户端身份在 `conn` 上建立会话
    pub fn client<T>(conn: T, config: SmuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, 1)
    }

    /// 以服务端身份在 `conn` 上建立会话
    pub fn server<T>(conn: T, config: SmuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, config, 0)
    }

    fn new<T>(conn: T, config: SmuxConfig, first_id: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let inner = Arc::new(SessionInner {
            config,
            streams: Mutex::new(HashMap::new()),
            // 服务端从 0 开始，第一次分配得到 2
            next_id: AtomicU32::new(if first_id == 1 { 1 } else { 2 }),
            data_tx,
            ctrl_tx,
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            alive: AtomicBool::new(false),
            token: CancellationToken::new(),
        });

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(recv_loop(reader, inner.clone()));
        tokio::spawn(send_loop(writer, data_rx, ctrl_rx, inner.token.clone()));
        tokio::spawn(keepalive(inner.clone()));
        Self { inner }
    }

    /// 打开一条新的流
    pub async fn open_stream(&self) -> io::Result<SmuxStream> {
        if self.is_closed() {
            return Err(broken_pipe());
        }
        let sid = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.inner.register(sid);
        let syn = Frame::new(self.inner.config.version, CMD_SYN, sid, Bytes::new());
        self.inner.data_tx.send(syn).await.map_err(|_| broken_pipe())?;
        trace!(sid, "smux stream opened");
        Ok(stream)
    }

    /// 接受对端打开的流
    pub async fn accept_stream(&self) -> io::Result<SmuxStream> {
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or_else(broken_pipe),
            _ = self.inner.token.cancelled() => Err(broken_pipe()),
        }
    }

    pub fn num_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn close(&self) {
        self.inner.token.cancel();
    }
}

impl PoolSession for Session {
    fn is_closed(&self) -> bool {
        Session::is_closed(self)
    }

    fn close(&self) {
        Session::close(self)
    }
}

impl SessionInner {
    fn register(self: &Arc<Self>, sid: u32) -> SmuxStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new());
        self.streams.lock().insert(
            sid,
            StreamEntry {
                tx,
                shared: shared.clone(),
            },
        );
        SmuxStream {
            sid,
            session: self.clone(),
            rx,
            read_buf: Bytes::new(),
            tx: PollSender::new(self.data_tx.clone()),
            shared,
            num_read: 0,
            incr: 0,
            fin_sent: false,
        }
    }

    /// 会话结束：所有流读到 EOF，阻塞在窗口上的写者被唤醒
    fn shutdown(&self) {
        self.token.cancel();
        let streams: Vec<StreamEntry> = self.streams.lock().drain().map(|(_, e)| e).collect();
        for entry in streams {
            entry.shared.finish();
        }
        // 未被接受的流持有会话的引用
        if let Ok(mut rx) = self.accept_rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "smux session closed")
}

async fn recv_loop<R>(mut reader: R, inner: Arc<SessionInner>)
where
    R: AsyncRead + Unpin,
{
    let result = tokio::select! {
        r = dispatch(&mut reader, &inner) => r,
        _ = inner.token.cancelled() => Ok(()),
    };
    if let Err(e) = result {
        debug!("smux session terminated: {}", e);
    }
    inner.shutdown();
}

async fn dispatch<R>(reader: &mut R, inner: &Arc<SessionInner>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_SIZE];
    loop {
        reader.read_exact(&mut hdr).await?;
        inner.alive.store(true, Ordering::Relaxed);
        let (ver, cmd) = (hdr[0], hdr[1]);
        let len = u16::from_le_bytes([hdr[2], hdr[3]]) as usize;
        let sid = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        if ver != inner.config.version {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("smux version mismatch: got {}, want {}", ver, inner.config.version),
            ));
        }
        match cmd {
            CMD_NOP => {}
            CMD_SYN => {
                let exists = inner.streams.lock().contains_key(&sid);
                if !exists {
                    let stream = inner.register(sid);
                    if inner.accept_tx.try_send(stream).is_err() {
                        debug!(sid, "smux accept backlog full, stream dropped");
                    }
                }
            }
            CMD_FIN => {
                if let Some(entry) = inner.streams.lock().remove(&sid) {
                    entry.shared.finish();
                }
            }
            CMD_PSH => {
                let mut data = vec![0u8; len];
                reader.read_exact(&mut data).await?;
                if let Some(entry) = inner.streams.lock().get(&sid) {
                    let _ = entry.tx.send(Bytes::from(data));
                }
            }
            CMD_UPD => {
                let mut upd = [0u8; UPD_SIZE];
                reader.read_exact(&mut upd).await?;
                if let Some(entry) = inner.streams.lock().get(&sid) {
                    let consumed = u32::from_le_bytes([upd[0], upd[1], upd[2], upd[3]]);
                    let window = u32::from_le_bytes([upd[4], upd[5], upd[6], upd[7]]);
                    entry.shared.peer_consumed.store(consumed, Ordering::Release);
                    entry.shared.peer_window.store(window, Ordering::Release);
                    entry.shared.write_waker.wake();
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid smux command {}", other),
                ))
            }
        }
    }
}

async fn send_loop<W>(
    mut writer: W,
    mut data_rx: mpsc::Receiver<Frame>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(frame) = ctrl_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            else => break,
        };
        let result = async {
            writer.write_all(&frame.header()).await?;
            writer.write_all(&frame.data).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("smux write failed: {}", e);
            break;
        }
    }
    token.cancel();
    let _ = writer.shutdown().await;
}

async fn keepalive(inner: Arc<SessionInner>) {
    let mut ping = tokio::time::interval(inner.config.keepalive_interval);
    let mut check = tokio::time::interval(inner.config.keepalive_timeout);
    ping.tick().await;
    check.tick().await;
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = ping.tick() => {
                let nop = Frame::new(inner.config.version, CMD_NOP, 0, Bytes::new());
                let _ = inner.ctrl_tx.send(nop);
            }
            _ = check.tick() => {
                if !inner.alive.swap(false, Ordering::Relaxed) {
                    debug!("smux keepalive timeout");
                    inner.shutdown();
                    return;
                }
            }
        }
    }
}

/// 会话上的一条流
pub struct SmuxStream {
    sid: u32,
    session: Arc<SessionInner>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    read_buf: Bytes,
    tx: PollSender<Frame>,
    shared: Arc<StreamShared>,
    num_read: u32,
    incr: u32,
    fin_sent: bool,
}

impl SmuxStream {
    pub fn id(&self) -> u32 {
        self.sid
    }

    fn version(&self) -> u8 {
        self.session.config.version
    }

    /// v2：消费了半个窗口（或第一次读取）后通告对端
    fn account_read(&mut self, n: usize) {
        if self.version() < 2 || n == 0 {
            return;
        }
        self.num_read = self.num_read.wrapping_add(n as u32);
        self.incr = self.incr.wrapping_add(n as u32);
        let window = self.session.config.max_stream_buffer;
        if self.incr >= window / 2 || self.num_read == n as u32 {
            self.incr = 0;
            let mut upd = Vec::with_capacity(UPD_SIZE);
            upd.extend_from_slice(&self.num_read.to_le_bytes());
            upd.extend_from_slice(&window.to_le_bytes());
            let frame = Frame::new(self.version(), CMD_UPD, self.sid, Bytes::from(upd));
            let _ = self.session.ctrl_tx.send(frame);
        }
    }

    /// v2：对端窗口内还能发送的字节数
    fn send_window(&self) -> usize {
        if self.version() < 2 {
            return usize::MAX;
        }
        let written = self.shared.written.load(Ordering::Acquire);
        let consumed = self.shared.peer_consumed.load(Ordering::Acquire);
        let window = self.shared.peer_window.load(Ordering::Acquire) as i64;
        let inflight = written.wrapping_sub(consumed) as i32 as i64;
        (window - inflight).max(0) as usize
    }

    fn fin_frame(&self) -> Frame {
        Frame::new(self.version(), CMD_FIN, self.sid, Bytes::new())
    }
}

impl AsyncRead for SmuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.read_buf.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(data) => this.read_buf = data,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.read_buf.len().min(buf.remaining());
        buf.put_slice(&this.read_buf[..n]);
        this.read_buf.advance(n);
        this.account_read(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SmuxStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.fin_sent || this.shared.remote_fin.load(Ordering::Acquire) || this.session.token.is_cancelled() {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut window = this.send_window();
        if window == 0 {
            this.shared.write_waker.register(cx.waker());
            window = this.send_window();
            if window == 0 {
                if this.shared.remote_fin.load(Ordering::Acquire) {
                    return Poll::Ready(Err(broken_pipe()));
                }
                return Poll::Pending;
            }
        }

        ready!(this.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(this.session.config.max_frame_size).min(window);
        let frame = Frame::new(this.version(), CMD_PSH, this.sid, Bytes::copy_from_slice(&buf[..n]));
        this.tx.send_item(frame).map_err(|_| broken_pipe())?;
        this.shared.written.fetch_add(n as u32, Ordering::AcqRel);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.tx.poll_reserve(cx)).is_ok() {
            let fin = this.fin_frame();
            let _ = this.tx.send_item(fin);
        }
        this.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for SmuxStream {
    fn drop(&mut self) {
        self.session.streams.lock().remove(&self.sid);
        if self.fin_sent || self.session.token.is_cancelled() {
            return;
        }
        let fin = self.fin_frame();
        let tx = self.session.data_tx.clone();
        if let Err(mpsc::error::TrySendError::Full(fin)) = tx.try_send(fin) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = tx.send(fin).await;
                });
            }
        }
    }
}
