//! TCP 中继
//!
//! 两个方向各由一个任务拷贝，任一方向结束（EOF、错误或 panic）后两端一起关闭，
//! 不传播半关闭。

use super::ProxyCipher;
use crate::protocol::{Address, BoxStream};
use crate::transport::{Dialer, TcpDialer};
use crate::utils::pool::tcp_pool;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// 单方向拷贝，直到读到 EOF 或出错
async fn copy_one_way<R, W>(mut reader: R, mut writer: W, counter: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = tcp_pool().get();
    loop {
        let n = reader.read(&mut buf[..]).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn join_result(result: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    match result {
        Ok(r) => r,
        Err(e) if e.is_panic() => {
            error!("relay task panicked: {}", e);
            Err(io::Error::new(io::ErrorKind::Other, "relay task panicked"))
        }
        Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
    }
}

/// 双向拷贝 `a` 与 `b`
///
/// # 返回
/// (a → b 字节数, b → a 字节数)
pub async fn copy_bidirectional<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_reader, a_writer) = tokio::io::split(a);
    let (b_reader, b_writer) = tokio::io::split(b);
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let mut upstream: JoinHandle<io::Result<()>> = tokio::spawn(copy_one_way(a_reader, b_writer, a_to_b.clone()));
    let mut downstream: JoinHandle<io::Result<()>> = tokio::spawn(copy_one_way(b_reader, a_writer, b_to_a.clone()));

    let result = tokio::select! {
        r = &mut upstream => {
            downstream.abort();
            let _ = downstream.await;
            join_result(r)
        }
        r = &mut downstream => {
            upstream.abort();
            let _ = upstream.await;
            join_result(r)
        }
    };

    let counts = (a_to_b.load(Ordering::Relaxed), b_to_a.load(Ordering::Relaxed));
    match result {
        Ok(()) => Ok(counts),
        Err(e) if is_benign(&e) => Ok(counts),
        Err(e) => Err(e),
    }
}

fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

/// 直连中继
#[derive(Debug, Clone, Default)]
pub struct DirectTcpRelayer {
    tcp: TcpDialer,
}

impl DirectTcpRelayer {
    pub fn new(tcp: TcpDialer) -> Self {
        Self { tcp }
    }

    /// 直接连接 `remote` 并双向拷贝
    pub async fn relay<S>(&self, conn: S, remote: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let target = self.tcp.connect(remote).await?;
        info!(remote, "tcp-direct");
        let (up, down) = copy_bidirectional(conn, target).await?;
        debug!(remote, up, down, "tcp-direct finished");
        Ok(())
    }
}

/// 经由代理服务器的中继
#[derive(Clone)]
pub struct ProxyTcpRelayer {
    name: String,
    server_addr: String,
    dialer: Arc<Dialer>,
    cipher: ProxyCipher,
}

impl ProxyTcpRelayer {
    /// 创建中继器
    ///
    /// # 参数
    /// * `name` - 代理名称，只用于日志
    /// * `server_addr` - 代理服务器 `host:port`
    /// * `dialer` - 到代理服务器的传输层拨号器
    /// * `cipher` - 出站加密层
    pub fn new(name: impl Into<String>, server_addr: impl Into<String>, dialer: Arc<Dialer>, cipher: ProxyCipher) -> Self {
        Self {
            name: name.into(),
            server_addr: server_addr.into(),
            dialer,
            cipher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.dialer
    }

    /// 建立到代理服务器的加密连接，并写入目标地址头
    pub async fn connect(&self, remote: &str) -> io::Result<BoxStream> {
        let addr: Address = remote.parse()?;
        let stream = self.dialer.dial(&self.server_addr).await?;
        let mut stream = self.cipher.wrap(stream)?;
        stream.write_all(&addr.to_bytes()).await?;
        stream.flush().await?;
        Ok(stream)
    }

    /// 本地到代理服务器的中继
    pub async fn relay_local_to_server<S>(&self, conn: S, remote: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let upstream = self.connect(remote).await?;
        self.relay_connected(conn, upstream, remote).await
    }

    /// 在已建立的上游连接上完成拷贝
    pub async fn relay_connected<S>(&self, conn: S, upstream: BoxStream, remote: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        info!(
            proxy = %self.name,
            transport = %self.dialer.kind(),
            server = %self.server_addr,
            remote,
            "tcp-relay"
        );
        let (up, down) = copy_bidirectional(conn, upstream).await?;
        debug!(proxy = %self.name, remote, up, down, "tcp-relay finished");
        Ok(())
    }
}

/// 服务端：解开加密层，读取目标地址，连接目标并拷贝
///
/// `conn` 需已套上入站加密层。
pub async fn relay_server_to_remote(mut conn: BoxStream, tcp: &TcpDialer) -> io::Result<()> {
    let addr = Address::read_from(&mut conn).await?;
    let remote = addr.to_string();
    let target = tcp.connect(&remote).await?;
    info!(remote = %remote, "tcp-relay server");
    let (up, down) = copy_bidirectional(conn, target).await?;
    debug!(remote = %remote, up, down, "tcp-relay server finished");
    Ok(())
}
