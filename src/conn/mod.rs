//! 加密分帧连接
//!
//! 在任意字节流上叠加一层变换：
//! - `StreamConn`：流加密，首部为 IV
//! - `AeadConn`：AEAD 分帧，首部为盐
//! - `CompressConn`：snappy 分帧压缩（KCP 会话使用）

pub mod aead;
pub mod compress;
pub mod stream;

pub use aead::{AeadConn, MAX_PAYLOAD_SIZE};
pub use compress::CompressConn;
pub use stream::StreamConn;

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 单次写入处理的最大明文长度
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// 尚未完全写出的已变换数据
///
/// `poll_write` 在整个缓冲写出之后才报告消费了调用方的 `consumed` 字节，
/// 调用方在 `Pending` 后以相同数据重试即可。
#[derive(Debug, Default)]
pub(crate) struct PendingWrite {
    buf: Vec<u8>,
    pos: usize,
    consumed: usize,
}

impl PendingWrite {
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 以变换后的数据填充缓冲，`consumed` 为对应的明文长度
    pub(crate) fn fill(&mut self, consumed: usize) -> &mut Vec<u8> {
        self.buf.clear();
        self.pos = 0;
        self.consumed = consumed;
        &mut self.buf
    }

    /// 把缓冲写完；返回对应的明文长度
    pub(crate) fn poll_drain<W>(&mut self, mut inner: Pin<&mut W>, cx: &mut Context<'_>) -> Poll<io::Result<usize>>
    where
        W: AsyncWrite + ?Sized,
    {
        while self.pos < self.buf.len() {
            let n = ready!(inner.as_mut().poll_write(cx, &self.buf[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.buf.clear();
        self.pos = 0;
        Poll::Ready(Ok(std::mem::take(&mut self.consumed)))
    }
}

/// 从 `inner` 读取，直到 `buf[..need]` 填满
///
/// # 返回
/// `Ok(true)` 表示已填满；`Ok(false)` 表示在未读到任何字节时遇到 EOF。
pub(crate) fn poll_read_exact<R>(
    mut inner: Pin<&mut R>,
    cx: &mut Context<'_>,
    buf: &mut [u8],
    filled: &mut usize,
) -> Poll<io::Result<bool>>
where
    R: AsyncRead + ?Sized,
{
    while *filled < buf.len() {
        let mut rb = ReadBuf::new(&mut buf[*filled..]);
        ready!(inner.as_mut().poll_read(cx, &mut rb))?;
        let n = rb.filled().len();
        if n == 0 {
            if *filled == 0 {
                return Poll::Ready(Ok(false));
            }
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        *filled += n;
    }
    Poll::Ready(Ok(true))
}
