//! snappy 分帧压缩连接
//!
//! 每次写入都用新的帧编码器输出一段完整的 snappy 帧流（流标识 + 数据块），
//! 重复的流标识在帧格式中是合法的。读取端按块解析并逐块解码。

use super::PendingWrite;
use snap::read::FrameDecoder;
use snap::write::FrameEncoder;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const STREAM_IDENTIFIER: [u8; 10] = [0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];
const CHUNK_HEADER_SIZE: usize = 4;
const MAX_WRITE_SIZE: usize = 64 * 1024;

pub struct CompressConn<S> {
    inner: S,
    raw: Vec<u8>,
    decoded: Vec<u8>,
    dpos: usize,
    eof: bool,
    pending: PendingWrite,
}

impl<S> CompressConn<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            raw: Vec::with_capacity(16 * 1024),
            decoded: Vec::new(),
            dpos: 0,
            eof: false,
            pending: PendingWrite::default(),
        }
    }

    /// 尝试从已收到的原始字节中解出一个完整的块
    fn decode_chunk(&mut self) -> io::Result<bool> {
        if self.raw.len() < CHUNK_HEADER_SIZE {
            return Ok(false);
        }
        let kind = self.raw[0];
        let len = u32::from_le_bytes([self.raw[1], self.raw[2], self.raw[3], 0]) as usize;
        let total = CHUNK_HEADER_SIZE + len;
        if self.raw.len() < total {
            return Ok(false);
        }
        let chunk: Vec<u8> = self.raw.drain(..total).collect();
        self.decoded.clear();
        self.dpos = 0;
        match kind {
            // 数据块：拼上流标识交给帧解码器，由它校验 CRC
            0x00 | 0x01 => {
                let mut framed = Vec::with_capacity(STREAM_IDENTIFIER.len() + chunk.len());
                framed.extend_from_slice(&STREAM_IDENTIFIER);
                framed.extend_from_slice(&chunk);
                FrameDecoder::new(&framed[..]).read_to_end(&mut self.decoded)?;
            }
            0xff | 0x80..=0xfe => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("snappy: reserved unskippable chunk {:#04x}", other),
                ))
            }
        }
        Ok(true)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CompressConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.dpos < this.decoded.len() {
                let n = buf.remaining().min(this.decoded.len() - this.dpos);
                buf.put_slice(&this.decoded[this.dpos..this.dpos + n]);
                this.dpos += n;
                return Poll::Ready(Ok(()));
            }
            if this.decode_chunk()? {
                continue;
            }
            if this.eof {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }

            let mut tmp = [0u8; 8192];
            let mut rb = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
            if rb.filled().is_empty() {
                this.eof = true;
            } else {
                this.raw.extend_from_slice(rb.filled());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CompressConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let n = buf.len().min(MAX_WRITE_SIZE);
            let mut encoder = FrameEncoder::new(Vec::with_capacity(n + 64));
            encoder.write_all(&buf[..n])?;
            let compressed = encoder
                .into_inner()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            this.pending.fill(n).extend_from_slice(&compressed);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_compress_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = CompressConn::new(a);
        let mut b = CompressConn::new(b);
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(500);
        let expect = data.clone();
        let writer = tokio::spawn(async move {
            for chunk in data.chunks(3000) {
                a.write_all(chunk).await.unwrap();
            }
            a.shutdown().await.unwrap();
        });
        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn test_output_is_snappy_framed() {
        let (a, mut wire) = tokio::io::duplex(4096);
        let mut a = CompressConn::new(a);
        a.write_all(b"hello").await.unwrap();
        drop(a);
        let mut raw = Vec::new();
        wire.read_to_end(&mut raw).await.unwrap();
        assert_eq!(&raw[..10], &STREAM_IDENTIFIER);

        let mut plain = Vec::new();
        FrameDecoder::new(&raw[..]).read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"hello");
    }
}
