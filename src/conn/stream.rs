//! 流加密连接
//!
//! 发起方先写出随机 IV，之后按块异或加密；接收方先读 IV 再解密。没有分帧。

use super::{poll_read_exact, PendingWrite, MAX_CHUNK_SIZE};
use crate::crypto::{random_bytes, CipherSuite, StreamDirection, StreamTransform};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct StreamConn<S> {
    inner: S,
    suite: CipherSuite,
    encryptor: Option<StreamTransform>,
    write_iv: Option<Vec<u8>>,
    decryptor: Option<StreamTransform>,
    read_iv: Vec<u8>,
    read_iv_filled: usize,
    pending: PendingWrite,
}

impl<S> StreamConn<S> {
    pub fn new(inner: S, suite: CipherSuite) -> Self {
        let iv_size = suite.method().iv_size();
        Self {
            inner,
            suite,
            encryptor: None,
            write_iv: None,
            decryptor: None,
            read_iv: vec![0u8; iv_size],
            read_iv_filled: 0,
            pending: PendingWrite::default(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// 提前生成写方向的 IV，它会在第一次写入时作为前缀发出
    pub fn obtain_write_iv(&mut self) -> io::Result<Vec<u8>> {
        if let Some(iv) = &self.write_iv {
            return Ok(iv.clone());
        }
        let iv = random_bytes(self.suite.method().iv_size());
        let transform = self
            .suite
            .stream_for_iv(&iv, StreamDirection::Encrypt)
            .map_err(io::Error::from)?;
        self.encryptor = Some(transform);
        self.write_iv = Some(iv.clone());
        Ok(iv)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for StreamConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.decryptor.is_none() {
            let complete = ready!(poll_read_exact(
                Pin::new(&mut this.inner),
                cx,
                &mut this.read_iv,
                &mut this.read_iv_filled,
            ))?;
            if !complete {
                return Poll::Ready(Ok(()));
            }
            let transform = this
                .suite
                .stream_for_iv(&this.read_iv, StreamDirection::Decrypt)
                .map_err(io::Error::from)?;
            this.decryptor = Some(transform);
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if let Some(decryptor) = this.decryptor.as_mut() {
            decryptor.apply(&mut buf.filled_mut()[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for StreamConn<S> {
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
            let n = buf.len().min(MAX_CHUNK_SIZE);
            let first = this.encryptor.is_none() || this.write_iv.is_some();
            let iv = if first {
                Some(this.obtain_write_iv()?)
            } else {
                None
            };
            let out = this.pending.fill(n);
            if let Some(iv) = iv {
                out.extend_from_slice(&iv);
                this.write_iv = None;
            }
            let start = out.len();
            out.extend_from_slice(&buf[..n]);
            if let Some(encryptor) = this.encryptor.as_mut() {
                encryptor.apply(&mut out[start..]);
            }
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
    async fn test_iv_prefix_and_round_trip() {
        let suite = CipherSuite::new("aes-128-cfb", "12345").unwrap();
        let (client, mut wire) = tokio::io::duplex(64 * 1024);
        let mut client = StreamConn::new(client, suite.clone());

        client.write_all(b"hello shadowsocks").await.unwrap();
        client.flush().await.unwrap();

        // 线上前 16 字节是 IV，其后是等长密文
        let mut raw = vec![0u8; 16 + 17];
        wire.read_exact(&mut raw).await.unwrap();
        assert_ne!(&raw[16..], b"hello shadowsocks");

        let (server_side, mut feeder) = tokio::io::duplex(64 * 1024);
        feeder.write_all(&raw).await.unwrap();
        let mut server = StreamConn::new(server_side, suite);
        let mut out = vec![0u8; 17];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"hello shadowsocks");
    }

    #[tokio::test]
    async fn test_large_transfer_both_directions() {
        let suite = CipherSuite::new("chacha20-ietf", "pw").unwrap();
        let (a, b) = tokio::io::duplex(8 * 1024);
        let mut a = StreamConn::new(a, suite.clone());
        let mut b = StreamConn::new(b, suite);

        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7) as u8).collect();
        let expect = data.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&data).await.unwrap();
            a.shutdown().await.unwrap();
        });
        let mut got = Vec::new();
        b.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();
        assert_eq!(got, expect);
    }

    #[tokio::test]
    async fn test_eof_before_iv() {
        let suite = CipherSuite::new("aes-256-ctr", "pw").unwrap();
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut conn = StreamConn::new(b, suite);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }
}
