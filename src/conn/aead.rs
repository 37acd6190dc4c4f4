//! AEAD 分帧连接
//!
//! 线上格式：`[salt][seal(len)][seal(payload)]...`
//! 长度字段为大端 u16，高两位保留为 0；每次 seal/open 后随机数按小端递增。

use super::{poll_read_exact, PendingWrite};
use crate::crypto::aead::TAG_SIZE;
use crate::crypto::{increment_nonce, random_bytes, AeadCipher, CipherSuite};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 单帧最大明文长度
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

enum ReadState {
    Salt,
    Length,
    Payload(usize),
    Data,
}

struct Sealer {
    cipher: AeadCipher,
    nonce: Vec<u8>,
}

impl Sealer {
    fn new(cipher: AeadCipher) -> Self {
        let nonce = vec![0u8; cipher.nonce_size()];
        Self { cipher, nonce }
    }

    fn seal(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.cipher.seal_in_place(&self.nonce, buf)?;
        increment_nonce(&mut self.nonce);
        Ok(())
    }

    fn open(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.cipher.open_in_place(&self.nonce, buf)?;
        increment_nonce(&mut self.nonce);
        Ok(n)
    }
}

pub struct AeadConn<S> {
    inner: S,
    suite: CipherSuite,
    writer: Option<Sealer>,
    reader: Option<Sealer>,
    state: ReadState,
    rbuf: Vec<u8>,
    rfilled: usize,
    rpos: usize,
    pending: PendingWrite,
}

impl<S> AeadConn<S> {
    pub fn new(inner: S, suite: CipherSuite) -> Self {
        let salt_size = suite.method().salt_size();
        Self {
            inner,
            suite,
            writer: None,
            reader: None,
            state: ReadState::Salt,
            rbuf: vec![0u8; salt_size],
            rfilled: 0,
            rpos: 0,
            pending: PendingWrite::default(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn encode_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        let n = payload.len();
        let out = self.pending.fill(n);
        if self.writer.is_none() {
            let salt = random_bytes(self.suite.method().salt_size());
            let cipher = self.suite.aead_for_salt(&salt)?;
            out.extend_from_slice(&salt);
            self.writer = Some(Sealer::new(cipher));
        }
        let Some(sealer) = self.writer.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "aead writer not ready"));
        };

        let len_start = out.len();
        out.extend_from_slice(&(n as u16).to_be_bytes());
        out.resize(len_start + 2 + TAG_SIZE, 0);
        sealer.seal(&mut out[len_start..])?;

        let payload_start = out.len();
        out.extend_from_slice(payload);
        out.resize(payload_start + n + TAG_SIZE, 0);
        sealer.seal(&mut out[payload_start..])?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                ReadState::Salt => {
                    let complete = ready!(poll_read_exact(
                        Pin::new(&mut this.inner),
                        cx,
                        &mut this.rbuf,
                        &mut this.rfilled,
                    ))?;
                    if !complete {
                        return Poll::Ready(Ok(()));
                    }
                    let cipher = this.suite.aead_for_salt(&this.rbuf)?;
                    this.reader = Some(Sealer::new(cipher));
                    this.begin(ReadState::Length, 2 + TAG_SIZE);
                }
                ReadState::Length => {
                    let complete = ready!(poll_read_exact(
                        Pin::new(&mut this.inner),
                        cx,
                        &mut this.rbuf,
                        &mut this.rfilled,
                    ))?;
                    if !complete {
                        return Poll::Ready(Ok(()));
                    }
                    let mut frame = std::mem::take(&mut this.rbuf);
                    this.reader_mut()?.open(&mut frame)?;
                    let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
                    this.rbuf = frame;
                    if len > MAX_PAYLOAD_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("aead frame length {} exceeds {}", len, MAX_PAYLOAD_SIZE),
                        )));
                    }
                    this.begin(ReadState::Payload(len), len + TAG_SIZE);
                }
                ReadState::Payload(len) => {
                    let complete = ready!(poll_read_exact(
                        Pin::new(&mut this.inner),
                        cx,
                        &mut this.rbuf,
                        &mut this.rfilled,
                    ))?;
                    if !complete {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let mut frame = std::mem::take(&mut this.rbuf);
                    this.reader_mut()?.open(&mut frame)?;
                    frame.truncate(len);
                    this.rbuf = frame;
                    this.rpos = 0;
                    this.state = ReadState::Data;
                }
                ReadState::Data => {
                    if this.rpos < this.rbuf.len() {
                        let n = buf.remaining().min(this.rbuf.len() - this.rpos);
                        buf.put_slice(&this.rbuf[this.rpos..this.rpos + n]);
                        this.rpos += n;
                        return Poll::Ready(Ok(()));
                    }
                    this.begin(ReadState::Length, 2 + TAG_SIZE);
                }
            }
        }
    }
}

impl<S> AeadConn<S> {
    fn begin(&mut self, state: ReadState, need: usize) {
        self.state = state;
        self.rbuf.clear();
        self.rbuf.resize(need, 0);
        self.rfilled = 0;
    }

    fn reader_mut(&mut self) -> io::Result<&mut Sealer> {
        self.reader
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "aead reader not ready"))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadConn<S> {
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
            let n = buf.len().min(MAX_PAYLOAD_SIZE);
            this.encode_frame(&buf[..n])?;
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

    fn suite() -> CipherSuite {
        CipherSuite::new("chacha20-ietf-poly1305", "secret").unwrap()
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let suite = suite();
        let (a, mut wire) = tokio::io::duplex(64 * 1024);
        let mut conn = AeadConn::new(a, suite.clone());
        conn.write_all(b"abc").await.unwrap();
        conn.flush().await.unwrap();
        drop(conn);

        let mut raw = Vec::new();
        wire.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw.len(), 32 + 2 + TAG_SIZE + 3 + TAG_SIZE);

        let cipher = suite.aead_for_salt(&raw[..32]).unwrap();
        let mut nonce = vec![0u8; 12];
        let len = cipher.open(&nonce, &raw[32..32 + 18]).unwrap();
        assert_eq!(len, vec![0, 3]);
        increment_nonce(&mut nonce);
        assert_eq!(cipher.open(&nonce, &raw[50..]).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_round_trip_large() {
        let (a, b) = tokio::io::duplex(4096);
        let mut a = AeadConn::new(a, suite());
        let mut b = AeadConn::new(b, suite());
        let data: Vec<u8> = (0..70_000u32).map(|i| i as u8).collect();
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
    async fn test_max_payload_boundary() {
        let suite = suite();
        let (a, b) = tokio::io::duplex(128 * 1024);
        let mut writer = AeadConn::new(a, suite.clone());
        let mut reader = AeadConn::new(b, suite.clone());

        // 16383 字节恰好一帧
        let payload = vec![0x5au8; MAX_PAYLOAD_SIZE];
        let n = writer.write(&payload).await.unwrap();
        assert_eq!(n, MAX_PAYLOAD_SIZE);
        let mut got = vec![0u8; MAX_PAYLOAD_SIZE];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);

        // 手工构造长度为 16384 的帧，读取端必须拒绝
        let (c, mut raw_side) = tokio::io::duplex(128 * 1024);
        let salt = random_bytes(32);
        let cipher = suite.aead_for_salt(&salt).unwrap();
        let nonce = vec![0u8; 12];
        let mut frame = salt.clone();
        frame.extend(cipher.seal(&nonce, &((MAX_PAYLOAD_SIZE + 1) as u16).to_be_bytes()).unwrap());
        raw_side.write_all(&frame).await.unwrap();
        let mut reader = AeadConn::new(c, suite);
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_tampered_stream_fails() {
        let suite = suite();
        let (a, mut wire) = tokio::io::duplex(64 * 1024);
        let mut conn = AeadConn::new(a, suite.clone());
        conn.write_all(b"payload").await.unwrap();
        drop(conn);
        let mut raw = Vec::new();
        wire.read_to_end(&mut raw).await.unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;

        let (b, mut feeder) = tokio::io::duplex(64 * 1024);
        feeder.write_all(&raw).await.unwrap();
        drop(feeder);
        let mut reader = AeadConn::new(b, suite);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}
