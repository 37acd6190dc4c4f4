//! 连接级流量跟踪
//!
//! 跟踪器包裹入站连接：从客户端读到的字节计为上行，写回客户端的计为下行。
//! 跟踪器被丢弃时从管理器中注销。

use super::{StatisticManager, TrackerContext, TrackerInfo};
use crate::protocol::PacketConn;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// TCP 连接跟踪器
pub struct TcpTracker<S> {
    inner: S,
    info: Arc<TrackerInfo>,
    manager: Arc<StatisticManager>,
}

impl<S> TcpTracker<S> {
    pub fn new(inner: S, manager: Arc<StatisticManager>, context: TrackerContext) -> Self {
        let info = manager.track(context);
        Self { inner, info, manager }
    }

    pub fn info(&self) -> &TrackerInfo {
        &self.info
    }
}

impl<S> Drop for TcpTracker<S> {
    fn drop(&mut self) {
        self.manager.remove(&self.info.id);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TcpTracker<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                this.manager.add_upload(Some(&this.info), n);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TcpTracker<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.manager.add_download(Some(&this.info), *n as u64);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// UDP 连接跟踪器
pub struct UdpTracker<P> {
    inner: P,
    info: Arc<TrackerInfo>,
    manager: Arc<StatisticManager>,
}

impl<P> UdpTracker<P> {
    pub fn new(inner: P, manager: Arc<StatisticManager>, context: TrackerContext) -> Self {
        let info = manager.track(context);
        Self { inner, info, manager }
    }
}

impl<P> Drop for UdpTracker<P> {
    fn drop(&mut self) {
        self.manager.remove(&self.info.id);
    }
}

#[async_trait]
impl<P: PacketConn> PacketConn for UdpTracker<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        self.manager.add_upload(Some(&self.info), n as u64);
        Ok((n, from))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        self.manager.add_download(Some(&self.info), n as u64);
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
