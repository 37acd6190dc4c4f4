//! gRPC 传输
//!
//! 基于 HTTP/2 的双向流方法 `StreamService.Transfer(stream Packet) returns (stream Packet)`，
//! 每条 HTTP/2 流对应一条代理连接，消息体中的 `data` 依次拼接成字节流。
//! 客户端按连接池复用 HTTP/2 连接，可选 TLS（ALPN `h2`）。

use super::pool::{ConnPool, PoolSession};
use super::tcp::{accept_keepalive, bind, TcpDialer};
use super::tls::{acceptor, connector, server_name, TlsOptions};
use super::{Accepted, TransportError};
use crate::protocol::BoxStream;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::client::{ResponseFuture, SendRequest};
use h2::{RecvStream, SendStream};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 服务方法路径
pub const TRANSFER_PATH: &str = "/proto.StreamService/Transfer";
const ALPN_H2: &[u8] = b"h2";
/// 单条 gRPC 消息的上限
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
/// 单次写入的数据上限
const MAX_WRITE_SIZE: usize = 16 * 1024;

/// `message Packet { bytes data = 1; }`
#[derive(Clone, PartialEq, Message)]
pub struct Packet {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcOptions {
    /// HTTP/2 流级发送窗口，0 使用默认值
    pub snd_buffer: u32,
    /// HTTP/2 流级接收窗口，0 使用默认值
    pub rev_buffer: u32,
    pub conns: usize,
    pub tls: TlsOptions,
}

impl Default for GrpcOptions {
    fn default() -> Self {
        Self {
            snd_buffer: 0,
            rev_buffer: 0,
            conns: 3,
            tls: TlsOptions::default(),
        }
    }
}

impl GrpcOptions {
    fn window(&self) -> Option<u32> {
        (self.rev_buffer > 0).then_some(self.rev_buffer)
    }
}

fn h2_error(e: h2::Error) -> io::Error {
    if e.is_io() {
        if let Some(e) = e.into_io() {
            return e;
        }
        return io::Error::new(io::ErrorKind::Other, "grpc: io error");
    }
    io::Error::new(io::ErrorKind::Other, format!("grpc: {}", e))
}

/// 编码一条 gRPC 消息：1 字节压缩标志 + 4 字节大端长度 + protobuf
pub fn encode_message(data: &[u8]) -> Bytes {
    let packet = Packet {
        data: Bytes::copy_from_slice(data),
    };
    let len = packet.encoded_len();
    let mut buf = BytesMut::with_capacity(5 + len);
    buf.put_u8(0);
    buf.put_u32(len as u32);
    // 容量已预留，编码不会失败
    let _ = packet.encode(&mut buf);
    buf.freeze()
}

/// 从缓冲区取出一条完整消息，数据不足时返回 `None`
pub fn decode_message(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    if buf[0] != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compressed grpc message not supported",
        ));
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("grpc message too large: {}", len),
        ));
    }
    if buf.len() < 5 + len {
        return Ok(None);
    }
    buf.advance(5);
    let body = buf.split_to(len).freeze();
    let packet = Packet::decode(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(packet.data))
}

enum RecvState {
    /// 客户端等待响应头
    Response(ResponseFuture),
    Body(RecvStream),
    Eof,
}

/// 把一条 gRPC 双向流适配为字节流
pub struct GrpcStream {
    send: SendStream<Bytes>,
    recv: RecvState,
    /// 服务端结束时需要发送 trailers
    is_server: bool,
    frames: BytesMut,
    payload: Bytes,
    shutdown: bool,
}

impl GrpcStream {
    fn client(send: SendStream<Bytes>, response: ResponseFuture) -> Self {
        Self::new(send, RecvState::Response(response), false)
    }

    fn server(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self::new(send, RecvState::Body(recv), true)
    }

    fn new(send: SendStream<Bytes>, recv: RecvState, is_server: bool) -> Self {
        Self {
            send,
            recv,
            is_server,
            frames: BytesMut::new(),
            payload: Bytes::new(),
            shutdown: false,
        }
    }
}

impl AsyncRead for GrpcStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.payload.is_empty() {
                let n = this.payload.len().min(buf.remaining());
                buf.put_slice(&this.payload.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if let Some(data) = decode_message(&mut this.frames)? {
                this.payload = data;
                continue;
            }
            match &mut this.recv {
                RecvState::Response(response) => {
                    let resp = ready!(Pin::new(response).poll(cx)).map_err(h2_error)?;
                    if resp.status() != StatusCode::OK {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::ConnectionRefused,
                            format!("grpc status {}", resp.status()),
                        )));
                    }
                    this.recv = RecvState::Body(resp.into_body());
                }
                RecvState::Body(body) => match ready!(body.poll_data(cx)) {
                    Some(Ok(chunk)) => {
                        let _ = body.flow_control().release_capacity(chunk.len());
                        this.frames.extend_from_slice(&chunk);
                    }
                    Some(Err(e)) => return Poll::Ready(Err(h2_error(e))),
                    None => this.recv = RecvState::Eof,
                },
                RecvState::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for GrpcStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let want = buf.len().min(MAX_WRITE_SIZE);
        this.send.reserve_capacity(want);
        let mut capacity = this.send.capacity();
        while capacity == 0 {
            capacity = match ready!(this.send.poll_capacity(cx)) {
                Some(Ok(n)) => n,
                Some(Err(e)) => return Poll::Ready(Err(h2_error(e))),
                None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            };
        }
        // 消息头部的几个字节超出窗口时由 h2 暂存
        let n = want.min(capacity);
        this.send
            .send_data(encode_message(&buf[..n]), false)
            .map_err(h2_error)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown {
            return Poll::Ready(Ok(()));
        }
        this.shutdown = true;
        let result = if this.is_server {
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", HeaderValue::from_static("0"));
            this.send.send_trailers(trailers)
        } else {
            this.send.send_data(Bytes::new(), true)
        };
        Poll::Ready(result.map_err(h2_error))
    }
}

/// 池中的一条 HTTP/2 连接
#[derive(Clone)]
pub struct GrpcSession {
    sender: SendRequest<Bytes>,
    closed: CancellationToken,
}

impl PoolSession for GrpcSession {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

pub struct GrpcDialer {
    opts: GrpcOptions,
    tcp: TcpDialer,
    tls: Option<TlsConnector>,
    pool: ConnPool<GrpcSession>,
}

impl GrpcDialer {
    pub fn new(opts: GrpcOptions, tcp: TcpDialer) -> Result<Self, TransportError> {
        let tls = if opts.tls.enable {
            Some(connector(&opts.tls, &[ALPN_H2])?)
        } else {
            None
        };
        let pool = ConnPool::new(opts.conns);
        Ok(Self { opts, tcp, tls, pool })
    }

    pub async fn dial(&self, addr: &str) -> io::Result<BoxStream> {
        self.pool
            .open(
                || self.dial_session(addr),
                |session| async move {
                    let stream = self.open_stream(&session, addr).await?;
                    Ok(Box::new(stream) as BoxStream)
                },
            )
            .await
    }

    async fn dial_session(&self, addr: &str) -> io::Result<GrpcSession> {
        let stream = self.tcp.connect(addr).await?;
        let io: BoxStream = match &self.tls {
            Some(tls) => {
                let name = server_name(&self.opts.tls, addr)?;
                Box::new(tls.connect(name, stream).await?)
            }
            None => Box::new(stream),
        };
        let mut builder = h2::client::Builder::new();
        if let Some(window) = self.opts.window() {
            builder.initial_window_size(window);
        }
        let (sender, conn) = builder.handshake::<_, Bytes>(io).await.map_err(h2_error)?;

        let closed = CancellationToken::new();
        let token = closed.clone();
        let peer = addr.to_string();
        tokio::spawn(async move {
            tokio::select! {
                r = conn => {
                    if let Err(e) = r {
                        debug!("grpc connection to {} closed: {}", peer, e);
                    }
                }
                _ = token.cancelled() => {}
            }
            token.cancel();
        });
        debug!("grpc session established with {}", addr);
        Ok(GrpcSession { sender, closed })
    }

    async fn open_stream(&self, session: &GrpcSession, addr: &str) -> io::Result<GrpcStream> {
        let mut sender = session.sender.clone().ready().await.map_err(h2_error)?;
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}://{}{}", scheme, addr, TRANSFER_PATH))
            .header("content-type", "application/grpc")
            .header("te", "trailers")
            .body(())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let (response, send) = sender.send_request(request, false).map_err(h2_error)?;
        Ok(GrpcStream::client(send, response))
    }

    pub async fn close(&self) {
        self.pool.close_all().await;
    }
}

pub async fn listen(
    addr: &str,
    opts: GrpcOptions,
    tx: mpsc::Sender<Accepted>,
    token: CancellationToken,
) -> Result<SocketAddr, TransportError> {
    let tls: Option<TlsAcceptor> = if opts.tls.enable {
        Some(acceptor(&opts.tls, &[ALPN_H2])?)
    } else {
        None
    };
    let listener = bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(tls = tls.is_some(), "gRPC server listening on {}", local_addr);
    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                r = accept_keepalive(&listener) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        continue;
                    }
                }
            };
            let tls = tls.clone();
            let tx = tx.clone();
            let token = token.clone();
            let window = opts.window();
            tokio::spawn(async move {
                let io: BoxStream = match tls {
                    Some(tls) => match tls.accept(stream).await {
                        Ok(s) => Box::new(s),
                        Err(e) => {
                            debug!("tls handshake with {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => Box::new(stream),
                };
                tokio::select! {
                    r = serve_connection(io, peer, window, tx) => {
                        if let Err(e) = r {
                            debug!("grpc connection from {} ended: {}", peer, e);
                        }
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
    });
    Ok(local_addr)
}

async fn serve_connection(
    io: BoxStream,
    peer: SocketAddr,
    window: Option<u32>,
    tx: mpsc::Sender<Accepted>,
) -> io::Result<()> {
    let mut builder = h2::server::Builder::new();
    if let Some(window) = window {
        builder.initial_window_size(window);
    }
    let mut conn = builder.handshake::<_, Bytes>(io).await.map_err(h2_error)?;
    while let Some(r) = conn.accept().await {
        let (request, mut respond) = r.map_err(h2_error)?;
        if request.method() != Method::POST || request.uri().path() != TRANSFER_PATH {
            debug!("grpc request {} {} from {} rejected", request.method(), request.uri().path(), peer);
            let mut resp = Response::new(());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            let _ = respond.send_response(resp, true);
            continue;
        }
        let resp = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/grpc")
            .body(())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let send = respond.send_response(resp, false).map_err(h2_error)?;
        let stream = GrpcStream::server(send, request.into_body());
        if tx.send((Box::new(stream), peer)).await.is_err() {
            break;
        }
    }
    Ok(())
}
