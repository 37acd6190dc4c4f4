//! 本地 DNS 服务
//!
//! UDP 与 TCP（两字节长度前缀）两种形式，请求交给 [`Resolver::query`] 处理。
//! TUN 的 DNS 劫持直接复用 [`DnsServer::handle_packet`] 与 [`DnsServer::handle_tcp_stream`]。

use super::client::{read_stream_message, write_stream_message};
use super::resolver::Resolver;
use super::{reply_to, DnsError};
use crate::utils::pool::dns_pool;
use anyhow::Context;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use trust_dns_proto::op::{Message, ResponseCode};

#[derive(Debug, Clone)]
pub struct DnsServer {
    resolver: Arc<Resolver>,
}

impl DnsServer {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// 处理一个原始 DNS 报文，无法解析的请求不作应答
    pub async fn handle_packet(&self, data: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("drop malformed dns request: {}", e);
                return None;
            }
        };
        let reply = self.handle_message(&request).await;
        match reply.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("failed to encode dns reply: {}", e);
                None
            }
        }
    }

    pub async fn handle_message(&self, request: &Message) -> Message {
        if let Some(q) = request.queries().first() {
            trace!(name = %q.name(), qtype = %q.query_type(), "dns query");
        }
        match self.resolver.query(request).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("dns query failed: {}", e);
                let mut reply = reply_to(request);
                reply.set_response_code(match e {
                    DnsError::NxDomain(_) => ResponseCode::NXDomain,
                    DnsError::InvalidMessage(_) => ResponseCode::FormErr,
                    _ => ResponseCode::ServFail,
                });
                reply
            }
        }
    }

    /// 在一条 TCP 流上循环处理请求直到对端关闭
    pub async fn handle_tcp_stream<S>(&self, mut stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let data = match read_stream_message(&mut stream).await {
                Ok(data) => data,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Some(reply) = self.handle_packet(&data).await {
                write_stream_message(&mut stream, &reply).await?;
            }
        }
    }

    /// 在 UDP 套接字上提供服务
    pub async fn serve_udp(&self, socket: Arc<UdpSocket>, token: CancellationToken) -> io::Result<()> {
        let mut buf = dns_pool().get();
        loop {
            let (n, from) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = socket.recv_from(&mut buf[..]) => res?,
            };
            let data = buf[..n].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(reply) = server.handle_packet(&data).await {
                    if let Err(e) = socket.send_to(&reply, from).await {
                        debug!("failed to send dns reply to {}: {}", from, e);
                    }
                }
            });
        }
    }

    /// 在 TCP 监听器上提供服务
    pub async fn serve_tcp(&self, listener: TcpListener, token: CancellationToken) -> io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                res = listener.accept() => res?,
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp_stream(stream).await {
                    debug!("dns tcp session with {} ended: {}", peer, e);
                }
            });
        }
    }

    /// 绑定地址并同时提供 UDP 与 TCP 服务，返回实际监听地址
    pub async fn start(&self, addr: &str, token: CancellationToken) -> anyhow::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind dns udp on {}", addr))?;
        let local = socket.local_addr()?;
        let listener = TcpListener::bind(local)
            .await
            .with_context(|| format!("Failed to bind dns tcp on {}", local))?;
        info!("DNS server listening on {}", local);

        let udp = self.clone();
        let udp_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = udp.serve_udp(Arc::new(socket), udp_token).await {
                debug!("dns udp server stopped: {}", e);
            }
        });
        let tcp = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tcp.serve_tcp(listener, token).await {
                debug!("dns tcp server stopped: {}", e);
            }
        });
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{msg_to_addrs, FakeIpResolver, Hosts};
    use std::net::IpAddr;
    use std::str::FromStr;
    use tokio::net::TcpStream;
    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::{Name, RecordType};

    fn server() -> DnsServer {
        let hosts = Hosts::parse("10.9.8.7 router.lan\n");
        let fake = FakeIpResolver::new("198.18.0.0/16".parse().unwrap()).unwrap();
        DnsServer::new(Arc::new(Resolver::with_clients(Vec::new(), hosts, Some(fake))))
    }

    fn request(domain: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        msg
    }

    #[tokio::test]
    async fn test_handle_packet() {
        let server = server();
        let bytes = server.handle_packet(&request("router.lan.", 11).to_vec().unwrap()).await.unwrap();
        let reply = Message::from_vec(&bytes).unwrap();
        assert_eq!(reply.id(), 11);
        assert_eq!(msg_to_addrs(&reply), vec!["10.9.8.7".parse::<IpAddr>().unwrap()]);

        assert!(server.handle_packet(b"\x00\x01garbage").await.is_none());
    }

    #[tokio::test]
    async fn test_udp_and_tcp_service() {
        let server = server();
        let token = CancellationToken::new();
        let addr = server.start("127.0.0.1:0", token.clone()).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&request("www.foo.test.", 1).to_vec().unwrap(), addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        let reply = Message::from_vec(&buf[..n]).unwrap();
        let fake_ip = msg_to_addrs(&reply)[0];
        assert!(server.resolver().fake_ip().unwrap().is_fake_ip(fake_ip));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_stream_message(&mut stream, &request("www.foo.test.", 2).to_vec().unwrap()).await.unwrap();
        let reply = Message::from_vec(&read_stream_message(&mut stream).await.unwrap()).unwrap();
        assert_eq!(reply.id(), 2);
        assert_eq!(msg_to_addrs(&reply), vec![fake_ip]);

        token.cancel();
    }

    #[tokio::test]
    async fn test_failure_maps_to_servfail() {
        let server = DnsServer::new(Arc::new(Resolver::with_clients(Vec::new(), Hosts::default(), None)));
        let reply = server.handle_message(&request("nowhere.test.", 5)).await;
        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert!(reply.answers().is_empty());
    }
}
