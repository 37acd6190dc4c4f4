//! 单个上游名字服务器的客户端
//!
//! 名字服务器写作 `udp://host[:53]`、`tcp://host[:53]` 或 `tls://host[:853]`，
//! 不带协议前缀时按 UDP 处理。

use super::DnsError;
use crate::transport::tls::{self, TlsOptions};
use crate::transport::TcpDialer;
use crate::utils::pool::dns_pool;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, UdpSocket};
use tokio_rustls::TlsConnector;
use tracing::trace;
use trust_dns_proto::op::Message;

/// 单次交换的默认超时
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// 名字服务器协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameserverKind {
    Udp,
    Tcp,
    Tls,
}

impl NameserverKind {
    fn default_port(&self) -> u16 {
        match self {
            NameserverKind::Udp | NameserverKind::Tcp => 53,
            NameserverKind::Tls => 853,
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            NameserverKind::Udp => "udp",
            NameserverKind::Tcp => "tcp",
            NameserverKind::Tls => "tls",
        }
    }
}

/// 解析后的名字服务器
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nameserver {
    pub kind: NameserverKind,
    pub host: String,
    pub port: u16,
}

impl FromStr for Nameserver {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DnsError::InvalidNameserver(s.to_string());
        let s = s.trim();
        let (kind, rest) = match s.split_once("://") {
            Some(("udp", rest)) => (NameserverKind::Udp, rest),
            Some(("tcp", rest)) => (NameserverKind::Tcp, rest),
            Some(("tls", rest)) => (NameserverKind::Tls, rest),
            Some(_) => return Err(invalid()),
            None => (NameserverKind::Udp, s),
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(invalid());
        }
        // 不带方括号的 IPv6 整体是主机
        if let Ok(ip) = rest.parse::<IpAddr>() {
            return Ok(Self {
                kind,
                host: ip.to_string(),
                port: kind.default_port(),
            });
        }
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => (host, port.parse::<u16>().map_err(|_| invalid())?),
            Some(_) => return Err(invalid()),
            None => (rest, kind.default_port()),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.contains(':') && host.parse::<IpAddr>().is_err() {
            return Err(invalid());
        }
        Ok(Self {
            kind,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Nameserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.kind.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.kind.scheme(), self.host, self.port)
        }
    }
}

/// 单服务器 DNS 客户端
#[derive(Clone)]
pub struct DnsClient {
    nameserver: Nameserver,
    addr: SocketAddr,
    timeout: Duration,
    tcp: TcpDialer,
    tls: Option<TlsConnector>,
}

impl fmt::Debug for DnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsClient")
            .field("nameserver", &self.nameserver)
            .field("addr", &self.addr)
            .finish()
    }
}

impl DnsClient {
    /// 创建客户端，域名形式的服务器地址在此处解析
    pub async fn new(nameserver: Nameserver, timeout: Duration, tcp: TcpDialer) -> Result<Self, DnsError> {
        let addr = match nameserver.host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, nameserver.port),
            Err(_) => lookup_host((nameserver.host.as_str(), nameserver.port))
                .await?
                .next()
                .ok_or_else(|| DnsError::InvalidNameserver(nameserver.to_string()))?,
        };
        let tls = match nameserver.kind {
            NameserverKind::Tls => {
                let opts = TlsOptions {
                    enable: true,
                    hostname: nameserver.host.clone(),
                    ..Default::default()
                };
                Some(tls::connector(&opts, &[]).map_err(|e| DnsError::InvalidNameserver(e.to_string()))?)
            }
            _ => None,
        };
        Ok(Self {
            nameserver,
            addr,
            timeout,
            tcp,
            tls,
        })
    }

    pub fn nameserver(&self) -> &Nameserver {
        &self.nameserver
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 发送请求并等待应答
    pub async fn exchange(&self, request: &Message) -> Result<Message, DnsError> {
        trace!(nameserver = %self.nameserver, id = request.id(), "dns exchange");
        let fut = async {
            match self.nameserver.kind {
                NameserverKind::Udp => self.exchange_udp(request).await,
                NameserverKind::Tcp => {
                    let stream = self.tcp.connect_addr(self.addr).await?;
                    exchange_stream(stream, request).await
                }
                NameserverKind::Tls => {
                    let stream = self.tcp.connect_addr(self.addr).await?;
                    let connector = self
                        .tls
                        .as_ref()
                        .ok_or_else(|| DnsError::InvalidNameserver(self.nameserver.to_string()))?;
                    let opts = TlsOptions {
                        hostname: self.nameserver.host.clone(),
                        ..Default::default()
                    };
                    let name = tls::server_name(&opts, &self.nameserver.host)
                        .map_err(|e| DnsError::InvalidNameserver(e.to_string()))?;
                    let stream = connector.connect(name, stream).await?;
                    exchange_stream(stream, request).await
                }
            }
        };
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::Io(format!("exchange with {} timed out", self.nameserver))),
        }
    }

    async fn exchange_udp(&self, request: &Message) -> Result<Message, DnsError> {
        let bind: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| DnsError::Io("bad bind address".into()))?
        } else {
            "[::]:0".parse().map_err(|_| DnsError::Io("bad bind address".into()))?
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.addr).await?;
        socket.send(&request.to_vec()?).await?;

        let mut buf = dns_pool().get();
        loop {
            let n = socket.recv(&mut buf[..]).await?;
            match Message::from_vec(&buf[..n]) {
                Ok(reply) if reply.id() == request.id() => return Ok(reply),
                Ok(reply) => trace!("ignore dns reply with id {}", reply.id()),
                Err(e) => trace!("ignore malformed dns reply: {}", e),
            }
        }
    }
}

/// 在字节流上完成一次 DNS 交换（两字节长度前缀）
pub async fn exchange_stream<S>(mut stream: S, request: &Message) -> Result<Message, DnsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_stream_message(&mut stream, &request.to_vec()?).await?;
    let data = read_stream_message(&mut stream).await?;
    let reply = Message::from_vec(&data)?;
    if reply.id() != request.id() {
        return Err(DnsError::InvalidMessage(format!(
            "reply id {} does not match request id {}",
            reply.id(),
            request.id()
        )));
    }
    Ok(reply)
}

/// 读取一个带长度前缀的 DNS 报文
pub async fn read_stream_message<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u16().await? as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

/// 写出一个带长度前缀的 DNS 报文
pub async fn write_stream_message<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "dns message too large"))?;
    let mut out = Vec::with_capacity(2 + data.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    stream.write_all(&out).await?;
    stream.flush().await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;
    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::{rdata, Name, RData, Record, RecordType};

    pub(crate) fn a_query(domain: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        msg
    }

    fn answer(request: &Message, ip: Ipv4Addr) -> Message {
        let mut reply = super::super::reply_to(request);
        let name = request.queries()[0].name().clone();
        reply.add_answer(Record::from_rdata(name, 30, RData::A(rdata::A(ip))));
        reply
    }

    #[test]
    fn test_parse_nameserver() {
        let ns: Nameserver = "8.8.8.8".parse().unwrap();
        assert_eq!(ns.kind, NameserverKind::Udp);
        assert_eq!(ns.port, 53);
        assert_eq!(ns.to_string(), "udp://8.8.8.8:53");

        let ns: Nameserver = "tcp://1.1.1.1:5353".parse().unwrap();
        assert_eq!((ns.kind, ns.host.as_str(), ns.port), (NameserverKind::Tcp, "1.1.1.1", 5353));

        let ns: Nameserver = "tls://dns.google".parse().unwrap();
        assert_eq!((ns.kind, ns.port), (NameserverKind::Tls, 853));

        let ns: Nameserver = "2001:4860:4860::8888".parse().unwrap();
        assert_eq!(ns.to_string(), "udp://[2001:4860:4860::8888]:53");

        let ns: Nameserver = "udp://[::1]:53".parse().unwrap();
        assert_eq!(ns.host, "::1");

        assert!("https://dns.google/dns-query".parse::<Nameserver>().is_err());
        assert!("udp://".parse::<Nameserver>().is_err());
        assert!("udp://1.1.1.1:99999".parse::<Nameserver>().is_err());
    }

    #[tokio::test]
    async fn test_udp_exchange_ignores_mismatched_id() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..n]).unwrap();
            let mut wrong = answer(&request, Ipv4Addr::new(9, 9, 9, 9));
            wrong.set_id(request.id().wrapping_add(1));
            server.send_to(&wrong.to_vec().unwrap(), from).await.unwrap();
            let right = answer(&request, Ipv4Addr::new(1, 2, 3, 4));
            server.send_to(&right.to_vec().unwrap(), from).await.unwrap();
        });

        let ns: Nameserver = format!("udp://{}", addr).parse().unwrap();
        let client = DnsClient::new(ns, DEFAULT_EXCHANGE_TIMEOUT, TcpDialer::default()).await.unwrap();
        let reply = client.exchange(&a_query("example.com.", 7)).await.unwrap();
        assert_eq!(super::super::msg_to_addrs(&reply), vec![IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))]);
    }

    #[tokio::test]
    async fn test_tcp_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let data = read_stream_message(&mut stream).await.unwrap();
            let request = Message::from_vec(&data).unwrap();
            let reply = answer(&request, Ipv4Addr::new(5, 6, 7, 8));
            write_stream_message(&mut stream, &reply.to_vec().unwrap()).await.unwrap();
        });

        let ns: Nameserver = format!("tcp://{}", addr).parse().unwrap();
        let client = DnsClient::new(ns, DEFAULT_EXCHANGE_TIMEOUT, TcpDialer::default()).await.unwrap();
        let reply = client.exchange(&a_query("example.com.", 9)).await.unwrap();
        assert_eq!(super::super::msg_to_addrs(&reply), vec![IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8))]);
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ns: Nameserver = format!("udp://{}", silent.local_addr().unwrap()).parse().unwrap();
        let client = DnsClient::new(ns, Duration::from_millis(100), TcpDialer::default()).await.unwrap();
        assert!(client.exchange(&a_query("example.com.", 1)).await.is_err());
    }
}
