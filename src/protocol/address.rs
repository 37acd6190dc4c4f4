//! Shadowsocks 地址编解码
//!
//! 地址格式与 SOCKS5 的 `<ATYP><DST.ADDR><DST.PORT>` 子字段逐字节一致：
//! 一个类型字节（0x01 IPv4 / 0x03 域名 / 0x04 IPv6），地址内容（域名前带一个长度字节），
//! 最后是大端序的 16 位端口。

use bytes::BufMut;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 编码后地址的最大长度：1 + 1 + 255 + 2
pub const MAX_ADDRESS_LEN: usize = 1 + 1 + 255 + 2;

/// 域名最大长度
pub const MAX_DOMAIN_LEN: usize = 255;

/// 地址编解码错误
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),
    #[error("short buffer: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },
    #[error("invalid host or port: {0}")]
    InvalidHostOrPort(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<AddressError> for io::Error {
    fn from(err: AddressError) -> Self {
        match err {
            AddressError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// 地址类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = AddressError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            other => Err(AddressError::UnsupportedAddressType(other)),
        }
    }
}

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP 地址和端口
    SocketAddr(SocketAddr),
    /// 域名和端口
    DomainNameAddr(String, u16),
}

impl Address {
    /// 从异步读取器中读取地址，只读取地址本身需要的字节
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, AddressError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let atyp = AddressType::try_from(reader.read_u8().await?)?;
        match atyp {
            AddressType::Ipv4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Address::SocketAddr(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            AddressType::Ipv6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(Address::SocketAddr(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            AddressType::Domain => {
                let len = reader.read_u8().await? as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                buf.truncate(len);
                let domain = String::from_utf8(buf)
                    .map_err(|e| AddressError::InvalidHostOrPort(e.to_string()))?;
                Ok(Address::DomainNameAddr(domain, port))
            }
        }
    }

    /// 从缓冲区前缀解析地址
    ///
    /// # 返回
    /// 解析出的地址以及消耗的字节数
    pub fn parse_from_buffer(buf: &[u8]) -> Result<(Self, usize), AddressError> {
        let Some(&first) = buf.first() else {
            return Err(AddressError::ShortBuffer { need: 1, have: 0 });
        };
        let need = match AddressType::try_from(first)? {
            AddressType::Ipv4 => 1 + 4 + 2,
            AddressType::Ipv6 => 1 + 16 + 2,
            AddressType::Domain => {
                let Some(&len) = buf.get(1) else {
                    return Err(AddressError::ShortBuffer {
                        need: 2,
                        have: buf.len(),
                    });
                };
                1 + 1 + len as usize + 2
            }
        };
        if buf.len() < need {
            return Err(AddressError::ShortBuffer {
                need,
                have: buf.len(),
            });
        }

        let port = u16::from_be_bytes([buf[need - 2], buf[need - 1]]);
        let addr = match first {
            0x01 => {
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                Address::SocketAddr(SocketAddr::new(IpAddr::V4(ip), port))
            }
            0x04 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                Address::SocketAddr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            _ => {
                let domain = std::str::from_utf8(&buf[2..need - 2])
                    .map_err(|e| AddressError::InvalidHostOrPort(e.to_string()))?;
                Address::DomainNameAddr(domain.to_string(), port)
            }
        };
        Ok((addr, need))
    }

    /// 由主机名和端口构造地址
    ///
    /// 端口以有符号整数传入，越界（小于 0 或大于 65535）时返回 `InvalidHostOrPort`。
    pub fn from_host_port(host: &str, port: i64) -> Result<Self, AddressError> {
        let port = u16::try_from(port)
            .map_err(|_| AddressError::InvalidHostOrPort(format!("port {} out of range", port)))?;
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if trimmed.is_empty() {
            return Err(AddressError::InvalidHostOrPort("empty host".to_string()));
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Address::SocketAddr(SocketAddr::new(ip, port)));
        }
        if trimmed.len() > MAX_DOMAIN_LEN {
            return Err(AddressError::DomainTooLong(trimmed.len()));
        }
        Ok(Address::DomainNameAddr(trimmed.to_string(), port))
    }

    /// 将地址编码进给定的缓冲区
    ///
    /// # 返回
    /// 写入的字节数；缓冲区不足时返回 `ShortBuffer`
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, AddressError> {
        let need = self.serialized_len();
        if let Address::DomainNameAddr(domain, _) = self {
            if domain.len() > MAX_DOMAIN_LEN {
                return Err(AddressError::DomainTooLong(domain.len()));
            }
        }
        if buf.len() < need {
            return Err(AddressError::ShortBuffer {
                need,
                have: buf.len(),
            });
        }
        let mut cursor = &mut buf[..need];
        self.write_to_buf(&mut cursor);
        Ok(need)
    }

    /// 追加写入实现了 `BufMut` 的缓冲区
    ///
    /// 调用方需保证域名长度不超过 255。
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match self {
            Address::SocketAddr(SocketAddr::V4(addr)) => {
                buf.put_u8(AddressType::Ipv4 as u8);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddr(SocketAddr::V6(addr)) => {
                buf.put_u8(AddressType::Ipv6 as u8);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddr(domain, port) => {
                buf.put_u8(AddressType::Domain as u8);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// 编码为字节向量
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        buf
    }

    /// 编码后的长度
    pub fn serialized_len(&self) -> usize {
        match self {
            Address::SocketAddr(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::SocketAddr(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::DomainNameAddr(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::SocketAddr(addr) => addr.port(),
            Address::DomainNameAddr(_, port) => *port,
        }
    }

    /// 主机部分：IP 地址不带方括号，域名原样返回
    pub fn host(&self) -> String {
        match self {
            Address::SocketAddr(addr) => addr.ip().to_string(),
            Address::DomainNameAddr(domain, _) => domain.clone(),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Address::SocketAddr(SocketAddr::V4(_)) => AddressType::Ipv4,
            Address::SocketAddr(SocketAddr::V6(_)) => AddressType::Ipv6,
            Address::DomainNameAddr(_, _) => AddressType::Domain,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::DomainNameAddr(_, _))
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::SocketAddr(addr) => Some(*addr),
            Address::DomainNameAddr(_, _) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::SocketAddr(SocketAddr::V4(addr)) => write!(f, "{}:{}", addr.ip(), addr.port()),
            Address::SocketAddr(SocketAddr::V6(addr)) => {
                write!(f, "[{}]:{}", addr.ip(), addr.port())
            }
            Address::DomainNameAddr(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// 解析 `host:port`，IPv6 需使用 `[addr]:port` 形式
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidHostOrPort(s.to_string()))?;
        let port: i64 = port
            .parse()
            .map_err(|_| AddressError::InvalidHostOrPort(s.to_string()))?;
        if host.contains(':') && !host.starts_with('[') {
            return Err(AddressError::InvalidHostOrPort(s.to_string()));
        }
        Address::from_host_port(host, port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::SocketAddr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let addr = Address::from_host_port("127.0.0.1", 8080).unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(bytes, vec![0x01, 127, 0, 0, 1, 0x1f, 0x90]);

        let (parsed, consumed) = Address::parse_from_buffer(&bytes).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, 7);
        assert_eq!(parsed.host(), "127.0.0.1");
        assert_eq!(parsed.port(), 8080);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let addr = Address::from_host_port("::1", 443).unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), 19);
        assert_eq!(bytes[0], 0x04);

        let (parsed, consumed) = Address::parse_from_buffer(&bytes).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, 19);
        assert_eq!(parsed.host(), "::1");
        assert_eq!(parsed.to_string(), "[::1]:443");
    }

    #[test]
    fn test_domain_wire_format() {
        let addr = Address::from_host_port("httpbin.org", 80).unwrap();
        let mut expected = vec![0x03, 0x0b];
        expected.extend_from_slice(b"httpbin.org");
        expected.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(addr.to_bytes(), expected);
        assert_eq!(addr.serialized_len(), 1 + 1 + 11 + 2);
    }

    #[test]
    fn test_parse_ignores_trailing_payload() {
        let mut buf = Address::from_host_port("1.1.1.1", 53).unwrap().to_bytes();
        buf.extend_from_slice(b"payload");
        let (addr, consumed) = Address::parse_from_buffer(&buf).unwrap();
        assert_eq!(addr.to_string(), "1.1.1.1:53");
        assert_eq!(&buf[consumed..], b"payload");
    }

    #[test]
    fn test_domain_length_boundary() {
        let ok = "a".repeat(255);
        let addr = Address::from_host_port(&ok, 1).unwrap();
        assert_eq!(addr.serialized_len(), 259);

        let too_long = "a".repeat(256);
        assert!(matches!(
            Address::from_host_port(&too_long, 1),
            Err(AddressError::DomainTooLong(256))
        ));
    }

    #[test]
    fn test_port_boundary() {
        assert!(matches!(
            Address::from_host_port("example.com", -1),
            Err(AddressError::InvalidHostOrPort(_))
        ));
        assert!(matches!(
            Address::from_host_port("example.com", 65536),
            Err(AddressError::InvalidHostOrPort(_))
        ));
        assert!(Address::from_host_port("example.com", 65535).is_ok());
        assert!(Address::from_host_port("example.com", 0).is_ok());
    }

    #[test]
    fn test_short_buffer_everywhere() {
        for host in ["10.0.0.1", "fe80::1", "example.com"] {
            let addr = Address::from_host_port(host, 1234).unwrap();
            let bytes = addr.to_bytes();

            let short = &bytes[..bytes.len() - 1];
            assert!(matches!(
                Address::parse_from_buffer(short),
                Err(AddressError::ShortBuffer { .. })
            ));

            let mut out = vec![0u8; bytes.len() - 1];
            assert!(matches!(
                addr.encode_into(&mut out),
                Err(AddressError::ShortBuffer { .. })
            ));

            let mut exact = vec![0u8; bytes.len()];
            assert_eq!(addr.encode_into(&mut exact).unwrap(), bytes.len());
            assert_eq!(exact, bytes);
        }
        assert!(matches!(
            Address::parse_from_buffer(&[]),
            Err(AddressError::ShortBuffer { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_from_short_stream() {
        let bytes = Address::from_host_port("example.com", 80).unwrap().to_bytes();
        let mut short = &bytes[..bytes.len() - 1];
        assert!(Address::read_from(&mut short).await.is_err());
    }

    #[tokio::test]
    async fn test_read_from_reads_minimal_bytes() {
        let mut buf = Address::from_host_port("www.foo.test", 443).unwrap().to_bytes();
        buf.extend_from_slice(b"GET");
        let mut reader = &buf[..];
        let addr = Address::read_from(&mut reader).await.unwrap();
        assert_eq!(addr, Address::DomainNameAddr("www.foo.test".into(), 443));
        assert_eq!(reader, b"GET");
    }

    #[test]
    fn test_unsupported_type() {
        assert!(matches!(
            Address::parse_from_buffer(&[0x02, 0, 0]),
            Err(AddressError::UnsupportedAddressType(0x02))
        ));
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "example.com:443".parse::<Address>().unwrap(),
            Address::DomainNameAddr("example.com".into(), 443)
        );
        assert_eq!(
            "[::1]:53".parse::<Address>().unwrap().to_string(),
            "[::1]:53"
        );
        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:99999".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
    }
}
