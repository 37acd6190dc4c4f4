//! SOCKS5 协议（RFC 1928 / RFC 1929）
//!
//! 服务端的协商、请求解析与应答，以及测试和诊断用的最小客户端。

use crate::protocol::address::AddressError;
use crate::protocol::Address;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 版本号
pub const SOCKS5_VERSION: u8 = 0x05;

/// 用户名密码子协商版本
const USER_PASS_VERSION: u8 = 0x01;

/// SOCKS5 错误
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("unsupported socks version: {0}")]
    UnsupportedVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("authentication failed")]
    AuthFailed,
    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("request rejected with reply {0:?}")]
    Rejected(ReplyCode),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Socks5Error> for io::Error {
    fn from(err: Socks5Error) -> Self {
        match err {
            Socks5Error::Io(e) => e,
            Socks5Error::Address(e) => e.into(),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// 认证方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UserPass = 0x02,
    NoAcceptable = 0xFF,
}

/// 请求命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Connect => 0x01,
            Command::Bind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(Socks5Error::UnsupportedCommand(other)),
        }
    }
}

/// 应答码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<u8> for ReplyCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ReplyCode::Succeeded,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub command: Command,
    pub address: Address,
}

/// 用户名密码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// 解析 `user:pass`，空串表示不认证
    pub fn parse(s: &str) -> Option<Self> {
        let (user, pass) = s.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self::new(user, pass))
    }
}

/// 服务端协商：选择认证方法并在需要时完成用户名密码认证
pub async fn negotiate<S>(stream: &mut S, auth: Option<&Credentials>) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }
    let n = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; n];
    stream.read_exact(&mut methods).await?;

    let wanted = match auth {
        Some(_) => AuthMethod::UserPass,
        None => AuthMethod::NoAuth,
    };
    let selected = if methods.contains(&(wanted as u8)) {
        wanted
    } else {
        AuthMethod::NoAcceptable
    };
    stream.write_all(&[SOCKS5_VERSION, selected as u8]).await?;
    stream.flush().await?;

    match (selected, auth) {
        (AuthMethod::NoAcceptable, _) => Err(Socks5Error::NoAcceptableMethod),
        (AuthMethod::UserPass, Some(expected)) => verify_user_pass(stream, expected).await,
        _ => Ok(()),
    }
}

async fn read_field<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, Socks5Error> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn verify_user_pass<S>(stream: &mut S, expected: &Credentials) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != USER_PASS_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }
    let username = read_field(stream).await?;
    let password = read_field(stream).await?;
    let ok = username == expected.username.as_bytes() && password == expected.password.as_bytes();
    stream.write_all(&[USER_PASS_VERSION, if ok { 0x00 } else { 0x01 }]).await?;
    stream.flush().await?;
    if ok {
        Ok(())
    } else {
        Err(Socks5Error::AuthFailed)
    }
}

/// 读取请求。命令不支持时已向客户端回复 0x07
pub async fn read_request<S>(stream: &mut S) -> Result<Socks5Request, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(head[0]));
    }
    let address = match Address::read_from(stream).await {
        Ok(addr) => addr,
        Err(AddressError::UnsupportedAddressType(t)) => {
            write_reply(stream, ReplyCode::AddressTypeNotSupported, &unspecified()).await?;
            return Err(AddressError::UnsupportedAddressType(t).into());
        }
        Err(e) => return Err(e.into()),
    };
    let command = match Command::try_from(head[1]) {
        Ok(Command::Bind) | Err(_) => {
            write_reply(stream, ReplyCode::CommandNotSupported, &unspecified()).await?;
            return Err(Socks5Error::UnsupportedCommand(head[1]));
        }
        Ok(command) => command,
    };
    Ok(Socks5Request { command, address })
}

/// `0.0.0.0:0`
pub fn unspecified() -> Address {
    Address::SocketAddr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

/// 发送应答
pub async fn write_reply<S>(stream: &mut S, code: ReplyCode, bind: &Address) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(3 + bind.serialized_len());
    buf.extend_from_slice(&[SOCKS5_VERSION, code as u8, 0x00]);
    bind.write_to_buf(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await
}

/// 客户端握手并发送请求，返回服务端应答中的绑定地址
pub async fn client_request<S>(
    stream: &mut S,
    auth: Option<&Credentials>,
    command: Command,
    target: &Address,
) -> Result<Address, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = match auth {
        Some(_) => AuthMethod::UserPass,
        None => AuthMethod::NoAuth,
    };
    stream.write_all(&[SOCKS5_VERSION, 1, method as u8]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(reply[0]));
    }
    if reply[1] != method as u8 {
        return Err(Socks5Error::NoAcceptableMethod);
    }
    if let Some(creds) = auth {
        let mut buf = vec![USER_PASS_VERSION, creds.username.len() as u8];
        buf.extend_from_slice(creds.username.as_bytes());
        buf.push(creds.password.len() as u8);
        buf.extend_from_slice(creds.password.as_bytes());
        stream.write_all(&buf).await?;
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(Socks5Error::AuthFailed);
        }
    }

    let mut buf = vec![SOCKS5_VERSION, command.code(), 0x00];
    target.write_to_buf(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    let bind = Address::read_from(stream).await?;
    match ReplyCode::from(head[1]) {
        ReplyCode::Succeeded => Ok(bind),
        code => Err(Socks5Error::Rejected(code)),
    }
}

/// 构造 SOCKS5 UDP 报文：`RSV(2) FRAG(1) ADDR DATA`
pub fn encode_udp_packet(target: &Address, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + target.serialized_len() + payload.len());
    buf.extend_from_slice(&[0, 0, 0]);
    target.write_to_buf(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// 解析 SOCKS5 UDP 报文，返回目标地址与负载
pub fn decode_udp_packet(packet: &[u8]) -> Result<(Address, &[u8]), Socks5Error> {
    if packet.len() < 3 {
        return Err(AddressError::ShortBuffer {
            need: 3,
            have: packet.len(),
        }
        .into());
    }
    if packet[2] != 0 {
        return Err(Socks5Error::UnsupportedCommand(packet[2]));
    }
    let (addr, n) = Address::parse_from_buffer(&packet[3..])?;
    Ok((addr, &packet[3 + n..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_connect_without_auth() {
        let (mut client, mut server) = duplex(256);
        let target = Address::DomainNameAddr("example.com".into(), 80);
        let expected = target.clone();

        let srv = tokio::spawn(async move {
            negotiate(&mut server, None).await.unwrap();
            let req = read_request(&mut server).await.unwrap();
            write_reply(&mut server, ReplyCode::Succeeded, &unspecified()).await.unwrap();
            req
        });
        let bind = client_request(&mut client, None, Command::Connect, &target).await.unwrap();
        assert_eq!(bind, unspecified());
        let req = srv.await.unwrap();
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, expected);
    }

    #[tokio::test]
    async fn test_user_pass() {
        let creds = Credentials::new("user", "secret");
        let (mut client, mut server) = duplex(256);
        let server_creds = creds.clone();
        let srv = tokio::spawn(async move { negotiate(&mut server, Some(&server_creds)).await });
        let target = Address::SocketAddr("1.2.3.4:443".parse().unwrap());
        let wrong = Credentials::new("user", "nope");
        let err = client_request(&mut client, Some(&wrong), Command::Connect, &target).await.unwrap_err();
        assert!(matches!(err, Socks5Error::AuthFailed));
        assert!(matches!(srv.await.unwrap(), Err(Socks5Error::AuthFailed)));

        // 客户端只提供无认证方法
        let (mut client, mut server) = duplex(256);
        let srv = tokio::spawn(async move { negotiate(&mut server, Some(&creds)).await });
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xFF]);
        assert!(matches!(srv.await.unwrap(), Err(Socks5Error::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn test_unsupported_command_replies_07() {
        let (mut client, mut server) = duplex(256);
        let srv = tokio::spawn(async move { read_request(&mut server).await });
        client.write_all(&[5, 0x02, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
        assert!(matches!(srv.await.unwrap(), Err(Socks5Error::UnsupportedCommand(2))));
    }

    #[test]
    fn test_udp_packet() {
        let target = Address::SocketAddr("1.1.1.1:53".parse().unwrap());
        let packet = encode_udp_packet(&target, b"query");
        assert_eq!(&packet[..10], &[0, 0, 0, 1, 1, 1, 1, 1, 0, 53]);
        let (addr, payload) = decode_udp_packet(&packet).unwrap();
        assert_eq!(addr, target);
        assert_eq!(payload, b"query");

        let mut fragmented = packet.clone();
        fragmented[2] = 1;
        assert!(decode_udp_packet(&fragmented).is_err());
        assert!(decode_udp_packet(&[0, 0]).is_err());
    }

    #[test]
    fn test_credentials_parse() {
        assert_eq!(Credentials::parse("a:b"), Some(Credentials::new("a", "b")));
        assert_eq!(Credentials::parse("a:"), Some(Credentials::new("a", "")));
        assert_eq!(Credentials::parse(""), None);
        assert_eq!(Credentials::parse(":b"), None);
    }
}
