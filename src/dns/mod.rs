//! DNS 解析与 FakeIP
//!
//! - [`resolver`]：上游名字服务器扇出查询、hosts 覆盖、单飞合并
//! - [`client`]：UDP / TCP / DNS over TLS 单服务器客户端
//! - [`fakeip`] / [`pool`]：增强模式下为域名分配伪造的 IPv4
//! - [`server`]：本地 DNS 服务，也供 TUN 劫持复用
//! - [`hosts`]：hosts 文件解析

pub mod client;
pub mod fakeip;
pub mod hosts;
pub mod pool;
pub mod resolver;
pub mod server;

pub use client::{DnsClient, Nameserver, NameserverKind};
pub use fakeip::{FakeDnsRecord, FakeIpResolver, FAKE_RECORD_TTL};
pub use hosts::Hosts;
pub use pool::FakeIpPool;
pub use resolver::{Resolver, ResolverOptions};
pub use server::DnsServer;

use std::net::IpAddr;
use thiserror::Error;
use trust_dns_proto::op::{Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::RData;

/// 默认上游名字服务器
pub const DEFAULT_NAMESERVERS: [&str; 2] = ["114.114.114.114", "8.8.8.8"];

/// DNS 错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("no nameserver reachable")]
    NoNameserverReachable,
    #[error("domain not found: {0}")]
    NxDomain(String),
    #[error("fake ip pool exhausted")]
    PoolExhausted,
    #[error("invalid nameserver {0}")]
    InvalidNameserver(String),
    #[error("invalid dns message: {0}")]
    InvalidMessage(String),
    #[error("dns io: {0}")]
    Io(String),
}

impl From<std::io::Error> for DnsError {
    fn from(err: std::io::Error) -> Self {
        DnsError::Io(err.to_string())
    }
}

impl From<trust_dns_proto::error::ProtoError> for DnsError {
    fn from(err: trust_dns_proto::error::ProtoError) -> Self {
        DnsError::InvalidMessage(err.to_string())
    }
}

impl From<DnsError> for std::io::Error {
    fn from(err: DnsError) -> Self {
        let kind = match err {
            DnsError::NxDomain(_) => std::io::ErrorKind::NotFound,
            DnsError::NoNameserverReachable => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// 去掉域名末尾的根点
pub fn trim_domain(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// 提取应答中的 A / AAAA 地址
pub fn msg_to_addrs(reply: &Message) -> Vec<IpAddr> {
    reply
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// 以请求为模板构造一个空应答
pub fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError)
        .add_queries(request.queries().to_vec());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::{rdata, Name, Record, RecordType};

    #[test]
    fn test_trim_domain() {
        assert_eq!(trim_domain("www.example.com."), "www.example.com");
        assert_eq!(trim_domain("example.com"), "example.com");
    }

    #[test]
    fn test_reply_and_addrs() {
        let name = Name::from_str("example.com.").unwrap();
        let mut request = Message::new();
        request.set_id(42).add_query(Query::query(name.clone(), RecordType::A));
        let mut reply = reply_to(&request);
        reply.add_answer(Record::from_rdata(name, 60, RData::A(rdata::A(Ipv4Addr::new(1, 2, 3, 4)))));

        assert_eq!(reply.id(), 42);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.queries().len(), 1);
        assert_eq!(msg_to_addrs(&reply), vec![IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))]);
    }
}
