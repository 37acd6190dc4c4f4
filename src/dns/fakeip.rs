//! FakeIP 解析
//!
//! 增强模式下 A 查询直接返回地址池中的伪造地址，TUN 收到发往伪造地址的连接后
//! 再通过 [`FakeIpResolver::find_by_ip`] 反查出原始域名。

use super::pool::FakeIpPool;
use super::{reply_to, trim_domain, DnsError};
use ipnet::Ipv4Net;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::trace;
use trust_dns_proto::op::Message;
use trust_dns_proto::rr::{rdata, RData, Record};

/// 伪造记录的有效期
pub const FAKE_RECORD_TTL: Duration = Duration::from_secs(60);

const MAX_RECORDS: usize = 4096;

/// 域名与伪造地址的绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDnsRecord {
    pub domain: String,
    pub fake_ip: Ipv4Addr,
    /// 真实地址，首次建立连接解析后回填
    pub real_ip: Option<IpAddr>,
    pub expires: Instant,
}

impl FakeDnsRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

struct State {
    pool: FakeIpPool,
    records: LruCache<String, FakeDnsRecord>,
    by_ip: HashMap<Ipv4Addr, String>,
}

impl State {
    fn remove(&mut self, domain: &str) {
        if let Some(record) = self.records.pop(domain) {
            self.forget(&record);
        }
    }

    fn forget(&mut self, record: &FakeDnsRecord) {
        trace!(ip = %record.fake_ip, domain = %record.domain, "release fake ip");
        self.by_ip.remove(&record.fake_ip);
        self.pool.release(record.fake_ip);
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for domain in &expired {
            self.remove(domain);
        }
        expired.len()
    }

    fn alloc(&mut self, domain: &str, now: Instant) -> Result<Ipv4Addr, DnsError> {
        match self.pool.alloc(domain) {
            Err(DnsError::PoolExhausted) => {}
            other => return other,
        }
        if self.purge_expired(now) == 0 {
            if let Some((_, oldest)) = self.records.pop_lru() {
                self.forget(&oldest);
            }
        }
        self.pool.alloc(domain)
    }
}

/// FakeIP 解析器
pub struct FakeIpResolver {
    state: Mutex<State>,
    ttl: Duration,
}

impl std::fmt::Debug for FakeIpResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeIpResolver").field("net", &self.net()).finish()
    }
}

impl FakeIpResolver {
    pub fn new(net: Ipv4Net) -> Result<Self, DnsError> {
        Self::with_ttl(net, FAKE_RECORD_TTL)
    }

    pub fn with_ttl(net: Ipv4Net, ttl: Duration) -> Result<Self, DnsError> {
        let cap = NonZeroUsize::new(MAX_RECORDS).ok_or(DnsError::PoolExhausted)?;
        Ok(Self {
            state: Mutex::new(State {
                pool: FakeIpPool::new(net)?,
                records: LruCache::new(cap),
                by_ip: HashMap::new(),
            }),
            ttl,
        })
    }

    pub fn net(&self) -> Ipv4Net {
        self.state.lock().pool.net()
    }

    /// TUN 网卡地址
    pub fn gateway(&self) -> Ipv4Addr {
        self.state.lock().pool.gateway()
    }

    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.state.lock().pool.contains(v4),
            IpAddr::V6(_) => false,
        }
    }

    /// 应答 A 查询，已有未过期记录时复用并续期
    pub fn query(&self, request: &Message) -> Result<Message, DnsError> {
        let query = request
            .queries()
            .first()
            .ok_or_else(|| DnsError::InvalidMessage("empty question".into()))?;
        let domain = trim_domain(&query.name().to_ascii()).to_ascii_lowercase();
        let fake_ip = self.lookup_or_alloc(&domain)?;

        let mut reply = reply_to(request);
        reply.add_answer(Record::from_rdata(
            query.name().clone(),
            self.ttl.as_secs() as u32,
            RData::A(rdata::A(fake_ip)),
        ));
        Ok(reply)
    }

    fn lookup_or_alloc(&self, domain: &str) -> Result<Ipv4Addr, DnsError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(domain) {
            if !record.is_expired(now) {
                record.expires = now + self.ttl;
                return Ok(record.fake_ip);
            }
        }
        state.remove(domain);

        let fake_ip = state.alloc(domain, now)?;
        trace!(ip = %fake_ip, domain, "allocate fake ip");
        let record = FakeDnsRecord {
            domain: domain.to_string(),
            fake_ip,
            real_ip: None,
            expires: now + self.ttl,
        };
        if let Some((_, evicted)) = state.records.push(domain.to_string(), record) {
            state.forget(&evicted);
        }
        state.by_ip.insert(fake_ip, domain.to_string());
        Ok(fake_ip)
    }

    /// 按伪造地址反查记录，命中时续期
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<FakeDnsRecord> {
        let IpAddr::V4(ip) = ip else {
            return None;
        };
        let now = Instant::now();
        let mut state = self.state.lock();
        let domain = state.by_ip.get(&ip)?.clone();
        let expired = match state.records.get_mut(&domain) {
            Some(record) if !record.is_expired(now) => {
                record.expires = now + self.ttl;
                return Some(record.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(&domain);
        } else {
            state.by_ip.remove(&ip);
        }
        None
    }

    /// 回填真实地址
    pub fn set_real_ip(&self, domain: &str, ip: IpAddr) {
        if let Some(record) = self.state.lock().records.peek_mut(domain) {
            record.real_ip = Some(ip);
        }
    }

    /// 清除过期记录，返回清除数量
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
