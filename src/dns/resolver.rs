//! 解析器
//!
//! 依次尝试 hosts 文件、FakeIP（增强模式）与上游名字服务器。上游查询按 500ms 间隔
//! 错峰发往各个名字服务器，取第一个 NOERROR 应答；同一问题的并发查询合并为一次。

use super::client::{DnsClient, Nameserver, DEFAULT_EXCHANGE_TIMEOUT};
use super::fakeip::FakeIpResolver;
use super::hosts::{Hosts, HOSTS_TTL};
use super::{msg_to_addrs, reply_to, trim_domain, DnsError, DEFAULT_NAMESERVERS};
use crate::protocol::Address;
use crate::transport::TcpDialer;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use trust_dns_proto::op::{Message, Query, ResponseCode};
use trust_dns_proto::rr::{rdata, Name, RData, Record, RecordType};

/// 相邻名字服务器之间的错峰间隔
pub const STAGGER_INTERVAL: Duration = Duration::from_millis(500);

/// 整体查询超时
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(5);

type InflightFuture = Shared<BoxFuture<'static, Result<Message, DnsError>>>;
type InflightKey = (String, RecordType);

/// 进行中的一次上游查询
struct Inflight {
    generation: u64,
    fut: InflightFuture,
    waiters: usize,
}

/// 等待者离开（完成或被取消）时登记；最后一个等待者离开后移除表项
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<InflightKey, Inflight>>,
    key: InflightKey,
    generation: u64,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock();
        if let Some(entry) = inflight.get_mut(&self.key) {
            if entry.generation != self.generation {
                return;
            }
            entry.waiters -= 1;
            if entry.waiters == 0 {
                inflight.remove(&self.key);
            }
        }
    }
}

/// 解析器选项
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// 配置的名字服务器，为空时使用内置默认值
    pub nameservers: Vec<String>,
    /// 追加操作系统配置中的名字服务器
    pub system_nameservers: bool,
    /// hosts 文件路径，为空时使用系统默认位置
    pub hosts_path: String,
    /// 增强模式下的 FakeIP 网段
    pub fake_ip: Option<Ipv4Net>,
    /// 增强模式下不使用 FakeIP 的域名（后缀匹配）
    pub fake_filter: Vec<String>,
    pub timeout: Duration,
    pub tcp: TcpDialer,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            system_nameservers: true,
            hosts_path: String::new(),
            fake_ip: None,
            fake_filter: Vec::new(),
            timeout: TOTAL_TIMEOUT,
            tcp: TcpDialer::default(),
        }
    }
}

/// DNS 解析器
pub struct Resolver {
    clients: Arc<Vec<Arc<DnsClient>>>,
    hosts: Hosts,
    fake: Option<FakeIpResolver>,
    fake_filter: Vec<String>,
    timeout: Duration,
    inflight: Mutex<HashMap<InflightKey, Inflight>>,
    generation: Mutex<u64>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("clients", &self.clients)
            .field("fake", &self.fake)
            .finish()
    }
}

impl Resolver {
    pub async fn new(opts: ResolverOptions) -> Result<Self, DnsError> {
        let mut servers = Vec::new();
        let configured: Vec<String> = if opts.nameservers.is_empty() {
            DEFAULT_NAMESERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            opts.nameservers.clone()
        };
        for ns in &configured {
            servers.push(Nameserver::from_str(ns)?);
        }
        if opts.system_nameservers {
            for ns in system_nameservers() {
                if !servers.contains(&ns) {
                    servers.push(ns);
                }
            }
        }

        let mut clients = Vec::with_capacity(servers.len());
        for ns in servers {
            match DnsClient::new(ns.clone(), DEFAULT_EXCHANGE_TIMEOUT.min(opts.timeout), opts.tcp.clone()).await {
                Ok(client) => clients.push(Arc::new(client)),
                Err(e) => warn!("skip nameserver {}: {}", ns, e),
            }
        }
        if clients.is_empty() {
            return Err(DnsError::NoNameserverReachable);
        }
        debug!("dns nameservers: {:?}", clients.iter().map(|c| c.nameserver().to_string()).collect::<Vec<_>>());

        let hosts = if opts.hosts_path.is_empty() {
            Hosts::system()
        } else {
            Hosts::load(&opts.hosts_path).unwrap_or_else(|e| {
                warn!("failed to load hosts file {}: {}", opts.hosts_path, e);
                Hosts::default()
            })
        };
        let fake = opts.fake_ip.map(FakeIpResolver::new).transpose()?;

        Ok(Self {
            clients: Arc::new(clients),
            hosts,
            fake,
            fake_filter: opts.fake_filter.iter().map(|d| trim_domain(d).to_ascii_lowercase()).collect(),
            timeout: opts.timeout,
            inflight: Mutex::new(HashMap::new()),
            generation: Mutex::new(0),
        })
    }

    /// 以现成的客户端构造，主要用于测试
    pub fn with_clients(clients: Vec<DnsClient>, hosts: Hosts, fake: Option<FakeIpResolver>) -> Self {
        Self {
            clients: Arc::new(clients.into_iter().map(Arc::new).collect()),
            hosts,
            fake,
            fake_filter: Vec::new(),
            timeout: TOTAL_TIMEOUT,
            inflight: Mutex::new(HashMap::new()),
            generation: Mutex::new(0),
        }
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn with_fake_filter(mut self, filter: Vec<String>) -> Self {
        self.fake_filter = filter.iter().map(|d| trim_domain(d).to_ascii_lowercase()).collect();
        self
    }

    pub fn fake_ip(&self) -> Option<&FakeIpResolver> {
        self.fake.as_ref()
    }

    pub fn is_enhanced(&self) -> bool {
        self.fake.is_some()
    }

    fn filtered(&self, domain: &str) -> bool {
        self.fake_filter
            .iter()
            .any(|f| domain == f || domain.ends_with(&format!(".{}", f)))
    }

    /// 处理一个来自客户端的完整 DNS 请求
    pub async fn query(&self, request: &Message) -> Result<Message, DnsError> {
        let query = request
            .queries()
            .first()
            .ok_or_else(|| DnsError::InvalidMessage("empty question".into()))?;
        let domain = trim_domain(&query.name().to_ascii()).to_ascii_lowercase();

        if let Some(reply) = self.hosts_reply(request, query, &domain) {
            return Ok(reply);
        }

        if let Some(fake) = &self.fake {
            if query.query_type() != RecordType::A {
                return Ok(reply_to(request));
            }
            if !self.filtered(&domain) {
                return fake.query(request);
            }
        }

        let mut reply = self.exchange(request).await?;
        reply.set_id(request.id());
        Ok(reply)
    }

    fn hosts_reply(&self, request: &Message, query: &Query, domain: &str) -> Option<Message> {
        let ip = self.hosts.lookup(domain)?;
        let rdata = match (query.query_type(), ip) {
            (RecordType::A, IpAddr::V4(v4)) => RData::A(rdata::A(v4)),
            (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(rdata::AAAA(v6)),
            _ => return None,
        };
        let mut reply = reply_to(request);
        reply.set_authoritative(true);
        reply.add_answer(Record::from_rdata(query.name().clone(), HOSTS_TTL, rdata));
        Some(reply)
    }

    /// 向上游转发请求，同一问题的并发请求只发送一次
    pub async fn exchange(&self, request: &Message) -> Result<Message, DnsError> {
        let query = request
            .queries()
            .first()
            .ok_or_else(|| DnsError::InvalidMessage("empty question".into()))?;
        let key = (query.name().to_ascii().to_ascii_lowercase(), query.query_type());

        let (guard, fut) = {
            let mut inflight = self.inflight.lock();
            let (generation, fut) = match inflight.get_mut(&key) {
                Some(entry) => {
                    trace!("join inflight dns query {}", key.0);
                    entry.waiters += 1;
                    (entry.generation, entry.fut.clone())
                }
                None => {
                    let generation = {
                        let mut g = self.generation.lock();
                        *g = g.wrapping_add(1);
                        *g
                    };
                    let clients = self.clients.clone();
                    let request = request.clone();
                    let total = self.timeout;
                    let fut = async move {
                        match tokio::time::timeout(total, race(clients, request)).await {
                            Ok(result) => result,
                            Err(_) => Err(DnsError::NoNameserverReachable),
                        }
                    }
                    .boxed()
                    .shared();
                    inflight.insert(
                        key.clone(),
                        Inflight {
                            generation,
                            fut: fut.clone(),
                            waiters: 1,
                        },
                    );
                    (generation, fut)
                }
            };
            let guard = InflightGuard {
                inflight: &self.inflight,
                key,
                generation,
            };
            (guard, fut)
        };

        let result = fut.await;
        drop(guard);

        let mut reply = result?;
        reply.set_id(request.id());
        Ok(reply)
    }

    async fn lookup_type(&self, host: &str, rtype: RecordType) -> Result<Vec<IpAddr>, DnsError> {
        let name = Name::from_str(&format!("{}.", trim_domain(host))).map_err(DnsError::from)?;
        let mut request = Message::new();
        request
            .set_id(rand::random())
            .set_recursion_desired(true)
            .add_query(Query::query(name, rtype));
        let reply = self.exchange(&request).await?;
        Ok(msg_to_addrs(&reply))
    }

    /// 解析域名的真实地址：A 与 AAAA 并发查询，A 有结果时优先
    pub async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(ip) = self.hosts.lookup(host) {
            return Ok(vec![ip]);
        }
        let (v4, v6) = tokio::join!(
            self.lookup_type(host, RecordType::A),
            self.lookup_type(host, RecordType::AAAA)
        );
        match v4 {
            Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
            Ok(_) => {}
            Err(e) => trace!("A lookup for {} failed: {}", host, e),
        }
        match v6 {
            Ok(addrs) if !addrs.is_empty() => Ok(addrs),
            Ok(_) => Err(DnsError::NxDomain(host.to_string())),
            Err(e) => Err(e),
        }
    }

    /// 解析失败时返回 None，由调用方决定是否丢弃
    pub async fn lookup_host(&self, host: &str) -> Option<IpAddr> {
        match self.lookup_ip(host).await {
            Ok(addrs) => addrs.into_iter().next(),
            Err(e) => {
                debug!("failed to resolve {}: {}", host, e);
                None
            }
        }
    }

    /// 把地址解析为套接字地址
    pub async fn resolve_socket_addr(&self, addr: &Address) -> io::Result<SocketAddr> {
        match addr {
            Address::SocketAddr(sa) => Ok(*sa),
            Address::DomainNameAddr(host, port) => {
                let ips = self.lookup_ip(host).await?;
                ips.into_iter()
                    .next()
                    .map(|ip| SocketAddr::new(ip, *port))
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
            }
        }
    }
}

/// 错峰向各名字服务器发送请求，返回第一个 NOERROR 应答
async fn race(clients: Arc<Vec<Arc<DnsClient>>>, request: Message) -> Result<Message, DnsError> {
    let mut pending = FuturesUnordered::new();
    let mut ticker = tokio::time::interval(STAGGER_INTERVAL);
    let mut next = 0usize;
    let mut finished = 0usize;
    let mut nxdomain = false;

    loop {
        tokio::select! {
            _ = ticker.tick(), if next < clients.len() => {
                let client = clients[next].clone();
                let request = request.clone();
                pending.push(async move {
                    let result = client.exchange(&request).await;
                    (client, result)
                });
                next += 1;
            }
            Some((client, result)) = pending.next(), if !pending.is_empty() => {
                finished += 1;
                match result {
                    Ok(reply) if reply.response_code() == ResponseCode::NoError => return Ok(reply),
                    Ok(reply) => {
                        trace!(nameserver = %client.nameserver(), code = ?reply.response_code(), "dns reply rejected");
                        if reply.response_code() == ResponseCode::NXDomain {
                            nxdomain = true;
                        }
                    }
                    Err(e) => debug!(nameserver = %client.nameserver(), "dns exchange failed: {}", e),
                }
                if finished == clients.len() {
                    break;
                }
            }
            else => break,
        }
    }

    if nxdomain {
        let name = request
            .queries()
            .first()
            .map(|q| trim_domain(&q.name().to_ascii()).to_string())
            .unwrap_or_default();
        Err(DnsError::NxDomain(name))
    } else {
        Err(DnsError::NoNameserverReachable)
    }
}

/// 操作系统配置的名字服务器
fn system_nameservers() -> Vec<Nameserver> {
    use super::client::NameserverKind;
    use trust_dns_resolver::config::Protocol;

    match trust_dns_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => config
            .name_servers()
            .iter()
            .filter_map(|ns| {
                let kind = match ns.protocol {
                    Protocol::Udp => NameserverKind::Udp,
                    Protocol::Tcp => NameserverKind::Tcp,
                    _ => return None,
                };
                Some(Nameserver {
                    kind,
                    host: ns.socket_addr.ip().to_string(),
                    port: ns.socket_addr.port(),
                })
            })
            .collect(),
        Err(e) => {
            debug!("failed to read system dns config: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    /// 本地假名字服务器：A 返回 `v4`，AAAA 返回 `v6`，`code` 非 NoError 时只返回错误码
    async fn fake_nameserver(
        v4: Option<Ipv4Addr>,
        v6: Option<Ipv6Addr>,
        code: ResponseCode,
        delay: Duration,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let request = Message::from_vec(&buf[..n]).unwrap();
                let query = request.queries()[0].clone();
                let mut reply = reply_to(&request);
                reply.set_response_code(code);
                if code == ResponseCode::NoError {
                    match (query.query_type(), v4, v6) {
                        (RecordType::A, Some(ip), _) => {
                            reply.add_answer(Record::from_rdata(query.name().clone(), 30, RData::A(rdata::A(ip))));
                        }
                        (RecordType::AAAA, _, Some(ip)) => {
                            reply.add_answer(Record::from_rdata(query.name().clone(), 30, RData::AAAA(rdata::AAAA(ip))));
                        }
                        _ => {}
                    }
                }
                tokio::time::sleep(delay).await;
                let _ = socket.send_to(&reply.to_vec().unwrap(), from).await;
            }
        });
        (addr, hits)
    }

    async fn client(addr: SocketAddr) -> DnsClient {
        let ns: Nameserver = format!("udp://{}", addr).parse().unwrap();
        DnsClient::new(ns, Duration::from_secs(2), TcpDialer::default()).await.unwrap()
    }

    fn request(domain: &str, rtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(77)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(domain).unwrap(), rtype));
        msg
    }

    #[tokio::test]
    async fn test_lookup_prefers_a() {
        let (addr, _) = fake_nameserver(
            Some(Ipv4Addr::new(1, 1, 1, 1)),
            Some("2001:db8::1".parse().unwrap()),
            ResponseCode::NoError,
            Duration::ZERO,
        )
        .await;
        let resolver = Resolver::with_clients(vec![client(addr).await], Hosts::default(), None);
        assert_eq!(resolver.lookup_ip("example.com").await.unwrap(), vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))]);
        assert_eq!(resolver.lookup_host("10.0.0.1").await, Some("10.0.0.1".parse().unwrap()));

        let sa = resolver
            .resolve_socket_addr(&Address::DomainNameAddr("example.com".into(), 443))
            .await
            .unwrap();
        assert_eq!(sa, "1.1.1.1:443".parse().unwrap());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_aaaa() {
        let (addr, _) = fake_nameserver(None, Some("2001:db8::1".parse().unwrap()), ResponseCode::NoError, Duration::ZERO).await;
        let resolver = Resolver::with_clients(vec![client(addr).await], Hosts::default(), None);
        assert_eq!(resolver.lookup_ip("v6only.test").await.unwrap(), vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_hosts_override() {
        let hosts = Hosts::parse("10.1.2.3 internal.test\n");
        let resolver = Resolver::with_clients(Vec::new(), hosts, None);
        assert_eq!(resolver.lookup_host("internal.test").await, Some("10.1.2.3".parse().unwrap()));

        let reply = resolver.query(&request("internal.test.", RecordType::A)).await.unwrap();
        assert_eq!(reply.id(), 77);
        assert_eq!(reply.answers()[0].ttl(), HOSTS_TTL);
        assert_eq!(msg_to_addrs(&reply), vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_first_noerror_wins_and_nxdomain() {
        let (bad, _) = fake_nameserver(None, None, ResponseCode::ServFail, Duration::ZERO).await;
        let (good, _) = fake_nameserver(Some(Ipv4Addr::new(2, 2, 2, 2)), None, ResponseCode::NoError, Duration::ZERO).await;
        let resolver = Resolver::with_clients(vec![client(bad).await, client(good).await], Hosts::default(), None);
        let reply = resolver.exchange(&request("example.com.", RecordType::A)).await.unwrap();
        assert_eq!(msg_to_addrs(&reply), vec![IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2))]);

        let (nx, _) = fake_nameserver(None, None, ResponseCode::NXDomain, Duration::ZERO).await;
        let resolver = Resolver::with_clients(vec![client(nx).await], Hosts::default(), None);
        let err = resolver.exchange(&request("missing.test.", RecordType::A)).await.unwrap_err();
        assert_eq!(err, DnsError::NxDomain("missing.test".into()));
    }

    #[tokio::test]
    async fn test_second_server_not_contacted_when_first_fast() {
        let (fast, _) = fake_nameserver(Some(Ipv4Addr::new(3, 3, 3, 3)), None, ResponseCode::NoError, Duration::ZERO).await;
        let (slow, slow_hits) = fake_nameserver(Some(Ipv4Addr::new(4, 4, 4, 4)), None, ResponseCode::NoError, Duration::ZERO).await;
        let resolver = Resolver::with_clients(vec![client(fast).await, client(slow).await], Hosts::default(), None);
        let reply = resolver.exchange(&request("example.com.", RecordType::A)).await.unwrap();
        assert_eq!(msg_to_addrs(&reply), vec![IpAddr::V4(Ipv4Addr::new(3, 3, 3, 3))]);
        assert_eq!(slow_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_queries_coalesce() {
        let (addr, hits) = fake_nameserver(
            Some(Ipv4Addr::new(5, 5, 5, 5)),
            None,
            ResponseCode::NoError,
            Duration::from_millis(100),
        )
        .await;
        let resolver = Arc::new(Resolver::with_clients(vec![client(addr).await], Hosts::default(), None));
        let mut tasks = Vec::new();
        for id in 0..8u16 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                let mut req = request("same.test.", RecordType::A);
                req.set_id(id);
                resolver.exchange(&req).await.unwrap()
            }));
        }
        for (id, task) in tasks.into_iter().enumerate() {
            let reply = task.await.unwrap();
            assert_eq!(reply.id(), id as u16);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiters_release_inflight_entry() {
        // 只收不回的名字服务器
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let resolver = Arc::new(Resolver::with_clients(vec![client(addr).await], Hosts::default(), None));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                let _ = resolver.exchange(&request("silent.test.", RecordType::A)).await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(resolver.inflight_len(), 1);

        tasks[0].abort();
        let _ = (&mut tasks[0]).await;
        assert_eq!(resolver.inflight_len(), 1);

        for task in tasks.iter_mut().skip(1) {
            task.abort();
            let _ = task.await;
        }
        assert_eq!(resolver.inflight_len(), 0);

        // 超时取消同样清理
        let _ = tokio::time::timeout(
            Duration::from_millis(50),
            resolver.exchange(&request("silent.test.", RecordType::A)),
        )
        .await;
        assert_eq!(resolver.inflight_len(), 0);
        drop(silent);
    }

    #[tokio::test]
    async fn test_enhanced_query() {
        let (addr, _) = fake_nameserver(Some(Ipv4Addr::new(6, 6, 6, 6)), None, ResponseCode::NoError, Duration::ZERO).await;
        let fake = FakeIpResolver::new("198.18.0.0/16".parse().unwrap()).unwrap();
        let resolver = Resolver::with_clients(vec![client(addr).await], Hosts::default(), Some(fake))
            .with_fake_filter(vec!["real.test".into()]);

        let reply = resolver.query(&request("www.foo.test.", RecordType::A)).await.unwrap();
        let ip = msg_to_addrs(&reply)[0];
        assert!(resolver.fake_ip().unwrap().is_fake_ip(ip));

        let reply = resolver.query(&request("www.foo.test.", RecordType::AAAA)).await.unwrap();
        assert!(reply.answers().is_empty());
        assert_eq!(reply.response_code(), ResponseCode::NoError);

        let reply = resolver.query(&request("cdn.real.test.", RecordType::A)).await.unwrap();
        assert_eq!(msg_to_addrs(&reply), vec![IpAddr::V4(Ipv4Addr::new(6, 6, 6, 6))]);
    }
}
