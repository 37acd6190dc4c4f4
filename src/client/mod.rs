//! 本地入站
//!
//! SOCKS5、HTTP 代理、混合端口与固定端口转发。所有入站共享一个 [`LocalContext`]：
//! 规则引擎决定出口，选择器执行中继，统计管理器记录连接。

pub mod forward;
pub mod http;
pub mod mixed;
pub mod socks5;

pub use forward::{TcpForwarder, UdpForwarder};
pub use http::HttpListener;
pub use mixed::MixedListener;
pub use socks5::Socks5Listener;

use crate::dns::Resolver;
use crate::protocol::Address;
use crate::rule::{RuleError, RuleItem, Ruler, Selection};
use crate::selector::Selector;
use crate::statistic::{StatisticManager, TcpTracker, TrackerContext};
use crate::transport::tcp::accept_keepalive;
use anyhow::Context as _;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 入站共享的路由与统计上下文
#[derive(Clone)]
pub struct LocalContext {
    pub ruler: Arc<Ruler>,
    pub selector: Arc<Selector>,
    pub statistic: Arc<StatisticManager>,
    /// 增强模式下用于 FakeIP 反查
    pub resolver: Option<Arc<Resolver>>,
}

impl LocalContext {
    pub fn new(ruler: Arc<Ruler>, selector: Arc<Selector>, statistic: Arc<StatisticManager>) -> Self {
        Self {
            ruler,
            selector,
            statistic,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 规则匹配与中继使用的目标串
    ///
    /// 目标落在 FakeIP 网段时换回对应的域名；找不到记录则保持原样。
    pub fn target_of(&self, addr: &Address) -> String {
        let (Some(resolver), Some(sa)) = (&self.resolver, addr.socket_addr()) else {
            return addr.to_string();
        };
        let Some(fake) = resolver.fake_ip() else {
            return addr.to_string();
        };
        if !fake.is_fake_ip(sa.ip()) {
            return addr.to_string();
        }
        match fake.find_by_ip(sa.ip()) {
            Some(record) => format!("{}:{}", record.domain, sa.port()),
            None => {
                warn!("fake ip {} has no record", sa.ip());
                addr.to_string()
            }
        }
    }

    pub async fn route(&self, target: &str) -> Result<(RuleItem, Selection), RuleError> {
        self.ruler.route(target).await
    }

    /// 按路由结果中继一条 TCP 连接，期间记入统计
    pub async fn relay_tcp<S>(
        &self,
        conn: S,
        src: SocketAddr,
        target: &str,
        rule: &RuleItem,
        selection: &Selection,
        kind: &str,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let context = TrackerContext {
            src: src.to_string(),
            dst: target.to_string(),
            network: "TCP".to_string(),
            kind: kind.to_string(),
            rule: rule.kind.to_string(),
            proxy: selection.name().to_string(),
        };
        let tracked = TcpTracker::new(conn, self.statistic.clone(), context);
        self.selector.relay_tcp(selection, tracked, target).await
    }
}

/// 绑定入站监听地址
pub(crate) async fn bind_tcp(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} listener on {}", name, addr))
}

/// 循环接受连接并为每个连接启动一个任务，`token` 取消时退出
pub(crate) fn spawn_serve<F, Fut>(listener: TcpListener, token: CancellationToken, name: &'static str, handle: F)
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                r = accept_keepalive(&listener) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("{} accept failed: {}", name, e);
                        continue;
                    }
                }
            };
            let fut = handle(stream, peer);
            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    debug!("{} session with {} ended: {}", name, peer, e);
                }
            });
        }
        debug!("{} listener stopped", name);
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dns::{FakeIpResolver, Hosts};
    use crate::rule::{RuleMode, RuleType};
    use crate::transport::TcpDialer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// 只有一条 Others 直连规则的上下文
    pub(crate) fn direct_context() -> LocalContext {
        let rules = vec![RuleItem::new(RuleType::Others, "direct", vec![])];
        let ruler = Ruler::new(RuleMode::Match, rules, None).unwrap();
        LocalContext::new(
            Arc::new(ruler),
            Arc::new(Selector::new(TcpDialer::default())),
            StatisticManager::new(),
        )
    }

    /// 不接受任何目标的上下文
    pub(crate) fn drop_context() -> LocalContext {
        let ruler = Ruler::new(RuleMode::Match, vec![], None).unwrap();
        LocalContext::new(
            Arc::new(ruler),
            Arc::new(Selector::new(TcpDialer::default())),
            StatisticManager::new(),
        )
    }

    pub(crate) async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = s.read(&mut buf).await {
                        if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_target_of_fake_ip() {
        let fake = FakeIpResolver::new("198.18.0.0/16".parse().unwrap()).unwrap();
        let resolver = Resolver::with_clients(vec![], Hosts::default(), Some(fake));
        let query = crate::dns::client::tests::a_query("www.foo.test", 7);
        let reply = resolver.query(&query).await.unwrap();
        let ip = crate::dns::msg_to_addrs(&reply)[0];

        let ctx = direct_context().with_resolver(Arc::new(resolver));
        let fake_addr = Address::SocketAddr(SocketAddr::new(ip, 443));
        assert_eq!(ctx.target_of(&fake_addr), "www.foo.test:443");

        let real: Address = "1.1.1.1:53".parse().unwrap();
        assert_eq!(ctx.target_of(&real), "1.1.1.1:53");
        let unknown: Address = "198.18.200.1:80".parse().unwrap();
        assert_eq!(ctx.target_of(&unknown), "198.18.200.1:80");
    }

    #[tokio::test]
    async fn test_relay_tcp_tracks_connection() {
        let ctx = direct_context();
        let echo = echo_server().await;
        let target = echo.to_string();
        let (rule, selection) = ctx.route(&target).await.unwrap();

        let (client, server) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let relay_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            relay_ctx.relay_tcp(server, peer, &target, &rule, &selection, "SOCKS").await
        });

        let mut client = client;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(ctx.statistic.connection_count(), 1);

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(ctx.statistic.connection_count(), 0);
        assert_eq!(ctx.statistic.totals(), (4, 4));
    }
}
