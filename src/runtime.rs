//! 运行时
//!
//! 按配置装配解析器、规则引擎、选择器与各入站，统一启动与停止。
//! 停止顺序：先关闭监听，再关闭拨号池，最后关闭 TUN。

use crate::client::{HttpListener, LocalContext, MixedListener, Socks5Listener, TcpForwarder, UdpForwarder};
use crate::config::local::split_tun_addr;
use crate::config::{Config, Role};
use crate::dns::{DnsServer, Resolver};
use crate::selector::Selector;
use crate::server::SsServer;
use crate::statistic::StatisticManager;
use crate::transport::Dialer;
use crate::tun::Enhancer;
use crate::utils::format_bytes;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 生命周期误用
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("already running")]
    AlreadyRunning,
    #[error("already closed")]
    AlreadyClosed,
}

/// 生命周期状态：NEW -> STARTED -> STOPPED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    New,
    Started,
    Stopped,
}

/// 只能启动一次、关闭一次的状态机
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: Mutex<State>,
}

impl Lifecycle {
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// 进入 STARTED；返回 false 表示已经启动过
    pub fn begin_start(&self) -> Result<bool, LifecycleError> {
        let mut state = self.state.lock();
        match *state {
            State::New => {
                *state = State::Started;
                Ok(true)
            }
            State::Started => Ok(false),
            State::Stopped => Err(LifecycleError::AlreadyClosed),
        }
    }

    /// 进入 STOPPED，重复关闭返回错误
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if *state == State::Stopped {
            return Err(LifecycleError::AlreadyClosed);
        }
        *state = State::Stopped;
        Ok(())
    }
}

/// 一个运行中的入站
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundListener {
    pub name: String,
    pub addr: SocketAddr,
}

/// 进程级运行时
pub struct Runtime {
    config: Config,
    role: Role,
    lifecycle: Lifecycle,
    token: CancellationToken,
    statistic: Arc<StatisticManager>,
    dialers: Mutex<Vec<Arc<Dialer>>>,
    enhancer: Mutex<Option<Arc<Enhancer>>>,
    resolver: Mutex<Option<Arc<Resolver>>>,
    listeners: Mutex<Vec<BoundListener>>,
}

impl Runtime {
    /// 校验配置并创建运行时
    pub fn new(config: Config, role: Role) -> anyhow::Result<Self> {
        config.validate(role)?;
        Ok(Self {
            config,
            role,
            lifecycle: Lifecycle::default(),
            token: CancellationToken::new(),
            statistic: StatisticManager::new(),
            dialers: Mutex::new(Vec::new()),
            enhancer: Mutex::new(None),
            resolver: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    pub fn statistic(&self) -> &Arc<StatisticManager> {
        &self.statistic
    }

    /// 本地端的解析器，启动前为 None
    pub fn resolver(&self) -> Option<Arc<Resolver>> {
        self.resolver.lock().clone()
    }

    /// 已启动的入站及其实际地址
    pub fn listeners(&self) -> Vec<BoundListener> {
        self.listeners.lock().clone()
    }

    /// 按名称查找入站地址
    pub fn listener_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners.lock().iter().find(|l| l.name == name).map(|l| l.addr)
    }

    fn record(&self, name: impl Into<String>, addr: SocketAddr) {
        self.listeners.lock().push(BoundListener { name: name.into(), addr });
    }

    /// 启动全部组件，任一组件启动失败时整体失败并清理已启动的部分
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.lifecycle.begin_start()? {
            return Err(LifecycleError::AlreadyRunning.into());
        }
        self.statistic.spawn_ticker(self.token.child_token());
        let result = match self.role {
            Role::Local => self.start_local().await,
            Role::Server => self.start_server().await,
        };
        if let Err(e) = result {
            let _ = self.lifecycle.stop();
            self.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_server(&self) -> anyhow::Result<()> {
        let tcp = self.config.tcp_dialer();
        for s in self.config.enabled_servers() {
            let server = SsServer::new(s.name(), &s.addr, s.transport, s.opts.clone(), s.cipher_suite()?, tcp.clone())
                .with_udp(s.udp)
                .with_udp_timeout(self.config.udp_timeout());
            let addrs = server.start(self.token.child_token()).await?;
            self.record(s.name(), addrs.tcp);
        }
        Ok(())
    }

    async fn start_local(&self) -> anyhow::Result<()> {
        let local = self.config.local.clone().ok_or_else(|| anyhow!("Missing [local] section"))?;
        let tcp = self.config.tcp_dialer();

        let opts = self.config.resolver_options(tcp.clone())?;
        let resolver = Arc::new(
            Resolver::new(opts)
                .await
                .map_err(|e| anyhow!("Failed to create dns resolver: {}", e))?,
        );
        *self.resolver.lock() = Some(resolver.clone());

        let ruler = self.config.rules.build_ruler(self.config.geoip()?)?.with_resolver(resolver.clone());
        let mut selector = Selector::new(tcp.clone()).with_udp_timeout(self.config.udp_timeout());
        for s in self.config.enabled_servers() {
            let dialer = Arc::new(s.dialer(tcp.clone())?);
            self.dialers.lock().push(dialer.clone());
            selector.add_proxy(s.tcp_proxy(dialer)?);
            if let Some(packet) = s.packet_proxy()? {
                selector.add_packet_proxy(packet);
            }
            info!(name = s.name(), addr = %s.addr, transport = %s.transport, "register proxy");
        }

        if !selector.packet_proxy_names().is_empty() {
            info!("udp relay via {:?}", selector.packet_proxy_names());
        }

        let mut ctx = LocalContext::new(Arc::new(ruler), Arc::new(selector), self.statistic.clone());
        if resolver.is_enhanced() {
            ctx = ctx.with_resolver(resolver.clone());
        }
        info!(mode = %ctx.ruler.mode(), "rule mode");

        if !local.socks_addr.is_empty() {
            let addr = Socks5Listener::new(ctx.clone(), local.socks_credentials()?)
                .with_udp(local.socks_udp)
                .start(&local.socks_addr, self.token.child_token())
                .await?;
            self.record("socks", addr);
        }
        if !local.http_addr.is_empty() {
            let addr = HttpListener::new(ctx.clone(), local.http_credentials()?)
                .start(&local.http_addr, self.token.child_token())
                .await?;
            self.record("http", addr);
        }
        if !local.mixed_addr.is_empty() {
            let addr = MixedListener::new(ctx.clone(), local.socks_credentials()?, local.http_credentials()?)
                .with_udp(local.socks_udp)
                .start(&local.mixed_addr, self.token.child_token())
                .await?;
            self.record("mixed", addr);
        }
        for entry in &local.tcp_tun_addr {
            let (listen, remote) = split_tun_addr(entry)?;
            let addr = TcpForwarder::new(ctx.clone(), &remote)?
                .start(&listen, self.token.child_token())
                .await?;
            self.record(format!("tcp-tun:{}", remote), addr);
        }
        for entry in &local.udp_tun_addr {
            let (listen, remote) = split_tun_addr(entry)?;
            let addr = UdpForwarder::new(ctx.clone(), &remote)?
                .start(&listen, self.token.child_token())
                .await?;
            self.record(format!("udp-tun:{}", remote), addr);
        }
        if !local.fake_dns.listen.is_empty() {
            let addr = DnsServer::new(resolver.clone())
                .start(&local.fake_dns.listen, self.token.child_token())
                .await?;
            self.record("dns", addr);
        }
        if local.enable_tun {
            let enhancer = Arc::new(
                Enhancer::new(local.tun.clone(), ctx.clone(), resolver.clone())?
                    .with_hijack(local.hijack_addrs()?),
            );
            *self.enhancer.lock() = Some(enhancer.clone());
            enhancer.start().await?;
        }
        Ok(())
    }

    /// 停止运行时，重复停止返回 [`LifecycleError::AlreadyClosed`]
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let was = self.lifecycle.state();
        self.lifecycle.stop()?;
        if was == State::Started {
            self.shutdown().await;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.token.cancel();
        let dialers: Vec<Arc<Dialer>> = self.dialers.lock().drain(..).collect();
        for dialer in dialers {
            dialer.close().await;
        }
        let enhancer = self.enhancer.lock().take();
        if let Some(enhancer) = enhancer {
            if let Err(e) = enhancer.close().await {
                warn!("failed to close tun: {}", e);
            }
        }
        let (up, down) = self.statistic.totals();
        info!(
            "mini-ss stopped, upload {}, download {}",
            format_bytes(up),
            format_bytes(down)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalConfig, ServerConfig};
    use crate::protocol::socks5::{client_request, Command};
    use crate::protocol::Address;
    use crate::rule::RuleMode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_lifecycle() {
        let lc = Lifecycle::default();
        assert_eq!(lc.state(), State::New);
        assert_eq!(lc.begin_start(), Ok(true));
        assert_eq!(lc.begin_start(), Ok(false));
        assert_eq!(lc.stop(), Ok(()));
        assert_eq!(lc.stop(), Err(LifecycleError::AlreadyClosed));
        assert_eq!(lc.begin_start(), Err(LifecycleError::AlreadyClosed));
    }

    fn server_config() -> Config {
        let mut server = ServerConfig::new("default", "127.0.0.1:0", "pw", "aes-256-gcm");
        server.udp = true;
        Config {
            server: vec![server],
            ..Default::default()
        }
    }

    fn local_config(server_addr: SocketAddr) -> Config {
        let mut config = Config {
            server: vec![ServerConfig::new("proxy", &server_addr.to_string(), "pw", "aes-256-gcm")],
            local: Some(LocalConfig {
                socks_addr: "127.0.0.1:0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let fake_dns = &mut config.local.as_mut().unwrap().fake_dns;
        fake_dns.nameservers = vec!["127.0.0.1".to_string()];
        fake_dns.system_nameservers = false;
        config.rules.mode = RuleMode::Global;
        config
    }

    async fn echo_server() -> SocketAddr {
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
    async fn test_start_stop_twice() {
        let runtime = Runtime::new(server_config(), Role::Server).unwrap();
        runtime.start().await.unwrap();
        assert_eq!(runtime.state(), State::Started);
        assert!(runtime.listener_addr("default").is_some());
        let err = runtime.start().await.unwrap_err();
        assert_eq!(err.downcast_ref::<LifecycleError>(), Some(&LifecycleError::AlreadyRunning));

        runtime.stop().await.unwrap();
        assert_eq!(runtime.stop().await, Err(LifecycleError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_local_through_server() {
        let server = Runtime::new(server_config(), Role::Server).unwrap();
        server.start().await.unwrap();
        let server_addr = server.listener_addr("default").unwrap();

        let local = Runtime::new(local_config(server_addr), Role::Local).unwrap();
        local.start().await.unwrap();
        assert!(local.resolver().is_some());
        let socks = local.listener_addr("socks").unwrap();

        let echo = echo_server().await;
        let mut stream = TcpStream::connect(socks).await.unwrap();
        client_request(&mut stream, None, Command::Connect, &Address::from(echo))
            .await
            .unwrap();
        stream.write_all(b"end to end").await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"end to end");
        assert_eq!(local.statistic().connection_count(), 1);

        drop(stream);
        local.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config("127.0.0.1:8388".parse().unwrap());
        config.local.as_mut().unwrap().http_addr = taken.local_addr().unwrap().to_string();
        let runtime = Runtime::new(config, Role::Local).unwrap();
        assert!(runtime.start().await.is_err());
        assert_eq!(runtime.state(), State::Stopped);
    }
}
