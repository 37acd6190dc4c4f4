//! TUN 增强模式
//!
//! 创建 TUN 设备，把内核交来的 IP 包喂给用户态网络栈，网络栈还原出的
//! TCP 连接与 UDP 报文交给 [`TunHandler`]。同时在设备地址上启动伪造
//! DNS 服务，并改写系统 DNS 指向它。

use super::device::{self, ResolvConf, TunConfig, RESOLV_CONF};
use super::handler::{TunHandler, UdpMsg};
use crate::client::LocalContext;
use crate::dns::{DnsServer, Resolver};
use crate::runtime::{Lifecycle, LifecycleError, State};
use anyhow::{anyhow, Context as _};
use futures::{SinkExt, StreamExt};
use netstack_smoltcp::StackBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 伪造 DNS 服务端口
pub const FAKE_DNS_PORT: u16 = 53;

const STACK_BUFFER_SIZE: usize = 1024;
const TCP_BUFFER_SIZE: usize = 512 * 1024;
const UDP_WRITE_QUEUE: usize = 1024;

/// TUN 增强器
pub struct Enhancer {
    config: TunConfig,
    ctx: LocalContext,
    resolver: Arc<Resolver>,
    hijack: Vec<SocketAddr>,
    dns_port: u16,
    resolv: Mutex<Option<ResolvConf>>,
    lifecycle: Lifecycle,
    token: CancellationToken,
    device_name: Mutex<Option<String>>,
}

impl Enhancer {
    /// `resolver` 必须启用了 FakeIP，其网段即设备网段
    pub fn new(config: TunConfig, ctx: LocalContext, resolver: Arc<Resolver>) -> anyhow::Result<Self> {
        config.validate()?;
        if !resolver.is_enhanced() {
            return Err(anyhow!("tun requires fake dns to be enabled"));
        }
        Ok(Self {
            config,
            ctx,
            resolver,
            hijack: Vec::new(),
            dns_port: FAKE_DNS_PORT,
            resolv: Mutex::new(Some(ResolvConf::new(RESOLV_CONF))),
            lifecycle: Lifecycle::default(),
            token: CancellationToken::new(),
            device_name: Mutex::new(None),
        })
    }

    pub fn with_hijack(mut self, hijack: Vec<SocketAddr>) -> Self {
        self.hijack = hijack;
        self
    }

    /// 伪造 DNS 服务端口，测试中使用非特权端口
    pub fn with_dns_port(mut self, port: u16) -> Self {
        self.dns_port = port;
        self
    }

    /// 不改写系统 DNS
    pub fn without_dns_rewrite(mut self) -> Self {
        self.resolv = Mutex::new(None);
        self
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    pub fn device_name(&self) -> Option<String> {
        self.device_name.lock().clone()
    }

    /// 启动增强模式，已启动时直接返回
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.lifecycle.begin_start()? {
            return Ok(());
        }
        if let Err(e) = self.setup().await {
            self.token.cancel();
            let _ = self.lifecycle.stop();
            return Err(e);
        }
        Ok(())
    }

    async fn setup(&self) -> anyhow::Result<()> {
        let fake = self
            .resolver
            .fake_ip()
            .ok_or_else(|| anyhow!("tun requires fake dns to be enabled"))?;
        let gateway = fake.gateway();
        let name = device::resolve_tun_name(&self.config.name);
        let dev = device::create_device(&name, gateway, fake.net(), self.config.mtu)?;
        *self.device_name.lock() = Some(name.clone());

        let dns_addr = DnsServer::new(self.resolver.clone())
            .start(&format!("{}:{}", gateway, self.dns_port), self.token.child_token())
            .await?;
        let handler = Arc::new(
            TunHandler::new(self.ctx.clone(), self.resolver.clone(), dns_addr).with_hijack(self.hijack.clone()),
        );
        spawn_stack(dev, handler, self.config.mtu, self.token.clone())?;

        if let Some(resolv) = self.resolv.lock().as_mut() {
            resolv.rewrite(gateway)?;
        }
        if self.config.auto_route {
            device::add_routes(&name).await?;
        }
        info!(device = %name, cidr = %fake.net(), dns = %dns_addr, "tun enhancer started");
        Ok(())
    }

    /// 停止增强模式并恢复系统 DNS，重复关闭返回 [`LifecycleError::AlreadyClosed`]
    pub async fn close(&self) -> Result<(), LifecycleError> {
        let was = self.lifecycle.state();
        self.lifecycle.stop()?;
        self.token.cancel();
        if was != State::Started {
            return Ok(());
        }
        if let Some(resolv) = self.resolv.lock().as_mut() {
            if let Err(e) = resolv.restore() {
                warn!("{}", e);
            }
        }
        if self.config.auto_route {
            if let Some(name) = self.device_name() {
                device::delete_routes(&name).await;
            }
        }
        info!("tun enhancer stopped");
        Ok(())
    }
}

/// 连接设备与网络栈并启动各处理循环
fn spawn_stack(
    dev: tun::AsyncDevice,
    handler: Arc<TunHandler>,
    mtu: u16,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let (stack, runner, udp_socket, tcp_listener) = StackBuilder::default()
        .enable_tcp(true)
        .enable_udp(true)
        .enable_icmp(true)
        .stack_buffer_size(STACK_BUFFER_SIZE)
        .tcp_buffer_size(TCP_BUFFER_SIZE)
        .build()
        .context("Failed to build network stack")?;
    let mut tcp_listener = tcp_listener.context("tcp is disabled in network stack")?;
    let udp_socket = udp_socket.context("udp is disabled in network stack")?;

    if let Some(runner) = runner {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = runner => debug!("network stack runner exited"),
            }
        });
    }

    let (mut stack_sink, mut stack_stream) = stack.split();
    let (mut tun_reader, mut tun_writer) = tokio::io::split(dev);

    // 设备 -> 网络栈
    let t = token.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; mtu as usize + 64];
        loop {
            let n = tokio::select! {
                _ = t.cancelled() => break,
                r = tun_reader.read(&mut buf) => match r {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        error!("tun read failed: {}", e);
                        break;
                    }
                },
            };
            if let Err(e) = stack_sink.send(buf[..n].to_vec()).await {
                error!("network stack closed: {}", e);
                break;
            }
        }
    });

    // 网络栈 -> 设备
    let t = token.clone();
    tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                _ = t.cancelled() => break,
                p = stack_stream.next() => match p {
                    Some(Ok(p)) => p,
                    Some(Err(e)) => {
                        debug!("network stack error: {}", e);
                        continue;
                    }
                    None => break,
                },
            };
            if let Err(e) = tun_writer.write_all(&packet).await {
                error!("tun write failed: {}", e);
                break;
            }
        }
    });

    // TCP
    let t = token.clone();
    let tcp_handler = handler.clone();
    tokio::spawn(async move {
        loop {
            let (stream, src, dst) = tokio::select! {
                _ = t.cancelled() => break,
                c = tcp_listener.next() => match c {
                    Some(c) => c,
                    None => break,
                },
            };
            let handler = tcp_handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle_tcp(stream, src, dst).await {
                    debug!("tcp-tun {} -> {} ended: {}", src, dst, e);
                }
            });
        }
    });

    // UDP，所有会话的回包经一个写任务送回网络栈
    let (mut udp_reader, mut udp_writer) = udp_socket.split();
    let (tx, mut rx) = mpsc::channel::<UdpMsg>(UDP_WRITE_QUEUE);
    let t = token.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = t.cancelled() => break,
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            if let Err(e) = udp_writer.send(msg).await {
                debug!("udp-tun write failed: {}", e);
            }
        }
    });
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => break,
                m = udp_reader.next() => match m {
                    Some(m) => m,
                    None => break,
                },
            };
            handler.handle_udp(msg, &tx, &token).await;
        }
    });
    Ok(())
}
