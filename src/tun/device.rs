//! TUN 设备与系统配置
//!
//! 创建设备、安装覆盖整个 IPv4 空间的两条 /1 路由，以及改写和恢复
//! `/etc/resolv.conf`。

use anyhow::{anyhow, Context as _};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 默认 MTU
pub const DEFAULT_MTU: u16 = 1350;

/// 系统 DNS 配置文件
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// 覆盖 IPv4 空间的两条路由，比默认路由更具体
const CAPTURE_ROUTES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// TUN 设备参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    /// 设备名，为空时自动选取
    pub name: String,
    /// 设备网段，同时作为 FakeIP 地址池
    pub cidr: String,
    pub mtu: u16,
    /// 是否安装捕获路由
    pub auto_route: bool,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cidr: "198.18.0.1/16".to_string(),
            mtu: DEFAULT_MTU,
            auto_route: true,
        }
    }
}

impl TunConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let net = self.net()?;
        if net.prefix_len() > 30 {
            return Err(anyhow!("tun cidr {} is too small", self.cidr));
        }
        if self.mtu < 576 {
            return Err(anyhow!("tun mtu {} is too small", self.mtu));
        }
        Ok(())
    }

    /// 设备网段（按网络地址截断）
    pub fn net(&self) -> anyhow::Result<Ipv4Net> {
        let net: Ipv4Net = self
            .cidr
            .parse()
            .map_err(|e| anyhow!("Invalid tun cidr {}: {}", self.cidr, e))?;
        Ok(net.trunc())
    }
}

/// 设备名前缀
fn tun_prefix() -> &'static str {
    if cfg!(target_os = "macos") {
        "utun"
    } else {
        "tun"
    }
}

/// 在已有网卡名中找最大的 `<prefix>N`，返回 `<prefix>{N+1}`
pub fn next_tun_name<I, S>(prefix: &str, existing: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let next = existing
        .into_iter()
        .filter_map(|name| name.as_ref().strip_prefix(prefix)?.parse::<u16>().ok())
        .max()
        .map_or(0, |n| n + 1);
    format!("{}{}", prefix, next)
}

/// 配置名为空时按系统现有网卡自动选名
pub fn resolve_tun_name(name: &str) -> String {
    if !name.is_empty() {
        return name.to_string();
    }
    let existing: Vec<String> = std::fs::read_dir("/sys/class/net")
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    next_tun_name(tun_prefix(), existing)
}

/// 创建并启用 TUN 设备，地址为 `addr`
pub fn create_device(name: &str, addr: Ipv4Addr, net: Ipv4Net, mtu: u16) -> anyhow::Result<tun::AsyncDevice> {
    let mut config = tun::Configuration::default();
    config
        .tun_name(name)
        .address(addr)
        .netmask(net.netmask())
        .mtu(mtu)
        .up();
    let device = tun::create_as_async(&config).with_context(|| format!("Failed to create tun device {}", name))?;
    info!(name, address = %addr, mtu, "create tun device");
    Ok(device)
}

async fn run_ip(args: &[&str]) -> anyhow::Result<()> {
    debug!("ip {}", args.join(" "));
    let status = Command::new("ip")
        .args(args)
        .status()
        .await
        .context("Failed to run ip")?;
    if !status.success() {
        return Err(anyhow!("ip {} exited with {}", args.join(" "), status));
    }
    Ok(())
}

/// 安装捕获路由
pub async fn add_routes(dev: &str) -> anyhow::Result<()> {
    if !cfg!(target_os = "linux") {
        warn!("automatic routes are only supported on linux");
        return Ok(());
    }
    for route in CAPTURE_ROUTES {
        run_ip(&["route", "replace", route, "dev", dev]).await?;
    }
    Ok(())
}

/// 删除捕获路由，失败只记录日志
pub async fn delete_routes(dev: &str) {
    if !cfg!(target_os = "linux") {
        return;
    }
    for route in CAPTURE_ROUTES {
        if let Err(e) = run_ip(&["route", "del", route, "dev", dev]).await {
            debug!("failed to delete route {}: {}", route, e);
        }
    }
}

/// 系统 DNS 改写，保存原内容以便恢复
#[derive(Debug)]
pub struct ResolvConf {
    path: PathBuf,
    backup: Option<String>,
}

impl ResolvConf {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backup: None,
        }
    }

    /// 把系统名字服务器改为 `nameserver`
    pub fn rewrite(&mut self, nameserver: Ipv4Addr) -> anyhow::Result<()> {
        let old = std::fs::read_to_string(&self.path).unwrap_or_default();
        std::fs::write(&self.path, format!("nameserver {}\n", nameserver))
            .with_context(|| format!("Failed to rewrite {}", self.path.display()))?;
        if self.backup.is_none() {
            self.backup = Some(old);
        }
        info!("rewrite dns fake ip {} to {}", nameserver, self.path.display());
        Ok(())
    }

    /// 恢复改写前的内容，未改写时什么也不做
    pub fn restore(&mut self) -> anyhow::Result<()> {
        let Some(old) = self.backup.take() else {
            return Ok(());
        };
        std::fs::write(&self.path, old).with_context(|| format!("Failed to restore {}", self.path.display()))?;
        info!("restore {}", self.path.display());
        Ok(())
    }

    pub fn is_rewritten(&self) -> bool {
        self.backup.is_some()
    }
}
