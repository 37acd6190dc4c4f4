//! mini-ss - Shadowsocks 代理套件
//!
//! 支持 SS/SSR 加密、多种可插拔传输（KCP、QUIC、WebSocket、gRPC、SSH、obfs）、
//! 规则分流、FakeIP DNS 以及 TUN 透明代理。
//!
//! 运行角色分为本地端与服务端，二者都由 [`runtime::Runtime`] 按配置装配。

pub mod client;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod dns;
pub mod protocol;
pub mod relay;
pub mod rule;
pub mod runtime;
pub mod selector;
pub mod server;
pub mod ssr;
pub mod statistic;
pub mod transport;
pub mod tun;
pub mod utils;

// 重新导出主要类型
pub use config::{Config, Role, ServerConfig};
pub use crypto::CipherSuite;
pub use protocol::Address;
pub use runtime::{LifecycleError, Runtime, State};

/// 初始化日志系统
///
/// `RUST_LOG` 优先，未设置时使用配置中的级别。
pub fn init_logger(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
