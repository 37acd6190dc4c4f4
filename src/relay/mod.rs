//! 中继引擎
//!
//! - [`tcp`]：双向字节流拷贝，本地到服务端、服务端到目标、直连三种方式
//! - [`udp`]：按客户端源地址做 NAT 映射的数据报中继
//!
//! 代理两端的加密层统一由 [`ProxyCipher`] 表示。

pub mod tcp;
pub mod udp;

pub use tcp::{copy_bidirectional, relay_server_to_remote, DirectTcpRelayer, ProxyTcpRelayer};
pub use udp::{CipherPacketConn, UdpMode, UdpRelayer, UDP_IDLE_TIMEOUT};

use crate::crypto::CipherSuite;
use crate::protocol::{AsyncReadWrite, BoxStream};
use crate::ssr::SsrContext;
use std::io;

/// 一个代理节点使用的加密层
#[derive(Debug, Clone)]
pub enum ProxyCipher {
    /// 标准 Shadowsocks 流加密或 AEAD
    Ss(CipherSuite),
    /// ShadowsocksR 混淆与协议插件
    Ssr(SsrContext),
}

impl ProxyCipher {
    pub fn wrap<S>(&self, stream: S) -> io::Result<BoxStream>
    where
        S: AsyncReadWrite + 'static,
    {
        match self {
            ProxyCipher::Ss(suite) => Ok(suite.wrap_stream(stream)),
            ProxyCipher::Ssr(ctx) => ctx.wrap_stream(stream),
        }
    }

    pub fn encrypt_packet(&self, plain: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            ProxyCipher::Ss(suite) => Ok(suite.encrypt_packet(plain)?),
            ProxyCipher::Ssr(ctx) => ctx.encrypt_packet(plain),
        }
    }

    pub fn decrypt_packet(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            ProxyCipher::Ss(suite) => Ok(suite.decrypt_packet(data)?),
            ProxyCipher::Ssr(ctx) => ctx.decrypt_packet(data),
        }
    }

    /// 加密方法名
    pub fn method(&self) -> &'static str {
        match self {
            ProxyCipher::Ss(suite) => suite.method().as_str(),
            ProxyCipher::Ssr(ctx) => ctx.suite().method().as_str(),
        }
    }
}

impl From<CipherSuite> for ProxyCipher {
    fn from(suite: CipherSuite) -> Self {
        ProxyCipher::Ss(suite)
    }
}

impl From<SsrContext> for ProxyCipher {
    fn from(ctx: SsrContext) -> Self {
        ProxyCipher::Ssr(ctx)
    }
}
