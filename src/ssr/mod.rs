//! ShadowsocksR 封装
//!
//! 发送方向：明文 → 协议插件 → 流加密 → 混淆插件 → 线路，接收方向相反。
//! 只支持流加密；UDP 只经过协议插件。

pub mod obfs;
pub mod protocol;
pub mod tools;

pub use obfs::{ObfsConn, ObfsContext, ObfsKind};
pub use protocol::{ProtocolConn, ProtocolContext, ProtocolKind};

use crate::conn::StreamConn;
use crate::crypto::{CipherKind, CipherSuite};
use crate::protocol::{AsyncReadWrite, BoxStream};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;

/// SSR 插件配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SsrConfig {
    #[serde(default)]
    pub obfs: String,
    #[serde(default)]
    pub obfs_param: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub protocol_param: String,
}

/// 一个 SSR 代理的共享状态
#[derive(Debug, Clone)]
pub struct SsrContext {
    suite: CipherSuite,
    obfs: Arc<ObfsContext>,
    protocol: Arc<ProtocolContext>,
}

impl SsrContext {
    /// 创建 SSR 上下文
    ///
    /// # 参数
    /// * `suite` - 流加密套件
    /// * `host` / `port` - 服务器地址，混淆参数为空时用作伪装主机
    /// * `config` - 插件配置
    pub fn new(suite: CipherSuite, host: &str, port: u16, config: &SsrConfig) -> io::Result<Self> {
        if suite.kind() != CipherKind::Stream {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("ssr requires a stream cipher, got {}", suite.method()),
            ));
        }
        let obfs_kind: ObfsKind = config.obfs.parse()?;
        let protocol_kind: ProtocolKind = config.protocol.parse()?;
        let iv_size = suite.method().iv_size();
        let obfs = Arc::new(ObfsContext::new(
            obfs_kind,
            host,
            port,
            &config.obfs_param,
            suite.key(),
            iv_size,
        ));
        let protocol = Arc::new(ProtocolContext::new(
            protocol_kind,
            suite.key(),
            obfs_kind.overhead(),
            &config.protocol_param,
        ));
        Ok(Self {
            suite,
            obfs,
            protocol,
        })
    }

    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    /// 按 混淆 → 流加密 → 协议 的顺序包装底层连接
    pub fn wrap_stream<S>(&self, stream: S) -> io::Result<BoxStream>
    where
        S: AsyncReadWrite + 'static,
    {
        let obfs = ObfsConn::new(stream, self.obfs.clone());
        let mut cipher = StreamConn::new(obfs, self.suite.clone());
        let iv = cipher.obtain_write_iv()?;
        let session = self.protocol.new_session(iv);
        Ok(Box::new(ProtocolConn::new(cipher, session)))
    }

    /// 封装一个发往服务端的数据报
    pub fn encrypt_packet(&self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let encoded = self.protocol.encode_packet(plain);
        Ok(self.suite.encrypt_packet(&encoded)?)
    }

    /// 解开服务端返回的数据报
    pub fn decrypt_packet(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let plain = self.suite.decrypt_packet(data)?;
        self.protocol.decode_packet(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(obfs: &str, protocol: &str) -> SsrConfig {
        SsrConfig {
            obfs: obfs.to_string(),
            obfs_param: String::new(),
            protocol: protocol.to_string(),
            protocol_param: String::new(),
        }
    }

    #[test]
    fn test_rejects_aead_cipher() {
        let suite = CipherSuite::new("aes-128-gcm", "pw").unwrap();
        assert!(SsrContext::new(suite, "1.1.1.1", 443, &config("plain", "origin")).is_err());
    }

    #[test]
    fn test_rejects_unknown_plugin() {
        let suite = CipherSuite::new("aes-256-cfb", "pw").unwrap();
        assert!(SsrContext::new(suite.clone(), "h", 1, &config("nope", "origin")).is_err());
        assert!(SsrContext::new(suite, "h", 1, &config("plain", "nope")).is_err());
    }

    #[tokio::test]
    async fn test_plain_origin_matches_stream_cipher() {
        let suite = CipherSuite::new("aes-128-cfb", "12345").unwrap();
        let ssr = SsrContext::new(suite.clone(), "127.0.0.1", 8388, &config("plain", "origin")).unwrap();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = ssr.wrap_stream(a).unwrap();
        let mut server = StreamConn::new(b, suite);

        client.write_all(b"\x03\x0bexample.com\x00\x50").await.unwrap();
        client.flush().await.unwrap();
        let mut got = [0u8; 15];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"\x03\x0bexample.com\x00\x50");

        server.write_all(b"pong").await.unwrap();
        let mut back = [0u8; 4];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"pong");
    }

    #[test]
    fn test_origin_packet_round_trip() {
        let suite = CipherSuite::new("chacha20-ietf", "pw").unwrap();
        let ssr = SsrContext::new(suite, "h", 1, &config("plain", "origin")).unwrap();
        let sealed = ssr.encrypt_packet(b"datagram").unwrap();
        assert_eq!(ssr.decrypt_packet(&sealed).unwrap(), b"datagram");
    }
}
