//! 加密模块
//!
//! 提供 Shadowsocks 使用的流加密与 AEAD 加密，以及密钥派生。

pub mod aead;
pub mod cipher;
pub mod kdf;
pub mod stream;

pub use aead::AeadCipher;
pub use cipher::CipherSuite;
pub use kdf::{evp_bytes_to_key, hkdf_sha1};
pub use stream::{StreamDirection, StreamTransform};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 加密层错误
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("invalid key length for {method}: expect {expect}, got {got}")]
    InvalidKeyLength {
        method: &'static str,
        expect: usize,
        got: usize,
    },
    #[error("invalid iv/nonce length: expect {expect}, got {got}")]
    InvalidIvLength { expect: usize, got: usize },
    #[error("aead open failed")]
    OpenFailed,
    #[error("aead seal failed")]
    SealFailed,
    #[error("key derivation failed for {len} bytes output")]
    KeyDerivation { len: usize },
}

impl From<CipherError> for std::io::Error {
    fn from(err: CipherError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

/// 加密方法的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    None,
    Stream,
    Aead,
}

/// 支持的加密方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    None,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    BfCfb,
    Rc4Md5,
    Salsa20,
    Chacha20,
    Chacha20Ietf,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    Chacha20IetfPoly1305,
    XChacha20IetfPoly1305,
}

impl Method {
    pub const ALL: [Method; 17] = [
        Method::None,
        Method::Aes128Ctr,
        Method::Aes192Ctr,
        Method::Aes256Ctr,
        Method::Aes128Cfb,
        Method::Aes192Cfb,
        Method::Aes256Cfb,
        Method::BfCfb,
        Method::Rc4Md5,
        Method::Salsa20,
        Method::Chacha20,
        Method::Chacha20Ietf,
        Method::Aes128Gcm,
        Method::Aes192Gcm,
        Method::Aes256Gcm,
        Method::Chacha20IetfPoly1305,
        Method::XChacha20IetfPoly1305,
    ];

    pub fn kind(&self) -> CipherKind {
        match self {
            Method::None => CipherKind::None,
            Method::Aes128Gcm
            | Method::Aes192Gcm
            | Method::Aes256Gcm
            | Method::Chacha20IetfPoly1305
            | Method::XChacha20IetfPoly1305 => CipherKind::Aead,
            _ => CipherKind::Stream,
        }
    }

    pub fn is_aead(&self) -> bool {
        self.kind() == CipherKind::Aead
    }

    pub fn is_stream(&self) -> bool {
        self.kind() == CipherKind::Stream
    }

    /// 获取密钥长度
    pub fn key_size(&self) -> usize {
        match self {
            Method::None => 0,
            Method::Aes128Ctr | Method::Aes128Cfb | Method::Aes128Gcm => 16,
            Method::Aes192Ctr | Method::Aes192Cfb | Method::Aes192Gcm => 24,
            Method::Aes256Ctr | Method::Aes256Cfb | Method::Aes256Gcm => 32,
            Method::BfCfb | Method::Rc4Md5 => 16,
            Method::Salsa20
            | Method::Chacha20
            | Method::Chacha20Ietf
            | Method::Chacha20IetfPoly1305
            | Method::XChacha20IetfPoly1305 => 32,
        }
    }

    /// 流加密的 IV 长度；AEAD 返回盐长度
    pub fn iv_size(&self) -> usize {
        match self {
            Method::None => 0,
            Method::Aes128Ctr
            | Method::Aes192Ctr
            | Method::Aes256Ctr
            | Method::Aes128Cfb
            | Method::Aes192Cfb
            | Method::Aes256Cfb
            | Method::Rc4Md5 => 16,
            Method::BfCfb | Method::Salsa20 | Method::Chacha20 => 8,
            Method::Chacha20Ietf => 12,
            aead => aead.salt_size(),
        }
    }

    /// AEAD 盐长度，与密钥长度相同
    pub fn salt_size(&self) -> usize {
        if self.is_aead() {
            self.key_size()
        } else {
            0
        }
    }

    /// AEAD 随机数长度
    pub fn nonce_size(&self) -> usize {
        match self {
            Method::XChacha20IetfPoly1305 => 24,
            m if m.is_aead() => 12,
            _ => 0,
        }
    }

    /// AEAD 认证标签长度
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::BfCfb => "bf-cfb",
            Method::Rc4Md5 => "rc4-md5",
            Method::Salsa20 => "salsa20",
            Method::Chacha20 => "chacha20",
            Method::Chacha20Ietf => "chacha20-ietf",
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Method::XChacha20IetfPoly1305 => "xchacha20-ietf-poly1305",
        }
    }
}

impl FromStr for Method {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower.is_empty() || lower == "plain" {
            return Ok(Method::None);
        }
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| CipherError::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 以小端序递增随机数计数器
pub fn increment_nonce(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            break;
        }
    }
}

/// 生成随机字节
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_str() {
        assert_eq!("aes-128-gcm".parse::<Method>().unwrap(), Method::Aes128Gcm);
        assert_eq!("AES-256-CFB".parse::<Method>().unwrap(), Method::Aes256Cfb);
        assert_eq!(
            "xchacha20-ietf-poly1305".parse::<Method>().unwrap(),
            Method::XChacha20IetfPoly1305
        );
        assert_eq!("none".parse::<Method>().unwrap(), Method::None);
        assert!(matches!(
            "des-cfb".parse::<Method>(),
            Err(CipherError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_method_sizes() {
        assert_eq!(Method::Aes192Gcm.salt_size(), 24);
        assert_eq!(Method::Chacha20IetfPoly1305.salt_size(), 32);
        assert_eq!(Method::XChacha20IetfPoly1305.nonce_size(), 24);
        assert_eq!(Method::Aes128Gcm.nonce_size(), 12);
        assert_eq!(Method::Salsa20.iv_size(), 8);
        assert_eq!(Method::Chacha20Ietf.iv_size(), 12);
        assert_eq!(Method::BfCfb.iv_size(), 8);
        assert_eq!(Method::Rc4Md5.key_size(), 16);
    }

    #[test]
    fn test_method_names_round_trip() {
        for m in Method::ALL {
            assert_eq!(m.as_str().parse::<Method>().unwrap(), m);
        }
    }

    #[test]
    fn test_increment_nonce_little_endian() {
        let mut nonce = vec![0u8; 12];
        increment_nonce(&mut nonce);
        assert_eq!(nonce[0], 1);

        let mut nonce = vec![0xff, 0xff, 0x00];
        increment_nonce(&mut nonce);
        assert_eq!(nonce, vec![0x00, 0x00, 0x01]);

        let mut nonce = vec![0xffu8; 4];
        increment_nonce(&mut nonce);
        assert_eq!(nonce, vec![0u8; 4]);
    }

    #[test]
    fn test_random_bytes() {
        let a = random_bytes(16);
        let b = random_bytes(16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
