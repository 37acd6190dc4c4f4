//! 加密套件
//!
//! `CipherSuite` 持有方法与主密钥，负责给字节流套上加密层，以及加解密单个数据报。

use super::aead::TAG_SIZE;
use super::{evp_bytes_to_key, kdf, random_bytes, AeadCipher, CipherError, CipherKind, Method};
use super::{StreamDirection, StreamTransform};
use crate::conn::{AeadConn, StreamConn};
use crate::protocol::traits::{AsyncReadWrite, BoxStream};
use std::sync::Arc;

/// 加密套件：方法 + 由密码派生的主密钥
#[derive(Clone)]
pub struct CipherSuite {
    method: Method,
    key: Arc<[u8]>,
}

impl std::fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherSuite")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl CipherSuite {
    /// 创建加密套件
    ///
    /// # 参数
    /// * `method` - 加密方法名称，如 `aes-128-gcm`
    /// * `password` - 密码
    pub fn new(method: &str, password: &str) -> Result<Self, CipherError> {
        let method: Method = method.parse()?;
        let key = evp_bytes_to_key(password, method.key_size());
        Ok(Self {
            method,
            key: key.into(),
        })
    }

    /// 由已派生的主密钥创建
    pub fn from_key(method: Method, key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != method.key_size() {
            return Err(CipherError::InvalidKeyLength {
                method: method.as_str(),
                expect: method.key_size(),
                got: key.len(),
            });
        }
        Ok(Self {
            method,
            key: key.into(),
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn kind(&self) -> CipherKind {
        self.method.kind()
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// 给字节流套上本套件的加密层；`none` 时原样返回
    pub fn wrap_stream<S>(&self, stream: S) -> BoxStream
    where
        S: AsyncReadWrite + 'static,
    {
        match self.kind() {
            CipherKind::None => Box::new(stream),
            CipherKind::Stream => Box::new(StreamConn::new(stream, self.clone())),
            CipherKind::Aead => Box::new(AeadConn::new(stream, self.clone())),
        }
    }

    /// 以盐派生会话子密钥并创建 AEAD 加密器
    pub fn aead_for_salt(&self, salt: &[u8]) -> Result<AeadCipher, CipherError> {
        let subkey = kdf::session_subkey(&self.key, salt)?;
        AeadCipher::new(self.method, &subkey)
    }

    /// 以 IV 创建流加密变换
    pub fn stream_for_iv(
        &self,
        iv: &[u8],
        direction: StreamDirection,
    ) -> Result<StreamTransform, CipherError> {
        StreamTransform::new(self.method, &self.key, iv, direction)
    }

    /// 加密单个数据报
    ///
    /// - 流加密：`iv || xor(plain)`
    /// - AEAD：`salt || seal(zero_nonce, plain)`
    pub fn encrypt_packet(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self.kind() {
            CipherKind::None => Ok(plain.to_vec()),
            CipherKind::Stream => {
                let iv_size = self.method.iv_size();
                let iv = random_bytes(iv_size);
                let mut transform = self.stream_for_iv(&iv, StreamDirection::Encrypt)?;
                let mut out = vec![0u8; iv_size + plain.len()];
                out[..iv_size].copy_from_slice(&iv);
                transform.xor_keystream(&mut out[iv_size..], plain);
                Ok(out)
            }
            CipherKind::Aead => {
                let salt_size = self.method.salt_size();
                let salt = random_bytes(salt_size);
                let cipher = self.aead_for_salt(&salt)?;
                let nonce = vec![0u8; cipher.nonce_size()];
                let mut out = vec![0u8; salt_size + plain.len() + TAG_SIZE];
                out[..salt_size].copy_from_slice(&salt);
                out[salt_size..salt_size + plain.len()].copy_from_slice(plain);
                cipher.seal_in_place(&nonce, &mut out[salt_size..])?;
                Ok(out)
            }
        }
    }

    /// 解密单个数据报
    pub fn decrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self.kind() {
            CipherKind::None => Ok(data.to_vec()),
            CipherKind::Stream => {
                let iv_size = self.method.iv_size();
                if data.len() < iv_size {
                    return Err(CipherError::InvalidIvLength {
                        expect: iv_size,
                        got: data.len(),
                    });
                }
                let (iv, body) = data.split_at(iv_size);
                let mut transform = self.stream_for_iv(iv, StreamDirection::Decrypt)?;
                let mut out = vec![0u8; body.len()];
                transform.xor_keystream(&mut out, body);
                Ok(out)
            }
            CipherKind::Aead => {
                let salt_size = self.method.salt_size();
                if data.len() < salt_size + TAG_SIZE {
                    return Err(CipherError::OpenFailed);
                }
                let (salt, body) = data.split_at(salt_size);
                let cipher = self.aead_for_salt(salt)?;
                let nonce = vec![0u8; cipher.nonce_size()];
                cipher.open(&nonce, body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_round_trip_all_methods() {
        for method in Method::ALL {
            let suite = CipherSuite::new(method.as_str(), "12345").unwrap();
            let plain = b"\x01\x01\x01\x01\x01\x00\x35dns-query";
            let sealed = suite.encrypt_packet(plain).unwrap();
            let overhead = match method.kind() {
                CipherKind::None => 0,
                CipherKind::Stream => method.iv_size(),
                CipherKind::Aead => method.salt_size() + TAG_SIZE,
            };
            assert_eq!(sealed.len(), plain.len() + overhead, "{}", method);
            assert_eq!(suite.decrypt_packet(&sealed).unwrap(), plain, "{}", method);
        }
    }

    #[test]
    fn test_packets_use_fresh_salt() {
        let suite = CipherSuite::new("chacha20-ietf-poly1305", "secret").unwrap();
        let a = suite.encrypt_packet(b"same").unwrap();
        let b = suite.encrypt_packet(b"same").unwrap();
        assert_ne!(a[..32], b[..32]);
    }

    #[test]
    fn test_wrong_password_fails_to_open() {
        let a = CipherSuite::new("aes-256-gcm", "right").unwrap();
        let b = CipherSuite::new("aes-256-gcm", "wrong").unwrap();
        let sealed = a.encrypt_packet(b"payload").unwrap();
        assert!(matches!(b.decrypt_packet(&sealed), Err(CipherError::OpenFailed)));
    }

    #[test]
    fn test_truncated_packet() {
        let suite = CipherSuite::new("aes-128-gcm", "p").unwrap();
        assert!(suite.decrypt_packet(&[0u8; 20]).is_err());
        let suite = CipherSuite::new("aes-128-cfb", "p").unwrap();
        assert!(suite.decrypt_packet(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_unsupported_method() {
        assert!(matches!(
            CipherSuite::new("idea-cfb", "p"),
            Err(CipherError::UnsupportedMethod(_))
        ));
    }
}
