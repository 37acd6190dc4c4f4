//! AEAD (Authenticated Encryption with Associated Data) 加密接口
//!
//! 封装 AES-GCM、ChaCha20-Poly1305 与 XChaCha20-Poly1305，统一提供原地 seal/open。

use super::{CipherError, Method};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

/// 认证标签长度
pub const TAG_SIZE: usize = 16;

/// 一个已设置会话密钥的 AEAD 加密器
pub enum AeadCipher {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes192Gcm(Box<Aes192Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

macro_rules! with_cipher {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            AeadCipher::Aes128Gcm($c) => $body,
            AeadCipher::Aes192Gcm($c) => $body,
            AeadCipher::Aes256Gcm($c) => $body,
            AeadCipher::ChaCha20Poly1305($c) => $body,
            AeadCipher::XChaCha20Poly1305($c) => $body,
        }
    };
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCipher")
            .field("nonce_size", &self.nonce_size())
            .finish()
    }
}

impl AeadCipher {
    /// 以会话子密钥创建加密器
    ///
    /// # 参数
    /// * `method` - AEAD 方法
    /// * `key` - 子密钥，长度必须等于方法的密钥长度
    pub fn new(method: Method, key: &[u8]) -> Result<Self, CipherError> {
        if key.len() != method.key_size() {
            return Err(CipherError::InvalidKeyLength {
                method: method.as_str(),
                expect: method.key_size(),
                got: key.len(),
            });
        }
        let invalid = |_| CipherError::InvalidKeyLength {
            method: method.as_str(),
            expect: method.key_size(),
            got: key.len(),
        };
        let cipher = match method {
            Method::Aes128Gcm => AeadCipher::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(invalid)?,
            )),
            Method::Aes192Gcm => AeadCipher::Aes192Gcm(Box::new(
                Aes192Gcm::new_from_slice(key).map_err(invalid)?,
            )),
            Method::Aes256Gcm => AeadCipher::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(invalid)?,
            )),
            Method::Chacha20IetfPoly1305 => AeadCipher::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
            Method::XChacha20IetfPoly1305 => AeadCipher::XChaCha20Poly1305(Box::new(
                XChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
            other => return Err(CipherError::UnsupportedMethod(other.as_str().to_string())),
        };
        Ok(cipher)
    }

    pub fn nonce_size(&self) -> usize {
        match self {
            AeadCipher::XChaCha20Poly1305(_) => 24,
            _ => 12,
        }
    }

    pub fn tag_size(&self) -> usize {
        TAG_SIZE
    }

    fn check_nonce(&self, nonce: &[u8]) -> Result<(), CipherError> {
        if nonce.len() != self.nonce_size() {
            return Err(CipherError::InvalidIvLength {
                expect: self.nonce_size(),
                got: nonce.len(),
            });
        }
        Ok(())
    }

    /// 原地加密
    ///
    /// `buf` 的前 `buf.len() - TAG_SIZE` 字节为明文，末尾预留标签空间。
    pub fn seal_in_place(&self, nonce: &[u8], buf: &mut [u8]) -> Result<(), CipherError> {
        self.check_nonce(nonce)?;
        if buf.len() < TAG_SIZE {
            return Err(CipherError::SealFailed);
        }
        let (data, tag_out) = buf.split_at_mut(buf.len() - TAG_SIZE);
        let tag = with_cipher!(self, c => c
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data)
            .map_err(|_| CipherError::SealFailed)?);
        tag_out.copy_from_slice(&tag);
        Ok(())
    }

    /// 原地解密，返回明文长度
    pub fn open_in_place(&self, nonce: &[u8], buf: &mut [u8]) -> Result<usize, CipherError> {
        self.check_nonce(nonce)?;
        if buf.len() < TAG_SIZE {
            return Err(CipherError::OpenFailed);
        }
        let plain_len = buf.len() - TAG_SIZE;
        let (data, tag) = buf.split_at_mut(plain_len);
        let tag = GenericArray::from_slice(tag);
        with_cipher!(self, c => c
            .decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data, tag)
            .map_err(|_| CipherError::OpenFailed)?);
        Ok(plain_len)
    }

    /// 加密并返回 `密文 || 标签`
    pub fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut buf = vec![0u8; plaintext.len() + TAG_SIZE];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        self.seal_in_place(nonce, &mut buf)?;
        Ok(buf)
    }

    /// 解密 `密文 || 标签`
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut buf = ciphertext.to_vec();
        let n = self.open_in_place(nonce, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{kdf, random_bytes};

    fn aead_methods() -> impl Iterator<Item = Method> {
        Method::ALL.into_iter().filter(|m| m.is_aead())
    }

    #[test]
    fn test_seal_open_round_trip() {
        for method in aead_methods() {
            let master = kdf::evp_bytes_to_key("password", method.key_size());
            let salt = random_bytes(method.salt_size());
            let subkey = kdf::session_subkey(&master, &salt).unwrap();
            let cipher = AeadCipher::new(method, &subkey).unwrap();
            let nonce = vec![0u8; method.nonce_size()];

            let sealed = cipher.seal(&nonce, b"hello world").unwrap();
            assert_eq!(sealed.len(), 11 + TAG_SIZE);
            assert_eq!(cipher.open(&nonce, &sealed).unwrap(), b"hello world");
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = AeadCipher::new(Method::Chacha20IetfPoly1305, &[7u8; 32]).unwrap();
        let nonce = [0u8; 12];
        let mut sealed = cipher.seal(&nonce, b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert!(matches!(
            cipher.open(&nonce, &sealed),
            Err(CipherError::OpenFailed)
        ));
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let cipher = AeadCipher::new(Method::Aes128Gcm, &[1u8; 16]).unwrap();
        let sealed = cipher.seal(&[0u8; 12], b"payload").unwrap();
        let mut other = [0u8; 12];
        other[0] = 1;
        assert!(cipher.open(&other, &sealed).is_err());
        assert!(matches!(
            cipher.open(&[0u8; 24], &sealed),
            Err(CipherError::InvalidIvLength { .. })
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            AeadCipher::new(Method::Aes256Gcm, &[0u8; 16]),
            Err(CipherError::InvalidKeyLength { .. })
        ));
        assert!(matches!(
            AeadCipher::new(Method::Aes128Cfb, &[0u8; 16]),
            Err(CipherError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_xchacha_nonce_size() {
        let cipher = AeadCipher::new(Method::XChacha20IetfPoly1305, &[3u8; 32]).unwrap();
        assert_eq!(cipher.nonce_size(), 24);
        let nonce = [9u8; 24];
        let sealed = cipher.seal(&nonce, b"x").unwrap();
        assert_eq!(cipher.open(&nonce, &sealed).unwrap(), b"x");
    }
}
