//! 流加密
//!
//! 每种流加密都归一为一个原地异或变换。CFB 模式的加解密不对称，
//! 因此构造时需要指明方向。

use super::{random_bytes, CipherError, Method};
use aes::{Aes128, Aes192, Aes256};
use blowfish::Blowfish;
use cfb_mode::cipher::{
    BlockCipher, BlockEncryptMut, InnerIvInit, InvalidLength, KeyInit, KeyIvInit, StreamCipher,
};
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};

/// 变换方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Encrypt,
    Decrypt,
}

type ApplyFn = Box<dyn FnMut(&mut [u8]) + Send>;

/// 一个连接方向上的密钥流状态
pub struct StreamTransform {
    apply: ApplyFn,
}

impl std::fmt::Debug for StreamTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransform").finish_non_exhaustive()
    }
}

impl StreamTransform {
    /// 按方法、密钥和 IV 创建变换
    pub fn new(
        method: Method,
        key: &[u8],
        iv: &[u8],
        direction: StreamDirection,
    ) -> Result<Self, CipherError> {
        if !method.is_stream() {
            return Err(CipherError::UnsupportedMethod(method.as_str().to_string()));
        }
        if key.len() != method.key_size() {
            return Err(CipherError::InvalidKeyLength {
                method: method.as_str(),
                expect: method.key_size(),
                got: key.len(),
            });
        }
        if iv.len() != method.iv_size() {
            return Err(CipherError::InvalidIvLength {
                expect: method.iv_size(),
                got: iv.len(),
            });
        }

        let apply: ApplyFn = match method {
            Method::Aes128Ctr => keystream::<ctr::Ctr128BE<Aes128>>(key, iv)?,
            Method::Aes192Ctr => keystream::<ctr::Ctr128BE<Aes192>>(key, iv)?,
            Method::Aes256Ctr => keystream::<ctr::Ctr128BE<Aes256>>(key, iv)?,
            Method::Aes128Cfb => cfb(Aes128::new_from_slice(key), iv, direction)?,
            Method::Aes192Cfb => cfb(Aes192::new_from_slice(key), iv, direction)?,
            Method::Aes256Cfb => cfb(Aes256::new_from_slice(key), iv, direction)?,
            Method::BfCfb => cfb(<Blowfish as KeyInit>::new_from_slice(key), iv, direction)?,
            Method::Salsa20 => keystream::<salsa20::Salsa20>(key, iv)?,
            Method::Chacha20 => keystream::<chacha20::ChaCha20Legacy>(key, iv)?,
            Method::Chacha20Ietf => keystream::<chacha20::ChaCha20>(key, iv)?,
            Method::Rc4Md5 => {
                let mut hasher = Md5::new();
                hasher.update(key);
                hasher.update(iv);
                let rc4_key = hasher.finalize();
                let mut rc4 = <rc4::Rc4<rc4::consts::U16> as rc4::KeyInit>::new_from_slice(&rc4_key)
                    .map_err(|_| invalid_key(method, key.len()))?;
                Box::new(move |buf: &mut [u8]| rc4::StreamCipher::apply_keystream(&mut rc4, buf))
            }
            _ => return Err(CipherError::UnsupportedMethod(method.as_str().to_string())),
        };
        Ok(Self { apply })
    }

    /// 生成随机 IV 并创建加密方向的变换
    pub fn new_encryptor(method: Method, key: &[u8]) -> Result<(Self, Vec<u8>), CipherError> {
        let iv = random_bytes(method.iv_size());
        let transform = Self::new(method, key, &iv, StreamDirection::Encrypt)?;
        Ok((transform, iv))
    }

    /// 原地变换
    pub fn apply(&mut self, buf: &mut [u8]) {
        (self.apply)(buf)
    }

    /// `dst = src ^ keystream`，`dst` 至少与 `src` 一样长
    pub fn xor_keystream(&mut self, dst: &mut [u8], src: &[u8]) {
        let dst = &mut dst[..src.len()];
        dst.copy_from_slice(src);
        (self.apply)(dst)
    }
}

fn invalid_key(method: Method, got: usize) -> CipherError {
    CipherError::InvalidKeyLength {
        method: method.as_str(),
        expect: method.key_size(),
        got,
    }
}

fn keystream<C>(key: &[u8], iv: &[u8]) -> Result<ApplyFn, CipherError>
where
    C: KeyIvInit + StreamCipher + Send + 'static,
{
    let mut cipher = C::new_from_slices(key, iv).map_err(|_| CipherError::InvalidIvLength {
        expect: iv.len(),
        got: iv.len(),
    })?;
    Ok(Box::new(move |buf: &mut [u8]| cipher.apply_keystream(buf)))
}

/// CFB 模式，分组密码由调用方以密钥初始化
pub(crate) fn cfb<C>(
    block: Result<C, InvalidLength>,
    iv: &[u8],
    direction: StreamDirection,
) -> Result<ApplyFn, CipherError>
where
    C: BlockCipher + BlockEncryptMut + Send + 'static,
{
    let block = block.map_err(|_| CipherError::InvalidKeyLength {
        method: "cfb",
        expect: 0,
        got: 0,
    })?;
    let iv_err = |_: InvalidLength| CipherError::InvalidIvLength {
        expect: C::block_size(),
        got: iv.len(),
    };
    match direction {
        StreamDirection::Encrypt => {
            let mut enc = BufEncryptor::<C>::inner_iv_slice_init(block, iv).map_err(iv_err)?;
            Ok(Box::new(move |buf: &mut [u8]| enc.encrypt(buf)))
        }
        StreamDirection::Decrypt => {
            let mut dec = BufDecryptor::<C>::inner_iv_slice_init(block, iv).map_err(iv_err)?;
            Ok(Box::new(move |buf: &mut [u8]| dec.decrypt(buf)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::evp_bytes_to_key;

    fn round_trip(method: Method) {
        let key = evp_bytes_to_key("12345", method.key_size());
        let iv = random_bytes(method.iv_size());
        let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let mut enc = StreamTransform::new(method, &key, &iv, StreamDirection::Encrypt).unwrap();
        let mut dec = StreamTransform::new(method, &key, &iv, StreamDirection::Decrypt).unwrap();

        // 分多段加密，验证密钥流状态在调用之间延续
        let mut cipher_text = vec![0u8; plain.len()];
        enc.xor_keystream(&mut cipher_text[..333], &plain[..333]);
        enc.xor_keystream(&mut cipher_text[333..], &plain[333..]);
        assert_ne!(cipher_text, plain, "{}", method);

        let mut out = cipher_text.clone();
        dec.apply(&mut out[..17]);
        dec.apply(&mut out[17..]);
        assert_eq!(out, plain, "{}", method);
    }

    #[test]
    fn test_all_stream_ciphers_round_trip() {
        for method in Method::ALL.iter().filter(|m| m.is_stream()) {
            round_trip(*method);
        }
    }

    #[test]
    fn test_aead_method_rejected() {
        let key = vec![0u8; 16];
        assert!(matches!(
            StreamTransform::new(Method::Aes128Gcm, &key, &key, StreamDirection::Encrypt),
            Err(CipherError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            StreamTransform::new(Method::Aes256Cfb, &[0u8; 16], &[0u8; 16], StreamDirection::Encrypt),
            Err(CipherError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_cfb_matches_known_vector() {
        // NIST SP 800-38A F.3.13 CFB128-AES128.Encrypt
        let key = [
            0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf,
            0x4f, 0x3c,
        ];
        let iv: Vec<u8> = (0u8..16).collect();
        let plain = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let expect = [
            0x3b, 0x3f, 0xd9, 0x2e, 0xb7, 0x2d, 0xad, 0x20, 0x33, 0x34, 0x49, 0xf8, 0xe8, 0x3c,
            0xfb, 0x4a,
        ];
        let mut enc = StreamTransform::new(Method::Aes128Cfb, &key, &iv, StreamDirection::Encrypt).unwrap();
        let mut out = plain;
        enc.apply(&mut out);
        assert_eq!(out, expect);
    }
}
