//! 密钥派生
//!
//! - 密码到主密钥：OpenSSL `EVP_BytesToKey`（MD5 链，无盐，迭代 1 次）
//! - AEAD 会话子密钥：HKDF-SHA1(master, salt, "ss-subkey")
//! - KCP 块加密密钥：PBKDF2-HMAC-SHA1

use super::CipherError;
use md5::{Digest, Md5};
use ring::{hkdf, pbkdf2};
use std::num::NonZeroU32;

/// AEAD 子密钥派生使用的 info
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// 以 MD5 链从密码派生指定长度的密钥
pub fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-SHA1，输出长度与 `out` 相同，最长 255 * 20 字节
pub fn hkdf_sha1(key: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CipherError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA1_FOR_LEGACY_USE_ONLY, salt).extract(key);
    let info = [info];
    let len = out.len();
    let failed = move || CipherError::KeyDerivation { len };
    let okm = prk.expand(&info, OkmLen(len)).map_err(|_| failed())?;
    okm.fill(out).map_err(|_| failed())
}

/// 为每个连接/数据报的盐派生子密钥
pub fn session_subkey(master: &[u8], salt: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut subkey = vec![0u8; master.len()];
    hkdf_sha1(master, salt, SUBKEY_INFO, &mut subkey)?;
    Ok(subkey)
}

/// PBKDF2-HMAC-SHA1
pub fn pbkdf2_sha1(secret: &[u8], salt: &[u8], iterations: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    let iterations = NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN);
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA1, iterations, salt, secret, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evp_bytes_to_key_matches_openssl() {
        // openssl enc -aes-128-cfb -k foobar -nosalt -P
        let key = evp_bytes_to_key("foobar", 16);
        assert_eq!(
            key,
            vec![
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43,
                0x12, 0xc6, 0x3f
            ]
        );
    }

    #[test]
    fn test_evp_bytes_to_key_long_key() {
        let short = evp_bytes_to_key("12345", 16);
        let long = evp_bytes_to_key("12345", 32);
        assert_eq!(long.len(), 32);
        assert_eq!(&long[..16], &short[..]);
    }

    #[test]
    fn test_session_subkey_depends_on_salt() {
        let master = evp_bytes_to_key("secret", 32);
        let a = session_subkey(&master, &[1u8; 32]).unwrap();
        let b = session_subkey(&master, &[2u8; 32]).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, session_subkey(&master, &[1u8; 32]).unwrap());
    }

    #[test]
    fn test_hkdf_output_too_long() {
        let mut ok = vec![0u8; 255 * 20];
        assert!(hkdf_sha1(b"key", b"salt", SUBKEY_INFO, &mut ok).is_ok());

        let mut out = vec![0u8; 255 * 20 + 1];
        let err = hkdf_sha1(b"key", b"salt", SUBKEY_INFO, &mut out).unwrap_err();
        assert!(matches!(err, CipherError::KeyDerivation { len } if len == 255 * 20 + 1));
        let err: std::io::Error = err.into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        let master = vec![7u8; 255 * 20 + 1];
        assert!(session_subkey(&master, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_pbkdf2_length() {
        let key = pbkdf2_sha1(b"it's a secret", b"mini-ss", 4096, 32);
        assert_eq!(key.len(), 32);
        assert_ne!(key, vec![0u8; 32]);
    }
}
