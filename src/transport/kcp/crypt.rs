//! KCP 数据包加密
//!
//! 与 kcp-go 的线路格式一致：每个包以 16 字节随机 nonce 和 4 字节 CRC32（小端）开头，
//! CRC 覆盖头部之后的全部字节，然后对整个包做块加密。
//! 分组密码使用带固定 IV 的 CFB 模式；salsa20 以前 8 字节为 nonce 加密其余部分；
//! xor 用 PBKDF2 派生出的 1500 字节密钥表异或。

use crate::crypto::kdf::pbkdf2_sha1;
use crate::crypto::stream::cfb;
use crate::crypto::{random_bytes, CipherError, StreamDirection};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::KeyInit;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use std::fmt;
use std::str::FromStr;

pub const NONCE_SIZE: usize = 16;
pub const CRC_SIZE: usize = 4;
/// 加密头长度
pub const CRYPT_HEADER_SIZE: usize = NONCE_SIZE + CRC_SIZE;

/// KCP 密钥派生使用的盐
pub const KEY_SALT: &[u8] = b"mini-ss";
const KEY_ITERATIONS: u32 = 4096;
const XOR_SALT: &[u8] = b"sH3CIVoF#rWLtJo6";
const XOR_TABLE_SIZE: usize = 1500;

const INITIAL_VECTOR: [u8; 16] = [
    167, 115, 79, 156, 18, 172, 27, 1, 164, 21, 242, 193, 252, 120, 230, 107,
];

/// 块加密算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptKind {
    None,
    Xor,
    Aes128,
    Aes192,
    Aes256,
    Blowfish,
    Twofish,
    Cast5,
    TripleDes,
    Sm4,
    Salsa20,
}

impl FromStr for CryptKind {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "none" => CryptKind::None,
            "xor" => CryptKind::Xor,
            "aes-128" => CryptKind::Aes128,
            "aes-192" => CryptKind::Aes192,
            "aes" | "aes-256" => CryptKind::Aes256,
            "blowfish" => CryptKind::Blowfish,
            "twofish" => CryptKind::Twofish,
            "cast5" => CryptKind::Cast5,
            "3des" => CryptKind::TripleDes,
            "sm4" => CryptKind::Sm4,
            "salsa20" => CryptKind::Salsa20,
            other => return Err(CipherError::UnsupportedMethod(format!("kcp crypt {}", other))),
        })
    }
}

impl fmt::Display for CryptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CryptKind::None => "none",
            CryptKind::Xor => "xor",
            CryptKind::Aes128 => "aes-128",
            CryptKind::Aes192 => "aes-192",
            CryptKind::Aes256 => "aes-256",
            CryptKind::Blowfish => "blowfish",
            CryptKind::Twofish => "twofish",
            CryptKind::Cast5 => "cast5",
            CryptKind::TripleDes => "3des",
            CryptKind::Sm4 => "sm4",
            CryptKind::Salsa20 => "salsa20",
        };
        f.write_str(name)
    }
}

/// 一个 KCP 会话使用的块加密
#[derive(Clone)]
pub struct BlockCrypt {
    kind: CryptKind,
    key: Vec<u8>,
}

impl fmt::Debug for BlockCrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCrypt").field("kind", &self.kind).finish()
    }
}

impl BlockCrypt {
    /// 从配置的密钥字符串创建
    pub fn new(kind: CryptKind, key: &str) -> Self {
        let pass = pbkdf2_sha1(key.as_bytes(), KEY_SALT, KEY_ITERATIONS, 32);
        let key = match kind {
            CryptKind::None => Vec::new(),
            CryptKind::Xor => pbkdf2_sha1(&pass, XOR_SALT, 32, XOR_TABLE_SIZE),
            CryptKind::Aes128 | CryptKind::Cast5 | CryptKind::Sm4 => pass[..16].to_vec(),
            CryptKind::Aes192 | CryptKind::TripleDes => pass[..24].to_vec(),
            CryptKind::Aes256 | CryptKind::Blowfish | CryptKind::Twofish | CryptKind::Salsa20 => pass,
        };
        Self { kind, key }
    }

    pub fn kind(&self) -> CryptKind {
        self.kind
    }

    /// 填充头部并加密，`packet` 的前 `CRYPT_HEADER_SIZE` 字节为预留的头部
    pub fn seal(&self, packet: &mut [u8]) -> Result<(), CipherError> {
        packet[..NONCE_SIZE].copy_from_slice(&random_bytes(NONCE_SIZE));
        let checksum = crc32fast::hash(&packet[CRYPT_HEADER_SIZE..]);
        packet[NONCE_SIZE..CRYPT_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
        self.transform(packet, StreamDirection::Encrypt)
    }

    /// 解密并校验，返回头部之后的载荷；校验失败返回 `None`
    pub fn open<'a>(&self, packet: &'a mut [u8]) -> Result<Option<&'a [u8]>, CipherError> {
        if packet.len() < CRYPT_HEADER_SIZE {
            return Ok(None);
        }
        self.transform(packet, StreamDirection::Decrypt)?;
        let mut crc = [0u8; CRC_SIZE];
        crc.copy_from_slice(&packet[NONCE_SIZE..CRYPT_HEADER_SIZE]);
        let payload = &packet[CRYPT_HEADER_SIZE..];
        if crc32fast::hash(payload) != u32::from_le_bytes(crc) {
            return Ok(None);
        }
        Ok(Some(payload))
    }

    fn transform(&self, buf: &mut [u8], direction: StreamDirection) -> Result<(), CipherError> {
        let key = &self.key;
        let mut apply = match self.kind {
            CryptKind::None => return Ok(()),
            CryptKind::Xor => {
                for (b, k) in buf.iter_mut().zip(self.key.iter()) {
                    *b ^= k;
                }
                return Ok(());
            }
            CryptKind::Salsa20 => {
                if buf.len() <= 8 {
                    return Ok(());
                }
                let (nonce, data) = buf.split_at_mut(8);
                let mut cipher = salsa20::Salsa20::new_from_slices(key, nonce).map_err(|_| {
                    CipherError::InvalidKeyLength {
                        method: "salsa20",
                        expect: 32,
                        got: key.len(),
                    }
                })?;
                cipher.apply_keystream(data);
                return Ok(());
            }
            CryptKind::Aes128 => cfb(Aes128::new_from_slice(key), &INITIAL_VECTOR, direction)?,
            CryptKind::Aes192 => cfb(Aes192::new_from_slice(key), &INITIAL_VECTOR, direction)?,
            CryptKind::Aes256 => cfb(Aes256::new_from_slice(key), &INITIAL_VECTOR, direction)?,
            CryptKind::Sm4 => cfb(sm4::Sm4::new_from_slice(key), &INITIAL_VECTOR, direction)?,
            CryptKind::Twofish => {
                cfb(twofish::Twofish::new_from_slice(key), &INITIAL_VECTOR, direction)?
            }
            CryptKind::Blowfish => cfb(
                <blowfish::Blowfish as KeyInit>::new_from_slice(key),
                &INITIAL_VECTOR[..8],
                direction,
            )?,
            CryptKind::Cast5 => cfb(cast5::Cast5::new_from_slice(key), &INITIAL_VECTOR[..8], direction)?,
            CryptKind::TripleDes => {
                cfb(des::TdesEde3::new_from_slice(key), &INITIAL_VECTOR[..8], direction)?
            }
        };
        apply(buf);
        Ok(())
    }
}
