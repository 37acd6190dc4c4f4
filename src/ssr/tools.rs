//! SSR 插件共用的小工具：HMAC、随机字节、xorshift128+

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;

fn hmac<M>(key: &[u8], data: &[u8]) -> Vec<u8>
where
    M: Mac + KeyInit,
{
    match <M as KeyInit>::new_from_slice(key) {
        Ok(mut mac) => {
            Mac::update(&mut mac, data);
            mac.finalize().into_bytes().to_vec()
        }
        // HMAC 接受任意长度的密钥
        Err(_) => Vec::new(),
    }
}

pub fn hmac_md5(key: &[u8], data: &[u8]) -> Vec<u8> {
    hmac::<Hmac<Md5>>(key, data)
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    hmac::<Hmac<Sha1>>(key, data)
}

pub fn md5_sum(data: &[u8]) -> Vec<u8> {
    use md5::Digest;
    Md5::digest(data).to_vec()
}

pub fn sha1_sum(data: &[u8]) -> Vec<u8> {
    use sha1::Digest;
    Sha1::digest(data).to_vec()
}

pub fn append_rand_bytes(buf: &mut Vec<u8>, n: usize) {
    let start = buf.len();
    buf.resize(start + n, 0);
    rand::thread_rng().fill_bytes(&mut buf[start..]);
}

/// xorshift128+ 伪随机数发生器
#[derive(Debug, Default, Clone)]
pub struct XorShift128Plus {
    s: [u64; 2],
}

impl XorShift128Plus {
    pub fn next(&mut self) -> u64 {
        let mut x = self.s[0];
        let y = self.s[1];
        self.s[0] = y;
        x ^= x << 23;
        x ^= y ^ (x >> 17) ^ (y >> 26);
        self.s[1] = x;
        x.wrapping_add(y)
    }

    fn seed(&mut self, full: &[u8; 16]) {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&full[..8]);
        hi.copy_from_slice(&full[8..]);
        self.s = [u64::from_le_bytes(lo), u64::from_le_bytes(hi)];
    }

    pub fn init_from_bin(&mut self, bin: &[u8]) {
        let mut full = [0u8; 16];
        let n = bin.len().min(16);
        full[..n].copy_from_slice(&bin[..n]);
        self.seed(&full);
    }

    pub fn init_from_bin_and_length(&mut self, bin: &[u8], length: usize) {
        let mut full = [0u8; 16];
        let n = bin.len().min(16);
        full[..n].copy_from_slice(&bin[..n]);
        full[..2].copy_from_slice(&(length as u16).to_le_bytes());
        self.seed(&full);
        for _ in 0..4 {
            self.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_lengths() {
        assert_eq!(hmac_md5(b"key", b"data").len(), 16);
        assert_eq!(hmac_sha1(b"key", b"data").len(), 20);
    }

    #[test]
    fn test_hmac_md5_known_vector() {
        // RFC 2202 test case 2
        let mac = hmac_md5(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            mac,
            vec![
                0x75, 0x0c, 0x78, 0x3e, 0x6a, 0xb0, 0xb5, 0x03, 0xea, 0xa8, 0x6e, 0x31, 0x0a,
                0x5d, 0xb7, 0x38
            ]
        );
    }

    #[test]
    fn test_xorshift_deterministic() {
        let mut a = XorShift128Plus::default();
        let mut b = XorShift128Plus::default();
        a.init_from_bin_and_length(b"0123456789abcdef", 100);
        b.init_from_bin_and_length(b"0123456789abcdef", 100);
        for _ in 0..10 {
            assert_eq!(a.next(), b.next());
        }
        let mut c = XorShift128Plus::default();
        c.init_from_bin_and_length(b"0123456789abcdef", 101);
        assert_ne!(a.next(), c.next());
    }
}
