//! FakeIP 地址池
//!
//! 以位图管理网段内可分配的主机地址。网段第一个主机地址保留给 TUN 网卡自身，
//! 其余地址按域名的 adler32 散列选取起点，冲突时线性探测下一个空位。

use super::DnsError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// 池容量上限
pub const MAX_POOL_SIZE: u32 = 0x3FFFF;

#[derive(Debug)]
pub struct FakeIpPool {
    net: Ipv4Net,
    /// 第一个可用主机地址（保留位）
    min: u32,
    /// 最后一个可用主机地址
    max: u32,
    used: Vec<bool>,
    allocated: usize,
}

impl FakeIpPool {
    pub fn new(net: Ipv4Net) -> Result<Self, DnsError> {
        let net = net.trunc();
        let base = u32::from(net.network());
        let last = u32::from(net.broadcast());
        let (min, max) = match net.prefix_len() {
            32 => return Err(DnsError::InvalidMessage(format!("fake ip cidr {} has no host address", net))),
            31 => (base, last),
            _ => (base + 1, last - 1),
        };
        let cap = (max - min + 1).min(MAX_POOL_SIZE);
        if cap < 2 {
            return Err(DnsError::InvalidMessage(format!("fake ip cidr {} is too small", net)));
        }
        let mut used = vec![false; cap as usize];
        used[0] = true;
        Ok(Self {
            net,
            min,
            max: min + cap - 1,
            used,
            allocated: 0,
        })
    }

    pub fn net(&self) -> Ipv4Net {
        self.net
    }

    /// 保留给 TUN 网卡的地址
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.min)
    }

    pub fn ip_min(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.min + 1)
    }

    pub fn ip_max(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.max)
    }

    /// 可分配地址总数（不含保留位）
    pub fn capacity(&self) -> usize {
        self.used.len() - 1
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.allocated
    }

    /// 是否是池中的可分配地址
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let v = u32::from(ip);
        v > self.min && v <= self.max
    }

    /// 为域名分配一个地址
    pub fn alloc(&mut self, host: &str) -> Result<Ipv4Addr, DnsError> {
        if self.allocated >= self.capacity() {
            return Err(DnsError::PoolExhausted);
        }
        let cap = self.capacity();
        let seed = adler::adler32_slice(host.as_bytes()) as usize % cap;
        for step in 0..cap {
            let index = 1 + (seed + step) % cap;
            if !self.used[index] {
                self.used[index] = true;
                self.allocated += 1;
                return Ok(Ipv4Addr::from(self.min + index as u32));
            }
        }
        Err(DnsError::PoolExhausted)
    }

    /// 归还地址，不在池中或未分配的地址忽略
    pub fn release(&mut self, ip: Ipv4Addr) {
        if !self.contains(ip) {
            return;
        }
        let index = (u32::from(ip) - self.min) as usize;
        if self.used[index] {
            self.used[index] = false;
            self.allocated -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> FakeIpPool {
        FakeIpPool::new(cidr.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_bounds() {
        let p = pool("198.18.0.0/16");
        assert_eq!(p.gateway(), Ipv4Addr::new(198, 18, 0, 1));
        assert_eq!(p.ip_min(), Ipv4Addr::new(198, 18, 0, 2));
        assert_eq!(p.ip_max(), Ipv4Addr::new(198, 18, 255, 254));
        assert_eq!(p.capacity(), 65533);
        assert!(!p.contains(Ipv4Addr::new(198, 18, 0, 1)));
        assert!(p.contains(Ipv4Addr::new(198, 18, 0, 2)));
        assert!(!p.contains(Ipv4Addr::new(198, 18, 255, 255)));

        let big = pool("10.0.0.0/8");
        assert_eq!(big.capacity(), MAX_POOL_SIZE as usize - 1);

        assert!(FakeIpPool::new("10.0.0.1/32".parse().unwrap()).is_err());
    }

    #[test]
    fn test_alloc_start_follows_adler32() {
        assert_eq!(adler::adler32_slice(b"Wikipedia"), 0x11E6_0398);
        let mut p = pool("198.18.0.0/16");
        assert_eq!(p.alloc("Wikipedia").unwrap(), Ipv4Addr::new(198, 18, 57, 76));
        // 冲突时取下一个空位
        assert_eq!(p.alloc("Wikipedia").unwrap(), Ipv4Addr::new(198, 18, 57, 77));
    }

    #[test]
    fn test_alloc_in_range_and_distinct() {
        let mut p = pool("198.18.0.0/24");
        let a = p.alloc("www.google.com").unwrap();
        let b = p.alloc("www.google.com").unwrap();
        assert_ne!(a, b);
        assert!(p.contains(a) && p.contains(b));
        assert_eq!(p.available(), p.capacity() - 2);
    }

    #[test]
    fn test_exhaust_and_release() {
        let mut p = pool("10.0.0.0/29");
        // 可用 10.0.0.2 ~ 10.0.0.6
        let mut ips = Vec::new();
        for i in 0..p.capacity() {
            ips.push(p.alloc(&format!("host{}", i)).unwrap());
        }
        assert_eq!(p.alloc("one-more"), Err(DnsError::PoolExhausted));

        p.release(ips[2]);
        assert_eq!(p.alloc("again").unwrap(), ips[2]);

        p.release(Ipv4Addr::new(10, 0, 0, 1));
        p.release(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(p.available(), 0);
    }

    #[test]
    fn test_slash_31() {
        let mut p = pool("10.0.0.0/31");
        assert_eq!(p.gateway(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(p.alloc("a").unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(p.alloc("b").is_err());
    }
}
