//! 字节缓冲池
//!
//! 按固定尺寸分类的缓冲池，`PooledBuffer` 在析构时归还。

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

/// TUN 设备 MTU 对应的缓冲大小
pub const MTU_BUFFER_SIZE: usize = 1350;
/// DNS 报文缓冲大小
pub const DNS_BUFFER_SIZE: usize = 4096;
/// 4096 × 2
pub const DOUBLE_BUFFER_SIZE: usize = 8192;
/// TCP 中继缓冲大小
pub const TCP_BUFFER_SIZE: usize = 16 * 1024;
/// TCP 缓冲再加上 AEAD 帧开销（长度字段 + 两个 tag）
pub const AEAD_BUFFER_SIZE: usize = TCP_BUFFER_SIZE + 2 + 16 * 2;
/// UDP 数据报缓冲大小
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

const MAX_IDLE_BUFFERS: usize = 256;

/// 单一尺寸的缓冲池
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            max_idle,
            idle: Mutex::new(Vec::new()),
        })
    }

    /// 池中缓冲的尺寸
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// 取出一个长度为 `size` 的缓冲
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// 归还缓冲：长度重置为池尺寸，内容不清零
    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.size {
            return;
        }
        buf.resize(self.size, 0);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// 从池中借出的缓冲
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        // buf 只在 Drop 中被取走
        self.buf.as_ref().map_or(&EMPTY, |b| b)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.get_or_insert_with(Vec::new)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

static EMPTY: Vec<u8> = Vec::new();

macro_rules! shared_pool {
    ($name:ident, $size:expr) => {
        #[doc = concat!("进程内共享的 ", stringify!($size), " 字节缓冲池")]
        pub fn $name() -> &'static Arc<BufferPool> {
            static POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();
            POOL.get_or_init(|| BufferPool::new($size, MAX_IDLE_BUFFERS))
        }
    };
}

shared_pool!(mtu_pool, MTU_BUFFER_SIZE);
shared_pool!(dns_pool, DNS_BUFFER_SIZE);
shared_pool!(double_pool, DOUBLE_BUFFER_SIZE);
shared_pool!(tcp_pool, TCP_BUFFER_SIZE);
shared_pool!(aead_pool, AEAD_BUFFER_SIZE);
shared_pool!(udp_pool, UDP_BUFFER_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_full_length() {
        let pool = BufferPool::new(64, 4);
        let buf = pool.get();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_put_resets_length_without_zeroing() {
        let pool = BufferPool::new(8, 4);
        {
            let mut buf = pool.get();
            buf[0] = 0xAB;
            buf.truncate(3);
        }
        assert_eq!(pool.idle_count(), 1);
        let buf = pool.get();
        assert_eq!(buf.len(), 8);
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn test_idle_bound() {
        let pool = BufferPool::new(4, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_shared_pools_sizes() {
        assert_eq!(tcp_pool().buffer_size(), 16 * 1024);
        assert_eq!(mtu_pool().buffer_size(), 1350);
        assert_eq!(double_pool().buffer_size(), 8192);
    }
}
