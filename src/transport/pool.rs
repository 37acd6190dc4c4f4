//! 会话连接池
//!
//! KCP、QUIC、gRPC、SSH 这类可以在一条会话上打开多条子流的传输，
//! 各自持有一个固定槽位数的池。槽位按轮询选取，空槽或已关闭的会话在使用时重新拨号。
//! 每个槽位由一把异步锁保护，同一槽位同一时刻最多只有一个拨号在进行，
//! 并发调用方等待这次拨号的结果；拨号失败时下一个等待者会重新拨号。
//! 轮询位置只在子流成功打开后才前进，拨号或打开失败时下一次调用仍落在同一槽位。

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// 默认槽位数
pub const DEFAULT_POOL_SIZE: usize = 3;

/// 可以放入连接池的会话
pub trait PoolSession: Clone + Send + Sync + 'static {
    /// 会话是否已不可用
    fn is_closed(&self) -> bool;

    /// 关闭会话，其上的子流随之结束
    fn close(&self);
}

pub struct ConnPool<T> {
    slots: Vec<Mutex<Option<T>>>,
    next: AtomicUsize,
}

impl<T: PoolSession> ConnPool<T> {
    /// 创建连接池，`size` 为 0 时使用默认槽位数
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// 当前轮询位置
    pub fn current_index(&self) -> usize {
        self.next.load(Ordering::Relaxed) % self.slots.len()
    }

    /// 槽位 `index` 成功使用后把轮询位置移到下一个槽位
    fn advance(&self, index: usize) {
        let next = (index + 1) % self.slots.len();
        let _ = self
            .next
            .compare_exchange(index, next, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// 在当前槽位的会话上打开一条子流
    ///
    /// 打开失败时关闭该会话、重新拨号并再试一次；成功后轮询位置前进。
    pub async fn open<D, DFut, O, OFut, S>(&self, dial: D, open: O) -> io::Result<S>
    where
        D: Fn() -> DFut,
        DFut: Future<Output = io::Result<T>>,
        O: Fn(T) -> OFut,
        OFut: Future<Output = io::Result<S>>,
    {
        let index = self.current_index();
        let session = self.get_or_dial(index, &dial).await?;
        let stream = match open(session).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(slot = index, "open stream failed: {}, redialing", e);
                self.invalidate(index).await;
                let session = self.get_or_dial(index, &dial).await?;
                open(session).await?
            }
        };
        self.advance(index);
        Ok(stream)
    }

    /// 获取槽位上的会话，必要时调用 `dial` 建立新会话
    pub async fn get_or_dial<F, Fut>(&self, index: usize, dial: F) -> io::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut slot = self.slots[index % self.slots.len()].lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!(slot = index, "pooled session closed, redialing");
            session.close();
        }
        *slot = None;
        let session = dial().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// 关闭并清空一个槽位
    pub async fn invalidate(&self, index: usize) {
        let mut slot = self.slots[index % self.slots.len()].lock().await;
        if let Some(session) = slot.take() {
            session.close();
        }
    }

    /// 关闭全部会话
    pub async fn close_all(&self) {
        for index in 0..self.slots.len() {
            self.invalidate(index).await;
        }
    }
}
