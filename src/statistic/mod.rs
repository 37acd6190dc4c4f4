//! 流量统计
//!
//! `StatisticManager` 记录全局上下行总量、最近一个统计窗口内的速率，
//! 以及所有活跃连接的跟踪信息。TCP 连接通过 [`TcpTracker`] 计数，
//! UDP 通过 [`UdpTracker`] 计数。

pub mod tracker;

pub use tracker::{TcpTracker, UdpTracker};

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// 速率统计窗口
pub const TRAFFIC_SPEED_WINDOW: Duration = Duration::from_secs(2);

/// 一条连接的描述
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TrackerContext {
    /// 客户端地址
    pub src: String,
    /// 目标域名或 IP
    pub dst: String,
    /// `TCP` 或 `UDP`
    pub network: String,
    /// 入站类型，例如 `SOCKS`、`HTTP`、`TUN`
    #[serde(rename = "type")]
    pub kind: String,
    /// 命中的规则类型
    pub rule: String,
    /// 选中的代理
    pub proxy: String,
}

/// 活跃连接的跟踪信息
#[derive(Debug)]
pub struct TrackerInfo {
    pub id: Uuid,
    /// 建立时间（Unix 秒）
    pub start: u64,
    pub context: TrackerContext,
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrackerInfo {
    fn new(context: TrackerContext) -> Self {
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            id: Uuid::new_v4(),
            start,
            context,
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

/// 单条连接的快照
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub start: u64,
    #[serde(flatten)]
    pub context: TrackerContext,
    pub upload: u64,
    pub download: u64,
}

/// 全局快照
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub upload_total: u64,
    pub download_total: u64,
    pub connections: Vec<ConnectionSnapshot>,
}

/// 流量统计管理器
#[derive(Debug, Default)]
pub struct StatisticManager {
    trackers: RwLock<HashMap<Uuid, Arc<TrackerInfo>>>,
    upload_total: Arc<AtomicU64>,
    download_total: Arc<AtomicU64>,
    upload_delta: AtomicU64,
    download_delta: AtomicU64,
    upload_rate: AtomicU64,
    download_rate: AtomicU64,
}

impl StatisticManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 启动速率刷新任务，`token` 取消后退出
    pub fn spawn_ticker(self: &Arc<Self>, token: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TRAFFIC_SPEED_WINDOW);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.tick(),
                }
            }
            debug!("statistic ticker stopped");
        });
    }

    fn tick(&self) {
        let secs = TRAFFIC_SPEED_WINDOW.as_secs().max(1);
        let up = self.upload_delta.swap(0, Ordering::Relaxed);
        let down = self.download_delta.swap(0, Ordering::Relaxed);
        self.upload_rate.store(up / secs, Ordering::Relaxed);
        self.download_rate.store(down / secs, Ordering::Relaxed);
    }

    /// 登记一条连接
    pub fn track(&self, context: TrackerContext) -> Arc<TrackerInfo> {
        let info = Arc::new(TrackerInfo::new(context));
        self.trackers.write().insert(info.id, Arc::clone(&info));
        info
    }

    pub fn remove(&self, id: &Uuid) {
        self.trackers.write().remove(id);
    }

    pub fn add_upload(&self, info: Option<&TrackerInfo>, n: u64) {
        if let Some(info) = info {
            info.upload.fetch_add(n, Ordering::Relaxed);
        }
        self.upload_total.fetch_add(n, Ordering::Relaxed);
        self.upload_delta.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_download(&self, info: Option<&TrackerInfo>, n: u64) {
        if let Some(info) = info {
            info.download.fetch_add(n, Ordering::Relaxed);
        }
        self.download_total.fetch_add(n, Ordering::Relaxed);
        self.download_delta.fetch_add(n, Ordering::Relaxed);
    }

    /// 最近一个窗口的速率 (上行, 下行)，单位字节每秒
    pub fn traffic_speed(&self) -> (u64, u64) {
        (
            self.upload_rate.load(Ordering::Relaxed),
            self.download_rate.load(Ordering::Relaxed),
        )
    }

    /// 累计流量 (上行, 下行)
    pub fn totals(&self) -> (u64, u64) {
        (
            self.upload_total.load(Ordering::Relaxed),
            self.download_total.load(Ordering::Relaxed),
        )
    }

    pub fn connection_count(&self) -> usize {
        self.trackers.read().len()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut connections: Vec<ConnectionSnapshot> = self
            .trackers
            .read()
            .values()
            .map(|info| ConnectionSnapshot {
                id: info.id.to_string(),
                start: info.start,
                context: info.context.clone(),
                upload: info.upload(),
                download: info.download(),
            })
            .collect();
        connections.sort_by_key(|c| c.start);
        let (upload_total, download_total) = self.totals();
        Snapshot {
            upload_total,
            download_total,
            connections,
        }
    }

    /// 清零计数器
    pub fn reset(&self) {
        for counter in [
            &*self.upload_total,
            &*self.download_total,
            &self.upload_delta,
            &self.download_delta,
            &self.upload_rate,
            &self.download_rate,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dst: &str) -> TrackerContext {
        TrackerContext {
            src: "127.0.0.1:5000".into(),
            dst: dst.into(),
            network: "TCP".into(),
            kind: "SOCKS".into(),
            rule: "DOMAIN".into(),
            proxy: "a".into(),
        }
    }

    #[test]
    fn test_track_and_remove() {
        let manager = StatisticManager::new();
        let info = manager.track(ctx("example.com:80"));
        manager.add_upload(Some(&info), 10);
        manager.add_download(Some(&info), 20);
        manager.add_download(None, 5);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.upload_total, 10);
        assert_eq!(snapshot.download_total, 25);
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.connections[0].download, 20);
        assert_eq!(snapshot.connections[0].context.dst, "example.com:80");

        manager.remove(&info.id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.totals(), (10, 25));
    }

    #[test]
    fn test_tick_computes_rate() {
        let manager = StatisticManager::new();
        manager.add_upload(None, 4000);
        manager.add_download(None, 2000);
        manager.tick();
        assert_eq!(manager.traffic_speed(), (2000, 1000));
        manager.tick();
        assert_eq!(manager.traffic_speed(), (0, 0));
    }

    #[test]
    fn test_reset() {
        let manager = StatisticManager::new();
        manager.add_upload(None, 1);
        manager.reset();
        assert_eq!(manager.totals(), (0, 0));
    }
}
