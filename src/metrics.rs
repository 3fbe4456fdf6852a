use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::router::Outcome;

/// 路由决策统计
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 决策统计
    proxy_decisions: AtomicU64,
    pass_decisions: AtomicU64,
    block_decisions: AtomicU64,

    // 缓存统计
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    // 远程解析统计
    remote_lookups: AtomicU64,
    remote_timeouts: AtomicU64,
    remote_failures: AtomicU64,

    // 服务端
    resolve_requests: AtomicU64,
    blocked_requests: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                proxy_decisions: AtomicU64::new(0),
                pass_decisions: AtomicU64::new(0),
                block_decisions: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                remote_lookups: AtomicU64::new(0),
                remote_timeouts: AtomicU64::new(0),
                remote_failures: AtomicU64::new(0),
                resolve_requests: AtomicU64::new(0),
                blocked_requests: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Proxy => &self.inner.proxy_decisions,
            Outcome::Pass => &self.inner.pass_decisions,
            Outcome::Block => &self.inner.block_decisions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_remote_lookups(&self) {
        self.inner.remote_lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_remote_timeouts(&self) {
        self.inner.remote_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_remote_failures(&self) {
        self.inner.remote_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resolve_requests(&self) {
        self.inner.resolve_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_requests(&self) {
        self.inner.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            proxy_decisions: self.inner.proxy_decisions.load(Ordering::Relaxed),
            pass_decisions: self.inner.pass_decisions.load(Ordering::Relaxed),
            block_decisions: self.inner.block_decisions.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            remote_lookups: self.inner.remote_lookups.load(Ordering::Relaxed),
            remote_timeouts: self.inner.remote_timeouts.load(Ordering::Relaxed),
            remote_failures: self.inner.remote_failures.load(Ordering::Relaxed),
            resolve_requests: self.inner.resolve_requests.load(Ordering::Relaxed),
            blocked_requests: self.inner.blocked_requests.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印统计
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 路由决策统计 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!(
            "决策: 代理 {} | 直连 {} | 拦截 {}",
            snapshot.proxy_decisions,
            snapshot.pass_decisions,
            snapshot.block_decisions
        );
        log::info!("缓存命中: {} | 未命中: {}", snapshot.cache_hits, snapshot.cache_misses);

        if let Some(hit_rate) = snapshot.cache_hit_rate() {
            log::info!("缓存命中率: {:.2}%", hit_rate);
        }

        log::info!(
            "远程解析: {} 次 | 超时 {} | 失败 {}",
            snapshot.remote_lookups,
            snapshot.remote_timeouts,
            snapshot.remote_failures
        );

        if snapshot.resolve_requests > 0 {
            log::info!(
                "服务端解析请求: {} | 拦截: {}",
                snapshot.resolve_requests,
                snapshot.blocked_requests
            );
        }
    }
}

/// 统计快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub proxy_decisions: u64,
    pub pass_decisions: u64,
    pub block_decisions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub remote_lookups: u64,
    pub remote_timeouts: u64,
    pub remote_failures: u64,
    pub resolve_requests: u64,
    pub blocked_requests: u64,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        (total > 0).then(|| self.cache_hits as f64 / total as f64 * 100.0)
    }
}
