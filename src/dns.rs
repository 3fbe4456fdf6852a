use anyhow::{anyhow, Context, Result};
use log::debug;
use lru::LruCache;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// 带 LRU 缓存的本地 DNS 解析器
pub struct LocalResolver {
    cache: Mutex<LruCache<String, Vec<IpAddr>>>,
    lookup_timeout: Duration,
}

impl LocalResolver {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    /// 解析主机名，IP 字面量直接返回
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        {
            let mut cache = self.cache.lock().await;
            if let Some(ips) = cache.get(host) {
                debug!("DNS 缓存命中: {} -> {:?}", host, ips);
                return Ok(ips.clone());
            }
        }

        debug!("DNS 查询: {}", host);
        let addrs = timeout(self.lookup_timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| anyhow!("DNS 查询超时: {}", host))?
            .with_context(|| format!("DNS 查询失败: {}", host))?;

        let ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        if ips.is_empty() {
            return Err(anyhow!("DNS 查询返回空列表: {}", host));
        }

        self.cache.lock().await.put(host.to_string(), ips.clone());
        Ok(ips)
    }

    /// 解析并返回第一个 IPv4 地址
    pub async fn resolve_v4(&self, host: &str) -> Result<Ipv4Addr> {
        self.resolve(host)
            .await?
            .into_iter()
            .find_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| anyhow!("{} 没有 IPv4 地址", host))
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

impl Default for LocalResolver {
    fn default() -> Self {
        Self::new(1000)
    }
}
