use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 1024;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// 决策缓存：容量受限的 LRU，可选 TTL
///
/// 内部自带锁，多个连接任务可以直接共享同一个实例。
pub struct DecisionCache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
    ttl: Option<Duration>,
}

impl<V: Clone> DecisionCache<V> {
    /// 创建缓存，容量为 0 时使用默认容量
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: None,
        }
    }

    /// 设置条目过期时间
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut cache = self.inner.lock().ok()?;

        let expired = match cache.get(key) {
            Some(entry) => match self.ttl {
                Some(ttl) => entry.inserted_at.elapsed() >= ttl,
                None => false,
            },
            None => return None,
        };

        if expired {
            cache.pop(key);
            return None;
        }

        cache.get(key).map(|entry| entry.value.clone())
    }

    /// 写入条目，同一个 key 后写覆盖先写
    pub fn add(&self, key: &str, value: V) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(
                key.to_string(),
                Entry {
                    value,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
