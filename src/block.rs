use log::error;
use std::sync::Arc;

use crate::cache::DecisionCache;
use crate::rule::{split_host_port, RuleCode, RuleMatcher};

/// 服务端拦截检查
///
/// 未配置规则匹配器时功能关闭，一律放行。结论按主机名缓存，没有全局代理的概念。
pub struct BlockChecker {
    matcher: Option<Arc<dyn RuleMatcher>>,
    cache: DecisionCache<bool>,
}

impl BlockChecker {
    pub fn new(matcher: Option<Arc<dyn RuleMatcher>>, cache_size: usize) -> Self {
        Self {
            matcher,
            cache: DecisionCache::new(cache_size),
        }
    }

    /// 关闭拦截检查
    pub fn disabled() -> Self {
        Self::new(None, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.matcher.is_some()
    }

    pub async fn is_blocked(&self, host_port: &str) -> bool {
        let Some(matcher) = &self.matcher else {
            return false;
        };

        let (host, _) = split_host_port(host_port);
        if let Some(blocked) = self.cache.get(host) {
            return blocked;
        }

        let check = matcher.check(host, true).await;
        if let Some(e) = &check.error {
            error!("ACL 检查 {} 出错: {:#}", host, e);
        }

        let blocked = check.code == RuleCode::Block;
        self.cache.add(host, blocked);
        blocked
    }

    pub fn cache(&self) -> &DecisionCache<bool> {
        &self.cache
    }
}
