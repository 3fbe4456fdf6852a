use async_trait::async_trait;
use log::info;
use std::net::IpAddr;
use std::sync::Arc;

use crate::config::AclConfig;
use crate::dns::LocalResolver;
use crate::domain::DomainMatcher;
use crate::ip_matcher::{is_private_v4, IpMatcher};
use crate::rule::{RuleCheck, RuleCode, RuleMatcher};

/// 一组混合了域名与 IP 的规则
#[derive(Debug, Clone, Default)]
struct RuleList {
    domains: DomainMatcher,
    ips: IpMatcher,
}

impl RuleList {
    fn new(patterns: &[String]) -> Self {
        let mut list = Self::default();
        for pattern in patterns {
            if IpMatcher::is_ip_pattern(pattern) {
                if !list.ips.insert(pattern) {
                    log::warn!("忽略无效的 IP 规则: {}", pattern);
                }
            } else {
                list.domains.insert(pattern);
            }
        }
        list
    }

    fn len(&self) -> usize {
        self.domains.len() + self.ips.len()
    }
}

/// 基于配置列表的规则匹配器
///
/// 域名先按列表匹配（拦截 > 直连 > 代理），未命中时视 `resolve_locally`
/// 决定是否本地解析后按 IP 再分类。
pub struct AclRouter {
    block: RuleList,
    direct: RuleList,
    proxy: RuleList,
    /// 默认直连的地址段（例如本地区 IP 库）
    direct_ips: IpMatcher,
    resolver: Arc<LocalResolver>,
}

impl AclRouter {
    pub fn new(config: &AclConfig, resolver: Arc<LocalResolver>) -> Self {
        let router = Self {
            block: RuleList::new(&config.block),
            direct: RuleList::new(&config.direct),
            proxy: RuleList::new(&config.proxy),
            direct_ips: IpMatcher::new(&config.direct_ips),
            resolver,
        };

        info!(
            "ACL 已加载: 拦截 {} 条, 直连 {} 条, 代理 {} 条, 直连地址段 {} 条",
            router.block.len(),
            router.direct.len(),
            router.proxy.len(),
            router.direct_ips.len()
        );

        router
    }

    fn classify_ip(&self, ip: IpAddr) -> RuleCode {
        let v4 = match ip {
            IpAddr::V6(_) => return RuleCode::IPv6,
            IpAddr::V4(v4) => v4,
        };

        if is_private_v4(v4) {
            RuleCode::Private
        } else if self.block.ips.matches(ip) {
            RuleCode::Block
        } else if self.direct.ips.matches(ip) {
            RuleCode::MatchedPass
        } else if self.proxy.ips.matches(ip) {
            RuleCode::MatchedProxy
        } else if self.direct_ips.matches(ip) {
            RuleCode::Pass
        } else {
            RuleCode::Proxy
        }
    }

    fn classify_domain(&self, domain: &str) -> Option<RuleCode> {
        if self.block.domains.matches(domain) {
            Some(RuleCode::Block)
        } else if self.direct.domains.matches(domain) {
            Some(RuleCode::MatchedPass)
        } else if self.proxy.domains.matches(domain) {
            Some(RuleCode::MatchedProxy)
        } else {
            None
        }
    }
}

#[async_trait]
impl RuleMatcher for AclRouter {
    async fn check(&self, target: &str, resolve_locally: bool) -> RuleCheck {
        if let Ok(ip) = target.parse::<IpAddr>() {
            return RuleCheck::new(self.classify_ip(ip)).with_ip(ip.to_string());
        }

        if let Some(code) = self.classify_domain(target) {
            return RuleCheck::new(code);
        }

        if !resolve_locally {
            return RuleCheck::new(RuleCode::Unknown(u8::MAX));
        }

        match self.resolver.resolve_v4(target).await {
            Ok(ip) => RuleCheck::new(self.classify_ip(IpAddr::V4(ip))).with_ip(ip.to_string()),
            Err(e) => RuleCheck::new(RuleCode::Proxy).with_error(e),
        }
    }
}
