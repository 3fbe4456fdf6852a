//! 客户端路由决策
//!
//! 对每个目标主机给出代理、直连或拦截的结论：先查决策缓存，再走本地规则，
//! 规则无法确定时交给上游远程解析，最后按解析出的 IP 再分类一次。

use log::{debug, error, warn};
use std::fmt;
use std::sync::Arc;

use crate::cache::DecisionCache;
use crate::config::Policy;
use crate::metrics::Metrics;
use crate::remote::{RemoteResolver, ResolveFailure};
use crate::rule::{split_host_port, RuleCheck, RuleCode, RuleMatcher};

/// 路由结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// 经加密隧道
    Proxy,
    /// 直连
    Pass,
    /// 拒绝连接
    Block,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Proxy => write!(f, "Proxy"),
            Outcome::Pass => write!(f, "Pass"),
            Outcome::Block => write!(f, "Block"),
        }
    }
}

/// 缓存中的决策，写入后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    /// 点分十进制地址，未解析时为空
    pub resolved_ip: String,
    pub outcome: Outcome,
    /// 产生该结论的分类码
    pub raw_rule: RuleCode,
}

/// 返回给连接处理方的结论，`reason` 仅用于日志
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub reason: String,
}

impl Verdict {
    fn new(outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }
}

/// 尚未应用全局策略和缓存规则的原始决策
struct RawDecision {
    outcome: Outcome,
    reason: String,
    resolved_ip: String,
    rule: RuleCode,
    /// 私有地址：不受全局代理影响，也不缓存
    private: bool,
    cacheable: bool,
}

impl RawDecision {
    fn settled(outcome: Outcome, reason: &str, check: RuleCheck) -> Self {
        Self {
            outcome,
            reason: reason.to_string(),
            resolved_ip: check.ip,
            rule: check.code,
            private: false,
            cacheable: true,
        }
    }

    fn private(check: RuleCheck) -> Self {
        Self {
            private: true,
            cacheable: false,
            ..Self::settled(Outcome::Pass, "Private IP", check)
        }
    }

    /// 远程解析失败，退回临时结论
    fn degraded(outcome: Outcome, reason: String, rule: RuleCode) -> Self {
        Self {
            outcome,
            reason,
            resolved_ip: String::new(),
            rule,
            private: false,
            cacheable: false,
        }
    }
}

/// 客户端路由决策引擎
pub struct Router {
    matcher: Arc<dyn RuleMatcher>,
    remote: RemoteResolver,
    cache: Arc<DecisionCache<RoutingDecision>>,
    policy: Policy,
    /// 不信任本地 DNS
    remote_dns: bool,
    metrics: Metrics,
}

impl Router {
    pub fn new(matcher: Arc<dyn RuleMatcher>, remote: RemoteResolver, policy: Policy) -> Self {
        Self {
            matcher,
            remote,
            cache: Arc::new(DecisionCache::new(0)),
            policy,
            remote_dns: true,
            metrics: Metrics::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<DecisionCache<RoutingDecision>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_remote_dns(mut self, remote_dns: bool) -> Self {
        self.remote_dns = remote_dns;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn cache(&self) -> &DecisionCache<RoutingDecision> {
        &self.cache
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 决定目标 `host:port` 的路由方式，永不失败
    pub async fn decide(&self, host_port: &str) -> Verdict {
        let (host, _) = split_host_port(host_port);

        if let Some(cached) = self.cache.get(host) {
            self.metrics.inc_cache_hits();
            self.metrics.record_outcome(cached.outcome);
            return Verdict::new(cached.outcome, format!("{} (cached)", cached.outcome));
        }
        self.metrics.inc_cache_misses();

        let raw = self.compute(host).await;
        let verdict = self.finalize(host, raw);

        debug!("{} -> {} ({})", host, verdict.outcome, verdict.reason);
        self.metrics.record_outcome(verdict.outcome);
        verdict
    }

    /// 统一应用全局代理覆盖和缓存写入
    fn finalize(&self, host: &str, raw: RawDecision) -> Verdict {
        if self.policy.global && !raw.private {
            return Verdict::new(Outcome::Proxy, "Global");
        }

        if raw.cacheable {
            self.cache.add(
                host,
                RoutingDecision {
                    resolved_ip: raw.resolved_ip,
                    outcome: raw.outcome,
                    raw_rule: raw.rule,
                },
            );
        }

        Verdict::new(raw.outcome, raw.reason)
    }

    async fn compute(&self, host: &str) -> RawDecision {
        let check = self.matcher.check(host, !self.remote_dns).await;
        log_check_error(host, &check);
        let code = check.code;

        let provisional = match code {
            // IPv6 目标默认走代理
            RuleCode::IPv6 => return RawDecision::settled(Outcome::Proxy, "Proxy (IPv6)", check),
            RuleCode::MatchedPass => return RawDecision::settled(Outcome::Pass, "Pass", check),
            RuleCode::Proxy | RuleCode::MatchedProxy => {
                return RawDecision::settled(Outcome::Proxy, "Proxy", check)
            }
            RuleCode::Block => return RawDecision::settled(Outcome::Block, "Block", check),
            RuleCode::Private => return RawDecision::private(check),
            RuleCode::Pass if !self.remote_dns => {
                return RawDecision::settled(Outcome::Pass, "Pass (trust local DNS)", check)
            }
            RuleCode::Pass | RuleCode::Unknown(_) => Outcome::Proxy,
        };

        // 全局代理下结论已定，不必再问上游
        if self.policy.global {
            return RawDecision::degraded(provisional, "Global".to_string(), code);
        }

        self.metrics.inc_remote_lookups();
        match self.remote.resolve(host).await {
            Ok(ip) => self.classify_resolved(ip).await,
            Err(failure) => {
                match failure {
                    ResolveFailure::Timeout => self.metrics.inc_remote_timeouts(),
                    _ => self.metrics.inc_remote_failures(),
                }
                warn!("远程解析 {} 失败: {}", host, failure);
                RawDecision::degraded(provisional, failure.to_string(), code)
            }
        }
    }

    /// 按远程解析出的 IP 再分类
    async fn classify_resolved(&self, ip: String) -> RawDecision {
        let check = self.matcher.check(&ip, true).await;
        log_check_error(&ip, &check);

        let (outcome, reason) = match check.code {
            RuleCode::Pass | RuleCode::MatchedPass => (Outcome::Pass, "Pass (by remote)"),
            RuleCode::Proxy | RuleCode::MatchedProxy => (Outcome::Proxy, "Proxy (by remote)"),
            RuleCode::Block => (Outcome::Block, "Block (by remote)"),
            // 远程给出的私有地址不可信，不直连
            RuleCode::Private => (Outcome::Proxy, "Private IP (by remote)"),
            RuleCode::IPv6 | RuleCode::Unknown(_) => (Outcome::Proxy, "Unknown"),
        };

        RawDecision {
            outcome,
            reason: reason.to_string(),
            resolved_ip: ip,
            rule: check.code,
            private: false,
            cacheable: true,
        }
    }
}

fn log_check_error(target: &str, check: &RuleCheck) {
    if let Some(e) = &check.error {
        error!("ACL 检查 {} 出错: {:#}", target, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::remote::{PlainCodec, DNS_RESP_HEADER};
    use crate::transport::{HttpRequest, HttpResponse, RoundTrip};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use anyhow::anyhow;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 按目标返回固定分类码，并记录每次调用
    struct FakeMatcher {
        codes: HashMap<String, RuleCode>,
        /// 这些目标的检查结果附带错误
        failing: HashSet<String>,
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl FakeMatcher {
        fn new(codes: &[(&str, RuleCode)]) -> Arc<Self> {
            Self::with_errors(codes, &[])
        }

        fn with_errors(codes: &[(&str, RuleCode)], failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                codes: codes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                failing: failing.iter().map(|t| t.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuleMatcher for FakeMatcher {
        async fn check(&self, target: &str, resolve_locally: bool) -> RuleCheck {
            self.calls
                .lock()
                .unwrap()
                .push((target.to_string(), resolve_locally));
            let code = self
                .codes
                .get(target)
                .copied()
                .unwrap_or(RuleCode::Unknown(u8::MAX));
            let check = RuleCheck::new(code);
            if self.failing.contains(target) {
                check.with_error(anyhow!("lookup failed for {}", target))
            } else {
                check
            }
        }
    }

    enum Reply {
        Header(String),
        Timeout,
        Refused,
    }

    struct FakeTransport {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RoundTrip for FakeTransport {
        async fn round_trip(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Header(value) => Ok(HttpResponse {
                    status: 200,
                    headers: vec![(DNS_RESP_HEADER.to_string(), value.clone())],
                    body: b"drained".to_vec(),
                }),
                Reply::Timeout => Err(TransportError::Timeout),
                Reply::Refused => Err(TransportError::Network("connection refused".to_string())),
            }
        }
    }

    fn router(matcher: Arc<FakeMatcher>, transport: Arc<FakeTransport>, policy: Policy) -> Router {
        let remote = RemoteResolver::new(
            Arc::new(PlainCodec::default()),
            transport.clone(),
            transport,
            "upstream.example:8100",
            policy,
        );
        Router::new(matcher, remote, policy)
    }

    fn binary_reply(octets: [u8; 4]) -> Arc<FakeTransport> {
        FakeTransport::new(Reply::Header(STANDARD.encode(octets)))
    }

    fn global() -> Policy {
        Policy {
            global: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_block_is_cached() {
        let matcher = FakeMatcher::new(&[("ads.example", RuleCode::Block)]);
        let transport = binary_reply([1, 2, 3, 4]);
        let router = router(matcher.clone(), transport.clone(), Policy::default());

        let first = router.decide("ads.example:443").await;
        assert_eq!(first, Verdict::new(Outcome::Block, "Block"));
        assert!(router.cache().contains("ads.example"));

        let second = router.decide("ads.example:80").await;
        assert_eq!(second, Verdict::new(Outcome::Block, "Block (cached)"));

        assert_eq!(matcher.calls().len(), 1);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_first_pass_table() {
        let matcher = FakeMatcher::new(&[
            ("v6.example", RuleCode::IPv6),
            ("direct.example", RuleCode::MatchedPass),
            ("tunnel.example", RuleCode::MatchedProxy),
            ("default.example", RuleCode::Proxy),
        ]);
        let router = router(matcher, binary_reply([1, 2, 3, 4]), Policy::default());

        assert_eq!(
            router.decide("v6.example:443").await,
            Verdict::new(Outcome::Proxy, "Proxy (IPv6)")
        );
        assert_eq!(
            router.decide("direct.example").await,
            Verdict::new(Outcome::Pass, "Pass")
        );
        assert_eq!(
            router.decide("tunnel.example").await,
            Verdict::new(Outcome::Proxy, "Proxy")
        );
        assert_eq!(
            router.decide("default.example").await,
            Verdict::new(Outcome::Proxy, "Proxy")
        );
        assert_eq!(router.cache().len(), 4);
    }

    #[tokio::test]
    async fn test_remote_dns_controls_local_resolution() {
        let matcher = FakeMatcher::new(&[("cn.example", RuleCode::Pass)]);
        let transport = binary_reply([1, 2, 3, 4]);
        let router = router(matcher.clone(), transport.clone(), Policy::default())
            .with_remote_dns(false);

        assert_eq!(
            router.decide("cn.example:443").await,
            Verdict::new(Outcome::Pass, "Pass (trust local DNS)")
        );
        assert_eq!(matcher.calls(), vec![("cn.example".to_string(), true)]);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_pass_with_remote_dns_asks_upstream() {
        let matcher = FakeMatcher::new(&[
            ("cn.example", RuleCode::Pass),
            ("1.2.3.4", RuleCode::Pass),
        ]);
        let transport = binary_reply([1, 2, 3, 4]);
        let router = router(matcher.clone(), transport.clone(), Policy::default());

        assert_eq!(
            router.decide("cn.example:443").await,
            Verdict::new(Outcome::Pass, "Pass (by remote)")
        );
        assert_eq!(
            matcher.calls(),
            vec![
                ("cn.example".to_string(), false),
                ("1.2.3.4".to_string(), true)
            ]
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_global_forces_proxy_without_caching() {
        let matcher = FakeMatcher::new(&[
            ("ads.example", RuleCode::Block),
            ("v6.example", RuleCode::IPv6),
        ]);
        let transport = binary_reply([1, 2, 3, 4]);
        let router = router(matcher, transport.clone(), global());

        for host in ["ads.example:443", "v6.example:443", "unknown.example:443"] {
            assert_eq!(router.decide(host).await, Verdict::new(Outcome::Proxy, "Global"));
        }

        assert!(router.cache().is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_private_is_exempt_from_global_and_cache() {
        let matcher = FakeMatcher::new(&[("192.168.1.10", RuleCode::Private)]);
        let transport = binary_reply([1, 2, 3, 4]);

        for policy in [global(), Policy::default()] {
            let router = router(matcher.clone(), transport.clone(), policy);
            assert_eq!(
                router.decide("192.168.1.10:22").await,
                Verdict::new(Outcome::Pass, "Private IP")
            );
            assert!(!router.cache().contains("192.168.1.10"));
        }
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_binary_response_is_classified() {
        let matcher = FakeMatcher::new(&[("203.0.113.200", RuleCode::MatchedProxy)]);
        let router = router(matcher.clone(), binary_reply([203, 0, 113, 200]), Policy::default());

        assert_eq!(
            router.decide("unknown.example:443").await,
            Verdict::new(Outcome::Proxy, "Proxy (by remote)")
        );
        assert_eq!(matcher.calls()[1], ("203.0.113.200".to_string(), true));

        let cached = router.cache().get("unknown.example").unwrap();
        assert_eq!(
            cached,
            RoutingDecision {
                resolved_ip: "203.0.113.200".to_string(),
                outcome: Outcome::Proxy,
                raw_rule: RuleCode::MatchedProxy,
            }
        );
    }

    #[tokio::test]
    async fn test_literal_dotted_quad_response() {
        let matcher = FakeMatcher::new(&[("93.184.216.34", RuleCode::Block)]);
        let transport = FakeTransport::new(Reply::Header(STANDARD.encode("93.184.216.34")));
        let router = router(matcher.clone(), transport, Policy::default());

        assert_eq!(
            router.decide("unknown.example").await,
            Verdict::new(Outcome::Block, "Block (by remote)")
        );
        assert_eq!(matcher.calls()[1].0, "93.184.216.34");
        assert_eq!(
            router.decide("unknown.example").await,
            Verdict::new(Outcome::Block, "Block (cached)")
        );
    }

    #[tokio::test]
    async fn test_second_pass_table() {
        let cases = [
            (RuleCode::Pass, Outcome::Pass, "Pass (by remote)"),
            (RuleCode::MatchedPass, Outcome::Pass, "Pass (by remote)"),
            (RuleCode::Proxy, Outcome::Proxy, "Proxy (by remote)"),
            (RuleCode::Block, Outcome::Block, "Block (by remote)"),
            (RuleCode::Private, Outcome::Proxy, "Private IP (by remote)"),
            (RuleCode::IPv6, Outcome::Proxy, "Unknown"),
            (RuleCode::Unknown(9), Outcome::Proxy, "Unknown"),
        ];

        for (code, outcome, reason) in cases {
            let matcher = FakeMatcher::new(&[("10.0.0.1", code)]);
            let router = router(matcher, binary_reply([10, 0, 0, 1]), Policy::default());
            assert_eq!(router.decide("host.example").await, Verdict::new(outcome, reason));
        }
    }

    #[tokio::test]
    async fn test_timeout_degrades_without_caching() {
        let matcher = FakeMatcher::new(&[]);
        let router = router(matcher, FakeTransport::new(Reply::Timeout), Policy::default());

        assert_eq!(
            router.decide("slow.example:443").await,
            Verdict::new(Outcome::Proxy, "Timeout")
        );
        assert!(router.cache().is_empty());
        assert_eq!(router.metrics().snapshot().remote_timeouts, 1);
    }

    #[tokio::test]
    async fn test_network_error_reason() {
        let matcher = FakeMatcher::new(&[]);
        let router = router(matcher, FakeTransport::new(Reply::Refused), Policy::default());

        assert_eq!(
            router.decide("down.example").await,
            Verdict::new(Outcome::Proxy, "Network error: connection refused")
        );
        assert!(router.cache().is_empty());
    }

    #[tokio::test]
    async fn test_bad_response() {
        let matcher = FakeMatcher::new(&[]);
        let transport = FakeTransport::new(Reply::Header(STANDARD.encode([1u8, 2, 3])));
        let router = router(matcher.clone(), transport, Policy::default());

        assert_eq!(
            router.decide("odd.example").await,
            Verdict::new(Outcome::Proxy, "Bad response")
        );
        // 没有进入第二轮分类
        assert_eq!(matcher.calls().len(), 1);
        assert!(router.cache().is_empty());
    }

    #[tokio::test]
    async fn test_matcher_error_keeps_first_pass_code() {
        let matcher = FakeMatcher::with_errors(&[("ads.example", RuleCode::Block)], &["ads.example"]);
        let transport = binary_reply([1, 2, 3, 4]);
        let router = router(matcher, transport.clone(), Policy::default());

        assert_eq!(
            router.decide("ads.example:443").await,
            Verdict::new(Outcome::Block, "Block")
        );
        assert_eq!(
            router.cache().get("ads.example").map(|d| d.outcome),
            Some(Outcome::Block)
        );
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_matcher_error_without_usable_code_goes_remote() {
        let matcher = FakeMatcher::with_errors(
            &[("1.2.3.4", RuleCode::MatchedProxy)],
            &["broken.example"],
        );
        let transport = binary_reply([1, 2, 3, 4]);
        let router = router(matcher, transport.clone(), Policy::default());

        assert_eq!(
            router.decide("broken.example").await,
            Verdict::new(Outcome::Proxy, "Proxy (by remote)")
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_matcher_error_keeps_second_pass_code() {
        let matcher = FakeMatcher::with_errors(&[("1.2.3.4", RuleCode::MatchedPass)], &["1.2.3.4"]);
        let router = router(matcher.clone(), binary_reply([1, 2, 3, 4]), Policy::default());

        assert_eq!(
            router.decide("host.example").await,
            Verdict::new(Outcome::Pass, "Pass (by remote)")
        );
        assert_eq!(matcher.calls()[1], ("1.2.3.4".to_string(), true));
        assert_eq!(
            router.cache().get("host.example").map(|d| d.raw_rule),
            Some(RuleCode::MatchedPass)
        );
    }

    #[tokio::test]
    async fn test_metrics_track_cache_hits() {
        let matcher = FakeMatcher::new(&[("a.example", RuleCode::MatchedPass)]);
        let router = router(matcher, binary_reply([1, 2, 3, 4]), Policy::default());

        router.decide("a.example").await;
        router.decide("a.example").await;

        let snapshot = router.metrics().snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.pass_decisions, 2);
    }
}
