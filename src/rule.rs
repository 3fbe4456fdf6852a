use async_trait::async_trait;
use std::fmt;

/// 规则匹配器返回的分类码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleCode {
    /// 未命中任何规则，默认走代理
    Proxy,
    /// 命中直连规则
    MatchedPass,
    /// 命中代理规则
    MatchedProxy,
    /// 命中拦截规则
    Block,
    /// 私有地址
    Private,
    /// 未显式命中，但 IP 属于直连地址段
    Pass,
    /// IPv6 目标
    IPv6,
    /// 无法识别的分类码（原始值保留用于诊断）
    Unknown(u8),
}

impl From<u8> for RuleCode {
    fn from(raw: u8) -> Self {
        match raw {
            0 => RuleCode::Proxy,
            1 => RuleCode::MatchedPass,
            2 => RuleCode::MatchedProxy,
            3 => RuleCode::Block,
            4 => RuleCode::Private,
            5 => RuleCode::Pass,
            6 => RuleCode::IPv6,
            other => RuleCode::Unknown(other),
        }
    }
}

impl From<RuleCode> for u8 {
    fn from(code: RuleCode) -> Self {
        match code {
            RuleCode::Proxy => 0,
            RuleCode::MatchedPass => 1,
            RuleCode::MatchedProxy => 2,
            RuleCode::Block => 3,
            RuleCode::Private => 4,
            RuleCode::Pass => 5,
            RuleCode::IPv6 => 6,
            RuleCode::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for RuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCode::Proxy => write!(f, "proxy"),
            RuleCode::MatchedPass => write!(f, "matched-pass"),
            RuleCode::MatchedProxy => write!(f, "matched-proxy"),
            RuleCode::Block => write!(f, "block"),
            RuleCode::Private => write!(f, "private"),
            RuleCode::Pass => write!(f, "pass"),
            RuleCode::IPv6 => write!(f, "ipv6"),
            RuleCode::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// 一次规则检查的结果
///
/// 出错时分类码仍然有效，调用方记录错误后按分类码继续决策。
#[derive(Debug)]
pub struct RuleCheck {
    pub code: RuleCode,
    /// 本地解析得到的 IP（未解析时为空）
    pub ip: String,
    pub error: Option<anyhow::Error>,
}

impl RuleCheck {
    pub fn new(code: RuleCode) -> Self {
        Self {
            code,
            ip: String::new(),
            error: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    pub fn with_error(mut self, error: anyhow::Error) -> Self {
        self.error = Some(error);
        self
    }
}

/// 规则匹配器：对主机名或 IP 进行分类
#[async_trait]
pub trait RuleMatcher: Send + Sync {
    /// `resolve_locally` 为 false 时不得发起本地 DNS 查询
    async fn check(&self, target: &str, resolve_locally: bool) -> RuleCheck;
}

/// 去掉端口，返回纯主机名
///
/// 支持 `host:port`、`[::1]:port`、裸主机名以及裸 IPv6 地址。
pub fn split_host_port(host_port: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..].strip_prefix(':');
            return (host, port);
        }
        return (host_port, None);
    }

    match host_port.rfind(':') {
        // 多个冒号说明是未加方括号的 IPv6 地址
        Some(pos) if !host_port[..pos].contains(':') => {
            (&host_port[..pos], Some(&host_port[pos + 1..]))
        }
        _ => (host_port, None),
    }
}
