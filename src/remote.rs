//! 远程解析协议
//!
//! 本地规则无法确定时，把域名交给上游解析。请求经编解码器编码为 URL
//! 路径中的令牌，响应在 `X-Resolved-Addr` 头中以 base64 携带 IPv4 地址：
//! 要么是点分十进制文本，要么是 4 字节二进制。

use anyhow::{Context, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::Policy;
use crate::error::TransportError;
use crate::transport::{HttpRequest, RoundTrip};

/// 转发头，携带二跳 URL 或 `<host>,dns`
pub const FWD_URL_HEADER: &str = "X-Forwarded-Url";
/// 解析结果头
pub const DNS_RESP_HEADER: &str = "X-Resolved-Addr";
/// agent 模式下转发头的后缀
pub const AGENT_DNS_SUFFIX: &str = ",dns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Dns,
}

/// 编码前的客户端请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub op: Operation,
    pub real: String,
    pub auth: String,
    pub query: String,
}

impl ClientRequest {
    pub fn dns(host: &str, auth: &str) -> Self {
        Self {
            op: Operation::Dns,
            real: "dns".to_string(),
            auth: auth.to_string(),
            query: host.to_string(),
        }
    }
}

/// 请求编解码器：把请求变成可嵌入 URL 路径的令牌
pub trait RequestCodec: Send + Sync {
    fn encode(&self, request: &ClientRequest) -> String;

    fn decode(&self, token: &str) -> Result<ClientRequest>;

    /// 生成请求 URL 中使用的主机名
    fn gen_host(&self) -> String;
}

/// 明文编解码器：JSON + URL 安全 base64
///
/// 不做任何加密，用于本地部署和测试，生产环境应替换为加密实现。
#[derive(Debug, Clone)]
pub struct PlainCodec {
    host: String,
}

impl PlainCodec {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Default for PlainCodec {
    fn default() -> Self {
        Self::new("dns.query")
    }
}

impl RequestCodec for PlainCodec {
    fn encode(&self, request: &ClientRequest) -> String {
        // 结构体序列化不会失败
        let json = serde_json::to_vec(request).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    fn decode(&self, token: &str) -> Result<ClientRequest> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim_start_matches('/'))
            .context("请求令牌不是合法的 base64")?;
        serde_json::from_slice(&json).context("请求令牌内容无法解析")
    }

    fn gen_host(&self) -> String {
        self.host.clone()
    }
}

/// 发送解析请求使用的传输
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Query,
    Agent,
}

/// 按策略整形后的解析请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvePlan {
    pub request: HttpRequest,
    pub transport: TransportKind,
}

/// 远程解析失败，`Display` 即决策原因
#[derive(Debug)]
pub enum ResolveFailure {
    Timeout,
    Network(String),
    BadResponse,
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveFailure::Timeout => write!(f, "Timeout"),
            ResolveFailure::Network(msg) => write!(f, "Network error: {}", msg),
            ResolveFailure::BadResponse => write!(f, "Bad response"),
        }
    }
}

impl From<TransportError> for ResolveFailure {
    fn from(e: TransportError) -> Self {
        if e.is_timeout() {
            ResolveFailure::Timeout
        } else {
            ResolveFailure::Network(e.to_string())
        }
    }
}

/// 远程解析客户端
pub struct RemoteResolver {
    codec: Arc<dyn RequestCodec>,
    query_transport: Arc<dyn RoundTrip>,
    agent_transport: Arc<dyn RoundTrip>,
    /// 上游地址，格式：host:port
    upstream: String,
    /// agent 中继 URL
    agent_upstream: String,
    auth: String,
    policy: Policy,
}

impl RemoteResolver {
    pub fn new(
        codec: Arc<dyn RequestCodec>,
        query_transport: Arc<dyn RoundTrip>,
        agent_transport: Arc<dyn RoundTrip>,
        upstream: impl Into<String>,
        policy: Policy,
    ) -> Self {
        Self {
            codec,
            query_transport,
            agent_transport,
            upstream: upstream.into(),
            agent_upstream: String::new(),
            auth: String::new(),
            policy,
        }
    }

    pub fn with_agent_upstream(mut self, agent_upstream: impl Into<String>) -> Self {
        self.agent_upstream = agent_upstream.into();
        self
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = auth.into();
        self
    }

    /// 按策略构造解析请求
    pub fn plan(&self, host: &str) -> ResolvePlan {
        let token = self.codec.encode(&ClientRequest::dns(host, &self.auth));
        let true_url = format!("http://{}/{}", self.codec.gen_host(), token);

        if self.policy.agent {
            ResolvePlan {
                request: HttpRequest::get(self.agent_upstream.clone())
                    .with_header(FWD_URL_HEADER, format!("{}{}", host, AGENT_DNS_SUFFIX)),
                transport: TransportKind::Agent,
            }
        } else if self.policy.forward {
            ResolvePlan {
                request: HttpRequest::get(format!("http://{}", self.upstream))
                    .with_header(FWD_URL_HEADER, true_url),
                transport: TransportKind::Query,
            }
        } else {
            ResolvePlan {
                request: HttpRequest::get(true_url),
                transport: TransportKind::Query,
            }
        }
    }

    /// 发起远程解析，返回点分十进制 IPv4 字符串
    pub async fn resolve(&self, host: &str) -> Result<String, ResolveFailure> {
        let plan = self.plan(host);
        let transport = match plan.transport {
            TransportKind::Query => &self.query_transport,
            TransportKind::Agent => &self.agent_transport,
        };

        debug!("远程解析 {} ({:?})", host, plan.transport);
        let response = transport.round_trip(plan.request).await?;

        let header = response.header(DNS_RESP_HEADER).unwrap_or_default();
        decode_resolved_ip(header).ok_or(ResolveFailure::BadResponse)
    }
}

/// 解码解析结果头
///
/// 解码后恰好能按 `.` 分成 4 段时按文本地址直接使用，否则必须是 4 字节二进制。
pub fn decode_resolved_ip(header: &str) -> Option<String> {
    let payload = STANDARD.decode(header.trim()).ok()?;

    if payload.split(|b| *b == b'.').count() == 4 {
        return Some(String::from_utf8_lossy(&payload).into_owned());
    }

    let octets: [u8; 4] = payload.as_slice().try_into().ok()?;
    Some(Ipv4Addr::from(octets).to_string())
}

/// 编码解析结果头，服务端使用 4 字节二进制形式
///
/// 恰好有三个字节等于 `.` 的地址二进制形式会被当成文本，此时改用点分十进制。
pub fn encode_resolved_ip(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    if octets.iter().filter(|b| **b == b'.').count() == 3 {
        return STANDARD.encode(ip.to_string());
    }
    STANDARD.encode(octets)
}
