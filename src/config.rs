use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 配置文件顶层结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 客户端配置（可选）
    pub client: Option<ClientConfig>,
    /// 服务端配置（可选）
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub acl: AclConfig,
    /// 日志配置（可选）
    pub log: Option<LogConfigFile>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("解析配置文件失败")
    }
}

/// 规则列表，每项可以是域名规则或 IP/CIDR
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclConfig {
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default)]
    pub direct: Vec<String>,
    #[serde(default)]
    pub proxy: Vec<String>,
    /// 默认直连的地址段
    #[serde(default)]
    pub direct_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 上游服务器地址，格式：host:port
    pub upstream: String,
    /// agent 中继地址（完整 URL）
    #[serde(default)]
    pub agent_upstream: Option<String>,
    /// 用户认证信息
    #[serde(default)]
    pub auth: String,
    /// 不信任本地 DNS，交给上游解析
    #[serde(default = "default_true")]
    pub remote_dns: bool,
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub forward: bool,
    #[serde(default)]
    pub agent: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// 决策缓存过期时间（秒），0 表示不过期
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl ClientConfig {
    pub fn policy(&self) -> Policy {
        Policy {
            global: self.global,
            forward: self.forward,
            agent: self.agent,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// 最大并发连接数，0 表示按 CPU 核心数自适应
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 是否启用拦截检查
    #[serde(default = "default_true")]
    pub enable_acl: bool,
    /// 配置后要求请求携带相同的认证信息
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfigFile {
    /// 日志级别: off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志输出目标: stdout, file, both
    #[serde(default = "default_log_output")]
    pub output: String,
    pub file_path: Option<String>,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

impl Default for LogConfigFile {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

/// 策略开关快照，构造路由器时固定下来
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    /// 全局代理：除私有地址外全部走隧道
    pub global: bool,
    /// 解析请求经上游再转发一跳
    pub forward: bool,
    /// 解析请求经 agent 中继
    pub agent: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = Config::from_json(r#"{"client": {"upstream": "1.2.3.4:8100"}}"#).unwrap();
        let client = config.client.unwrap();

        assert!(client.remote_dns);
        assert_eq!(client.policy(), Policy::default());
        assert_eq!(client.timeout(), Duration::from_secs(2));
        assert_eq!(client.cache_size, 1024);
        assert_eq!(client.cache_ttl(), Some(Duration::from_secs(3600)));
        assert!(config.server.is_none());
        assert!(config.acl.block.is_empty());
    }

    #[test]
    fn test_policy_snapshot() {
        let config = Config::from_json(
            r#"{"client": {"upstream": "u:1", "global": true, "agent": true, "cache_ttl_secs": 0}}"#,
        )
        .unwrap();
        let client = config.client.unwrap();

        let policy = client.policy();
        assert!(policy.global);
        assert!(policy.agent);
        assert!(!policy.forward);
        assert_eq!(client.cache_ttl(), None);
    }

    #[test]
    fn test_server_and_acl() {
        let config = Config::from_json(
            r#"{
                "server": {"listen_addr": "0.0.0.0:8100"},
                "acl": {"block": ["+.ads.example"], "direct_ips": ["10.0.0.0/8"]},
                "log": {"level": "debug"}
            }"#,
        )
        .unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.max_connections, 0);
        assert!(server.enable_acl);
        assert_eq!(config.acl.block, vec!["+.ads.example"]);
        assert_eq!(config.log.unwrap().output, "stdout");
    }

    #[test]
    fn test_invalid_json() {
        assert!(Config::from_json("{not json").is_err());
        assert!(Config::load("/nonexistent/config.json").is_err());
    }
}
