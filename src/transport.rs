use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::error::TransportError;

/// 响应体读取上限，解析响应只关心头部
const MAX_BODY_SIZE: u64 = 64 * 1024;
/// 头部行数上限
const MAX_HEADER_LINES: usize = 100;

/// 一个最小化的 HTTP 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 按名称查找头部（大小写不敏感）
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// 一次 HTTP 请求/响应往返
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// 基于 TCP 的 HTTP/1.1 传输
///
/// 配置了 `dial_addr` 时总是连接该地址，URL 中的主机只用于 `Host` 头。
#[derive(Debug, Clone)]
pub struct HttpTransport {
    timeout: Duration,
    dial_addr: Option<String>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            dial_addr: None,
        }
    }

    pub fn with_dial_addr(mut self, addr: impl Into<String>) -> Self {
        self.dial_addr = Some(addr.into());
        self
    }

    async fn exchange(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", request.url, e)))?;
        if url.scheme() != "http" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("no host: {}", request.url)))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let addr = match &self.dial_addr {
            Some(addr) => addr.clone(),
            None => format!("{}:{}", host, port),
        };

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        // 头部中的换行会拆出额外的头
        for (name, value) in &request.headers {
            if has_line_break(name) || has_line_break(value) {
                return Err(TransportError::Network(format!(
                    "invalid header {:?}: contains control characters",
                    name
                )));
            }
        }

        debug!("HTTP {} {} (via {})", request.method, request.url, addr);

        let mut stream = TcpStream::connect(&addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置 TCP_NODELAY 失败: {}", e);
        }

        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            request.method, target, host_header
        );
        for (name, value) in &request.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let (status_line, headers) = read_head(&mut reader).await?;
        let status = parse_status(&status_line)?;

        // 读掉响应体以便连接正常结束
        let mut body = Vec::new();
        let limit = match find_header(&headers, "content-length").and_then(|v| v.parse::<u64>().ok()) {
            Some(len) => len.min(MAX_BODY_SIZE),
            None => MAX_BODY_SIZE,
        };
        (&mut reader).take(limit).read_to_end(&mut body).await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        timeout(self.timeout, self.exchange(&request)).await?
    }
}

fn has_line_break(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0))
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// 读取起始行和头部，遇到空行结束
async fn read_head<R>(reader: &mut R) -> Result<(String, Vec<(String, String)>), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut start_line = String::new();
    if reader.read_line(&mut start_line).await? == 0 {
        return Err(TransportError::Network("connection closed before response".to_string()));
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_LINES {
            return Err(TransportError::Network("too many header lines".to_string()));
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok((start_line.trim_end().to_string(), headers))
}

fn parse_status(status_line: &str) -> Result<u16, TransportError> {
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| TransportError::Network(format!("bad status line: {}", status_line))),
        _ => Err(TransportError::Network(format!("bad status line: {}", status_line))),
    }
}
