use anyhow::{Context, Result};
use bytes::Bytes;
use futures::FutureExt;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use url::Url;

use crate::block::BlockChecker;
use crate::dns::LocalResolver;
use crate::metrics::Metrics;
use crate::remote::{encode_resolved_ip, RequestCodec, AGENT_DNS_SUFFIX, DNS_RESP_HEADER, FWD_URL_HEADER};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// 服务端远程解析入口
///
/// 接收客户端的解析请求，经拦截检查后在本地解析，并把 IPv4 地址以 4 字节
/// 二进制的 base64 形式写入响应头。
pub struct ResolverServer {
    listen_addr: SocketAddr,
    max_connections: usize,
    handler: Handler,
}

#[derive(Clone)]
struct Handler {
    codec: Arc<dyn RequestCodec>,
    blocker: Arc<BlockChecker>,
    resolver: Arc<LocalResolver>,
    /// 配置后只接受携带相同认证信息的请求
    auth: Option<String>,
    metrics: Metrics,
}

/// 构造空响应体的应答，解析成功时附带结果头
fn reply(status: StatusCode, resolved: Option<Ipv4Addr>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;

    if let Some(ip) = resolved {
        match HeaderValue::from_str(&encode_resolved_ip(ip)) {
            Ok(value) => {
                response.headers_mut().insert(DNS_RESP_HEADER, value);
            }
            Err(e) => {
                error!("无法编码解析结果 {}: {}", ip, e);
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }
    response
}

impl ResolverServer {
    pub fn new(
        listen_addr: SocketAddr,
        codec: Arc<dyn RequestCodec>,
        blocker: Arc<BlockChecker>,
        resolver: Arc<LocalResolver>,
    ) -> Self {
        // 按 CPU 核心数自适应，每核 500 个连接
        let max_connections = std::cmp::min(10000, num_cpus::get() * 500);

        Self {
            listen_addr,
            max_connections,
            handler: Handler {
                codec,
                blocker,
                resolver,
                auth: None,
                metrics: Metrics::new(),
            },
        }
    }

    /// 设置最大并发连接数，0 保持自适应值
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        if max_connections > 0 {
            self.max_connections = max_connections;
        }
        self
    }

    pub fn with_auth(mut self, auth: Option<String>) -> Self {
        self.handler.auth = auth.filter(|a| !a.is_empty());
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.handler.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.handler.metrics
    }

    /// 创建监听 socket，设置较大的 backlog
    pub fn bind(&self) -> Result<TcpListener> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(
            Domain::for_address(self.listen_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&self.listen_addr.into())
            .with_context(|| format!("绑定监听地址失败: {}", self.listen_addr))?;
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// 启动服务（支持优雅关闭）
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<watch::Receiver<bool>>) -> Result<()> {
        let listener = self.bind()?;
        info!("解析服务启动在 {}", self.listen_addr);
        info!("最大并发连接数: {}", self.max_connections);
        if self.handler.blocker.is_enabled() {
            info!("拦截检查: 启用");
        }

        let metrics = self.handler.metrics.clone();
        let summary = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics.print_summary();
            }
        });

        let result = self.serve(listener, shutdown_rx).await;
        summary.abort();
        result
    }

    /// 在给定的监听器上处理连接，直到收到关闭信号
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));

        loop {
            let accepted = match shutdown_rx.as_mut() {
                Some(rx) => tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            info!("收到关闭信号，停止接受新连接");
                            return Ok(());
                        }
                        continue;
                    }
                    accepted = listener.accept() => accepted,
                },
                None => listener.accept().await,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("接受连接失败: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("获取连接许可失败: {}", e);
                    continue;
                }
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                let _permit = permit;

                let result = std::panic::AssertUnwindSafe(handler.serve_connection(stream, peer))
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("处理 {} 的请求出错: {:#}", peer, e),
                    Err(panic_err) => error!("连接处理任务 panic: {:?}", panic_err),
                }
            });
        }
    }
}

impl Handler {
    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置 TCP_NODELAY 失败: {}", e);
        }

        let handler = self.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.respond(req, peer).await) }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(READ_TIMEOUT)
            .serve_connection(TokioIo::new(stream), service)
            .await
            .context("HTTP 连接处理失败")?;
        Ok(())
    }

    async fn respond(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return reply(StatusCode::METHOD_NOT_ALLOWED, None);
        }

        let host = match self.resolve_target(req.uri(), req.headers()) {
            Ok(host) => host,
            Err(status) => {
                debug!("{} {} -> {}", peer, req.uri(), status);
                return reply(status, None);
            }
        };
        self.metrics.inc_resolve_requests();

        if self.blocker.is_blocked(&host).await {
            self.metrics.inc_blocked_requests();
            info!("拦截解析请求: {}", host);
            return reply(StatusCode::FORBIDDEN, None);
        }

        match self.resolver.resolve_v4(&host).await {
            Ok(ip) => {
                debug!("{} 解析 {} -> {}", peer, host, ip);
                reply(StatusCode::OK, Some(ip))
            }
            Err(e) => {
                warn!("解析 {} 失败: {:#}", host, e);
                reply(StatusCode::BAD_GATEWAY, None)
            }
        }
    }

    /// 取出要解析的主机名，失败时返回应答状态码
    fn resolve_target(&self, uri: &Uri, headers: &HeaderMap) -> Result<String, StatusCode> {
        let forwarded = match headers.get(FWD_URL_HEADER) {
            Some(value) => Some(value.to_str().map_err(|_| StatusCode::BAD_REQUEST)?),
            None => None,
        };

        let token = match forwarded {
            // agent 中继直接携带主机名
            Some(value) if value.ends_with(AGENT_DNS_SUFFIX) => {
                if self.auth.is_some() {
                    return Err(StatusCode::FORBIDDEN);
                }
                let host = value.trim_end_matches(AGENT_DNS_SUFFIX);
                return if host.is_empty() {
                    Err(StatusCode::BAD_REQUEST)
                } else {
                    Ok(host.to_string())
                };
            }
            Some(value) => Url::parse(value)
                .map_err(|_| StatusCode::BAD_REQUEST)?
                .path()
                .to_string(),
            None => uri.path().to_string(),
        };

        let request = self.codec.decode(&token).map_err(|e| {
            debug!("无法解码请求令牌: {:#}", e);
            StatusCode::BAD_REQUEST
        })?;

        if let Some(auth) = &self.auth {
            if &request.auth != auth {
                return Err(StatusCode::FORBIDDEN);
            }
        }

        Ok(request.query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclRouter;
    use crate::config::{AclConfig, Policy};
    use crate::remote::{ClientRequest, PlainCodec, RemoteResolver};
    use crate::rule::RuleMatcher;
    use crate::transport::{HttpRequest, HttpTransport, RoundTrip};

    struct Running {
        addr: SocketAddr,
        shutdown: watch::Sender<bool>,
        metrics: Metrics,
    }

    async fn start(block: &[&str], auth: Option<&str>) -> Running {
        let resolver = Arc::new(LocalResolver::default());
        let acl = AclConfig {
            block: block.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let matcher: Arc<dyn RuleMatcher> = Arc::new(AclRouter::new(&acl, resolver.clone()));
        let blocker = Arc::new(BlockChecker::new(Some(matcher), 64));

        let server = ResolverServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PlainCodec::default()),
            blocker,
            resolver,
        )
        .with_auth(auth.map(str::to_string));
        let metrics = server.metrics().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(listener, Some(rx)).await });

        Running {
            addr,
            shutdown,
            metrics,
        }
    }

    fn client(addr: SocketAddr, policy: Policy, auth: &str) -> RemoteResolver {
        let query = Arc::new(HttpTransport::new(Duration::from_secs(2)).with_dial_addr(addr.to_string()));
        let agent = Arc::new(HttpTransport::new(Duration::from_secs(2)));
        RemoteResolver::new(Arc::new(PlainCodec::default()), query, agent, addr.to_string(), policy)
            .with_agent_upstream(format!("http://{}", addr))
            .with_auth(auth)
    }

    #[tokio::test]
    async fn test_resolve_direct_forward_and_agent() {
        let server = start(&[], None).await;

        for policy in [
            Policy::default(),
            Policy {
                forward: true,
                ..Default::default()
            },
            Policy {
                agent: true,
                ..Default::default()
            },
        ] {
            let ip = client(server.addr, policy, "").resolve("127.0.0.1").await.unwrap();
            assert_eq!(ip, "127.0.0.1");
        }

        assert_eq!(server.metrics.snapshot().resolve_requests, 3);
        let _ = server.shutdown.send(true);
    }

    #[tokio::test]
    async fn test_blocked_host_gets_forbidden() {
        let server = start(&["203.0.113.7"], None).await;

        let transport = HttpTransport::new(Duration::from_secs(2));
        let token = PlainCodec::default().encode(&ClientRequest::dns("203.0.113.7", ""));
        let response = transport
            .round_trip(HttpRequest::get(format!("http://{}/{}", server.addr, token)))
            .await
            .unwrap();

        assert_eq!(response.status, 403);
        assert!(response.header(DNS_RESP_HEADER).is_none());
        assert_eq!(server.metrics.snapshot().blocked_requests, 1);

        // 客户端视角是无法解析的响应
        let failure = client(server.addr, Policy::default(), "")
            .resolve("203.0.113.7")
            .await
            .unwrap_err();
        assert_eq!(failure.to_string(), "Bad response");
    }

    #[tokio::test]
    async fn test_auth_is_enforced() {
        let server = start(&[], Some("user:pass")).await;

        assert!(client(server.addr, Policy::default(), "wrong")
            .resolve("127.0.0.1")
            .await
            .is_err());
        assert_eq!(
            client(server.addr, Policy::default(), "user:pass")
                .resolve("127.0.0.1")
                .await
                .unwrap(),
            "127.0.0.1"
        );

        // agent 形式的请求不携带认证信息
        let agent = Policy {
            agent: true,
            ..Default::default()
        };
        assert!(client(server.addr, agent, "user:pass").resolve("127.0.0.1").await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let server = start(&[], None).await;
        let transport = HttpTransport::new(Duration::from_secs(2));

        let response = transport
            .round_trip(HttpRequest::get(format!("http://{}/not-a-token", server.addr)))
            .await
            .unwrap();
        assert_eq!(response.status, 400);

        let mut post = HttpRequest::get(format!("http://{}/", server.addr));
        post.method = "POST".to_string();
        assert_eq!(transport.round_trip(post).await.unwrap().status, 405);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let server = start(&[], None).await;
        server.shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let transport = HttpTransport::new(Duration::from_millis(500));
        assert!(transport
            .round_trip(HttpRequest::get(format!("http://{}/", server.addr)))
            .await
            .is_err());
    }

    #[test]
    fn test_reply_headers() {
        let response = reply(StatusCode::OK, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(DNS_RESP_HEADER).unwrap(), "AQIDBA==");

        let response = reply(StatusCode::BAD_GATEWAY, None);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(DNS_RESP_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_host_gets_bad_gateway() {
        let server = start(&[], None).await;
        let transport = HttpTransport::new(Duration::from_secs(15));

        let token = PlainCodec::default().encode(&ClientRequest::dns("does-not-exist.invalid", ""));
        let response = transport
            .round_trip(HttpRequest::get(format!("http://{}/{}", server.addr, token)))
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert!(response.header(DNS_RESP_HEADER).is_none());
    }
}
