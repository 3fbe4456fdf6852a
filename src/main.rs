use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use tunnel_router::config::{ClientConfig, ServerConfig};
use tunnel_router::logger::{init_from_env, init_logger, LogConfig};
use tunnel_router::{
    AclRouter, BlockChecker, Config, DecisionCache, HttpTransport, LocalResolver, PlainCodec,
    RemoteResolver, ResolverServer, Router, RuleMatcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 用法: tunnel-router [配置文件] [目标 host:port ...]
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.json".to_string());
    let targets: Vec<String> = args.collect();

    let config = Config::load(&config_path)?;

    // 没有日志配置时读取 RUST_LOG
    let initialized = match &config.log {
        Some(log_config_file) => init_logger(LogConfig::from_file_config(log_config_file)),
        None => init_from_env(),
    };
    initialized.map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== tunnel-router 启动 ===");
    log::info!("配置文件: {}", config_path);
    log::info!("日志级别: {}", log::max_level());

    let mut resolver = LocalResolver::default();
    if let Some(server) = &config.server {
        resolver = resolver.with_timeout(Duration::from_millis(server.timeout_ms));
    }
    let resolver = Arc::new(resolver);
    let matcher: Arc<dyn RuleMatcher> = Arc::new(AclRouter::new(&config.acl, resolver.clone()));

    if let Some(client) = &config.client {
        run_client(client, matcher.clone(), &targets).await?;
    }

    if let Some(server) = &config.server {
        run_server(server, matcher, resolver).await?;
    } else if config.client.is_none() {
        anyhow::bail!("配置文件中既没有 client 也没有 server 配置");
    }

    Ok(())
}

/// 对命令行给出的目标逐个做路由决策并输出
async fn run_client(
    client: &ClientConfig,
    matcher: Arc<dyn RuleMatcher>,
    targets: &[String],
) -> Result<()> {
    let policy = client.policy();
    log::info!("上游服务器: {}", client.upstream);
    log::info!(
        "策略: global={} forward={} agent={} remote_dns={}",
        policy.global,
        policy.forward,
        policy.agent,
        client.remote_dns
    );

    let query = Arc::new(HttpTransport::new(client.timeout()).with_dial_addr(client.upstream.clone()));
    let agent = Arc::new(HttpTransport::new(client.timeout()));

    let mut remote = RemoteResolver::new(
        Arc::new(PlainCodec::default()),
        query,
        agent,
        client.upstream.clone(),
        policy,
    )
    .with_auth(client.auth.clone());
    if let Some(agent_upstream) = &client.agent_upstream {
        remote = remote.with_agent_upstream(agent_upstream.clone());
    } else if policy.agent {
        log::warn!("启用了 agent 但未配置 agent_upstream");
    }

    let mut cache = DecisionCache::new(client.cache_size);
    if let Some(ttl) = client.cache_ttl() {
        cache = cache.with_ttl(ttl);
    }

    let router = Router::new(matcher, remote, policy)
        .with_cache(Arc::new(cache))
        .with_remote_dns(client.remote_dns);

    for target in targets {
        let verdict = router.decide(target).await;
        println!("{}\t{}\t{}", target, verdict.outcome, verdict.reason);
    }

    if !targets.is_empty() {
        router.metrics().print_summary();
    }
    Ok(())
}

async fn run_server(
    server: &ServerConfig,
    matcher: Arc<dyn RuleMatcher>,
    resolver: Arc<LocalResolver>,
) -> Result<()> {
    let listen_addr: SocketAddr = server.listen_addr.parse().context("无效的监听地址")?;

    let blocker = if server.enable_acl {
        BlockChecker::new(Some(matcher), server.cache_size)
    } else {
        log::info!("拦截检查: 关闭");
        BlockChecker::disabled()
    };

    let resolver_server = ResolverServer::new(
        listen_addr,
        Arc::new(PlainCodec::default()),
        Arc::new(blocker),
        resolver,
    )
    .with_max_connections(server.max_connections)
    .with_auth(server.auth.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("收到 Ctrl-C，准备关闭");
            let _ = shutdown_tx.send(true);
        }
    });

    log::info!("=== 服务器准备就绪 ===");
    resolver_server.run_with_shutdown(Some(shutdown_rx)).await?;
    resolver_server.metrics().print_summary();

    Ok(())
}
