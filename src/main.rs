//! Binary entry-point for the proxy load balancer.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use poolrelay::api::{self, ApiState};
use poolrelay::config;
use poolrelay::listener::Listener;
use poolrelay::router::Router;
use poolrelay::telemetry::RequestLog;
use poolrelay::upstream::DEFAULT_TIMEOUT;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load CLI flags + YAML config ────────────────────────────────────────
    let (cli, cfg) = config::load_config()?;

    // ── 2. Init structured logging (env -> overrides flag) ─────────────────────
    // e.g. RUST_LOG=debug cargo run
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Configuration loaded from {:?}", cli.config);

    // ── 3. Materialize the proxy registry and the rule table ───────────────────
    let pools = config::build_registry(&cfg);
    let rules = config::build_rules(&cfg)?;
    let router = Arc::new(Router::new(pools, rules));
    let log = Arc::new(RequestLog::new(cfg.server.log_requests));

    info!("Pools    : {}", router.pool_count());
    info!("Proxies  : {}", router.proxy_count());
    info!("Listeners: {:?}", router.listener_ports());

    // ── 4. Start the read-only introspection API ───────────────────────────────
    let api_host = cli.host.clone().unwrap_or_else(|| cfg.server.host.clone());
    let api_port = cli.port.unwrap_or(cfg.server.api_port);
    let api_state = ApiState {
        router: router.clone(),
        log: log.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_host, api_port, api_state).await {
            error!("API exited with error: {:?}", e);
        }
    });

    // ── 5. One listener per distinct rule port ─────────────────────────────────
    let mut listeners = Vec::new();
    for port in router.listener_ports() {
        let listener = Listener::new(
            cfg.server.host.clone(),
            port,
            router.clone(),
            log.clone(),
            DEFAULT_TIMEOUT,
        );
        listener.start().await?;
        listeners.push(listener);
    }

    // ── 6. Serve until Ctrl-C, then drain every listener ───────────────────────
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received (Ctrl-C). Servers shutting down.");
    for listener in &listeners {
        listener.stop().await;
    }

    Ok(())
}
