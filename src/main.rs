// Balance Gateway entry point
//
// Startup order: tracing, settings, DI root, scheduler, config watcher,
// HTTP server. Fatal startup failures (unreadable config, port bind) exit
// non-zero.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

use balance_gateway::gateway::config_watcher::ConfigWatcher;
use balance_gateway::gateway::handlers::AppState;
use balance_gateway::gateway::scheduler::start_scheduler;
use balance_gateway::gateway::server::GatewayServer;
use balance_gateway::models::config::AppSettings;
use balance_gateway::AppContext;

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let file_appender = tracing_appender::rolling::daily("logs", "gateway.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BALANCE_GATEWAY_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.json"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_tracing();

    let path = config_path();
    let settings = AppSettings::load(&path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("cannot start without a readable config at {}", path.display()))?;

    let (host, port, watch_interval) = (
        settings.host.clone(),
        settings.port,
        settings.config_check_interval_secs,
    );

    let ctx = AppContext::new(settings, path).await;

    start_scheduler(ctx.clone());
    ConfigWatcher::new(&ctx.config_path, Duration::from_secs(watch_interval.max(1)))
        .spawn(ctx.clone());

    let state = AppState::new(ctx);
    let (_server, handle) = GatewayServer::start(&host, port, state)
        .await
        .map_err(anyhow::Error::msg)?;

    handle.await.context("server task failed")?;
    Ok(())
}
