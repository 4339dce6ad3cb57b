use std::sync::Arc;

use anyhow::Context;
use nextdesk_relay::config::{LogFormat, RelayConfig};
use nextdesk_relay::memory::MemoryMonitor;
use nextdesk_relay::server;
use nextdesk_relay::shutdown::{arm_force_exit, shutdown_signal, Shutdown};
use nextdesk_relay::state::RelayState;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    init_tracing(&config);
    install_panic_hook();

    let shutdown = Shutdown::new();
    let state = RelayState::new(&config, Arc::new(MemoryMonitor::new()), shutdown.clone());
    let reaper = state.spawn_reaper(config.room_cleanup_interval);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        cors_origins = ?config.cors_origins,
        max_payload = config.limits.max_payload,
        max_conns_per_ip = config.limits.max_conns_per_ip,
        max_global_conns = config.limits.max_global_conns,
        max_conn_rate_per_min = config.limits.max_conn_rate_per_min,
        max_msg_rate_per_sec = config.limits.max_msg_rate_per_sec,
        memory_threshold = config.limits.memory_threshold,
        "starting relay server"
    );

    let grace = config.shutdown_grace_period;
    let trigger = shutdown.clone();
    server::serve(listener, state, &config.cors_origins, async move {
        shutdown_signal().await;
        trigger.trigger();
        arm_force_exit(grace);
    })
    .await?;

    if let Err(join_error) = reaper.await {
        error!(?join_error, "room reaper task failed");
    }
    info!(open_sessions = shutdown.listeners(), "waiting for sessions to close");
    shutdown.drained().await;
    info!("server closed successfully");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        error!(panic = %panic_info, "uncaught panic, exiting");
        std::process::exit(1);
    }));
}
