// Agent binary driving a local headless Chrome
//
// Connects to the coordinator named by RELAY_CONTROL_URL and runs every job
// in a Chrome tab managed by tab-relay-worker.

use anyhow::Result;
use std::sync::Arc;
use tab_relay_agent::{run_agent, WebSocketDialer};
use tab_relay_common::{AgentConfig, TabPoolConfig};
use tab_relay_worker::ChromeWorkerHost;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (RUST_LOG overrides the default level)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (config, pool_config) = load_config_from_env()?;

    let cancel = CancellationToken::new();
    let (events, worker_events) = tokio::sync::mpsc::unbounded_channel();
    let host = ChromeWorkerHost::launch(pool_config, events, cancel.clone()).await?;

    run_agent(
        config,
        Arc::new(host),
        worker_events,
        Arc::new(WebSocketDialer::default()),
        cancel,
    )
    .await
}

fn load_config_from_env() -> Result<(AgentConfig, TabPoolConfig)> {
    use std::env;
    use std::path::PathBuf;

    let mut config = AgentConfig::default();
    let mut pool = TabPoolConfig::default();

    if let Ok(url) = env::var("RELAY_CONTROL_URL") {
        config.control_url = url;
    }
    if let Ok(prefix) = env::var("RELAY_CLIENT_PREFIX") {
        config.client_id_prefix = prefix;
    }
    if let Ok(port) = env::var("RELAY_STATUS_PORT") {
        config.status_port = port.parse()?;
    }
    config.state_dir = env::var("RELAY_STATE_DIR").ok().map(PathBuf::from);

    // Blocked reports tolerated per job before MAX_RETRIES_EXCEEDED
    if let Some(budget) = env::var("RELAY_ATTEMPT_BUDGET")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
    {
        config.retry.attempt_budget = budget;
    }

    pool.headless = env::var("RELAY_HEADLESS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(true);

    // Custom browser path (e.g., /usr/bin/brave-browser for Brave)
    // If not set, uses default Chrome/Chromium auto-detection
    pool.browser_path = env::var("RELAY_BROWSER_PATH").ok().map(PathBuf::from);

    // "off" or "basic"
    pool.stealth = env::var("RELAY_STEALTH")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();

    Ok((config, pool))
}
