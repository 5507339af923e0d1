use std::sync::Arc;

use relay::config::RelayConfig;
use relay::discovery::HttpHealthProbe;
use relay::node::{NodeRole, spawn_node};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = RelayConfig::from_env();
    tracing::info!(
        addr = %config.addr(),
        workspace = %config.workspace.workspace_id,
        root = %config.workspace.root_path.display(),
        "relay starting"
    );

    let probe = Arc::new(HttpHealthProbe::new(config.probe_timeout));
    let node = spawn_node(config, probe);
    let mut role = node.watch_role();

    loop {
        tokio::select! {
            changed = role.changed() => {
                if changed.is_err() || *role.borrow() == NodeRole::Stopped {
                    break;
                }
                tracing::info!(role = ?*role.borrow(), "relay role");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    if let Err(e) = node.shutdown().await {
        tracing::error!(error = %e, "relay stopped with error");
        std::process::exit(1);
    }
}
