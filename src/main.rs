use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use assistant_realtime_server::config::ConfigSet;
use assistant_realtime_server::providers::ProviderRegistry;
use assistant_realtime_server::report;
use assistant_realtime_server::server::{self, ServerContext};

#[tokio::main]
async fn main() {
    init_tracing();

    let mut config = match ConfigSet::load_from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = ?err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    // 認証キーが未設定ならランダム生成して使用
    if config.server.auth.enabled && config.server.auth.auth_key.is_empty() {
        config.server.auth.auth_key = Uuid::new_v4().simple().to_string();
        info!("auth key not configured, generated a random key");
    }

    let config = Arc::new(config);
    info!(root = ?config.root(), "configuration loaded");

    let registry = match ProviderRegistry::from_config(&config.providers) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            error!(error = %err, "failed to build provider registry");
            std::process::exit(1);
        }
    };
    info!(
        asr = %config.providers.selected.asr,
        tts = %config.providers.selected.tts,
        llm = %config.providers.selected.llm,
        "provider registry initialized"
    );

    let report = report::spawn_sink();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let ctx = ServerContext {
        config: config.clone(),
        registry,
        report,
    };

    info!(addr = %config.server.ws_bind_addr, "starting websocket server");
    if let Err(e) = server::bind_and_run(ctx, shutdown_rx).await {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }

    info!("server exited");
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}
