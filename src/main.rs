//! pairlink service binary.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pairlink::config::Config;
use pairlink::control::{ControlPlane, HttpControlPlane};
use pairlink::notify::{HttpNotificationSink, NotificationSink};
use pairlink::pairing::PairingRegistry;
use pairlink::server::{AppState, PairingServer, router};
use pairlink::store::{CredentialStore, HttpKvStore, KvStore};
use pairlink::transport::{GatewayTransport, Transport};

#[derive(Parser)]
#[command(name = "pairlink", about = "Pairing control plane for messaging-automation sessions", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pairing service.
    Serve {
        /// Emit logs as JSON lines instead of human-readable text.
        #[arg(long, env = "PAIRLINK_LOG_JSON")]
        json_logs: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { json_logs } => {
            init_tracing(json_logs);
            serve().await
        }
    }
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pairlink=info,tower_http=info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let kv: Arc<dyn KvStore> =
        Arc::new(HttpKvStore::new(&config.kv_url, config.kv_token.clone()));
    let store = Arc::new(CredentialStore::load(kv, config.coalesce_window).await?);
    let flusher = store.spawn_flusher(Duration::from_secs(1));

    let transport: Arc<dyn Transport> = Arc::new(GatewayTransport::new(
        &config.transport_url,
        config.shared_secret.clone(),
    ));
    let control: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
        &config.control_plane_url,
        config.shared_secret.clone(),
    ));
    let sink: Arc<dyn NotificationSink> = Arc::new(HttpNotificationSink::new(&config.notify_url));

    let registry = Arc::new(PairingRegistry::new(
        transport,
        Arc::clone(&store),
        Arc::clone(&control),
        sink,
        config.pairing.clone(),
        config.session_prefix.clone(),
    ));

    let state = AppState {
        registry: Arc::clone(&registry),
        control,
    };
    let mut server = PairingServer::new(config.bind_addr, router(state, config.shared_secret.clone()));
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    server.shutdown().await;
    registry.shutdown().await;
    flusher.abort();

    Ok(())
}
