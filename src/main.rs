use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sockjs_server::{ServerConfig, SessionHandle, SessionHandler};

/// SockJS echo server: every payload a client posts comes straight back on
/// its own session, over whichever transport the client picked.
#[derive(Parser, Debug)]
#[command(name = "sockjs-echo")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Mount prefix for the endpoint tree.
    #[arg(long, default_value = "/echo")]
    prefix: String,

    /// Disable the websocket transports (forces HTTP fallbacks).
    #[arg(long)]
    no_websocket: bool,

    /// Idle seconds before an abandoned session is evicted.
    #[arg(long, default_value_t = 5)]
    disconnect_timeout: u64,
}

struct Echo;

#[async_trait::async_trait]
impl SessionHandler for Echo {
    async fn handle(&self, mut session: SessionHandle) {
        tracing::info!(session_id = %session.id(), "Session opened");
        while let Some(payload) = session.recv().await {
            if session.send(payload).is_err() {
                break;
            }
        }
        tracing::info!(session_id = %session.id(), "Session finished");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        port: args.port,
        prefix: args.prefix,
        websocket_enabled: !args.no_websocket,
        disconnect_timeout: Duration::from_secs(args.disconnect_timeout),
        ..Default::default()
    };

    let handle = sockjs_server::start(config, Arc::new(Echo))
        .await
        .expect("Failed to start server");
    tracing::info!(port = handle.port, "Echo server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");
    tracing::info!("Shutting down");
}
