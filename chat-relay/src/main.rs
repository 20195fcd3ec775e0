use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use chat_relay::{
    cli::{Cli, Command},
    client,
    registry::Registry,
    relay::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => {
            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let relay = Relay::new(listener, Arc::new(Registry::new()), args.config());
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = relay.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
