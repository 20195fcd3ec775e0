use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::relay::{DEFAULT_MAX_LINE_BYTES, DEFAULT_OUTBOUND_CAPACITY, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, fanning every received line out to all connected clients.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Longest line accepted from a client, payload included.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Lines queued for a slow client before it is disconnected.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,
}

impl RelayArgs {
    pub fn config(&self) -> RelayConfig {
        RelayConfig {
            max_line_bytes: self.max_line_bytes,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Relay to connect to, as host:port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: String,

    /// Nickname shown next to every message.
    #[arg(long)]
    pub nickname: String,

    /// Hobby shown next to the nickname.
    #[arg(long, default_value = "")]
    pub hobby: String,

    /// Image file sent as the avatar with every message.
    #[arg(long)]
    pub avatar: PathBuf,

    /// Directory where received files and images are saved.
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}
