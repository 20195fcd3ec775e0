use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
};
use tracing::{info, warn};

use crate::{
    codec::Message,
    registry::Registry,
    session::{Session, SessionContext},
};

/// Default cap on a single line, payload included.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Default number of lines queued for one session before it is evicted.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Longest line a session will accept. A longer line ends that session.
    pub max_line_bytes: usize,
    /// Lines a session may have waiting to be written. A session that falls
    /// further behind is evicted.
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Accepts connections and runs one session per client.
pub struct Relay {
    listener: TcpListener,
    context: SessionContext,
}

impl Relay {
    pub fn new(listener: TcpListener, registry: Arc<Registry>, config: RelayConfig) -> Self {
        // Observers that fall this far behind skip ahead; relaying is unaffected.
        let (inspector, _) = broadcast::channel(128);
        Self {
            listener,
            context: SessionContext {
                registry,
                inspector,
                config,
            },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Decoded copies of every well-formed line the relay forwards.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.context.inspector.subscribe()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, context } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&context).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(context: &SessionContext) {
    let closed = context.registry.close_all().await;
    info!(sessions = closed, "relay shutting down");
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &SessionContext,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, context).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn spawn_session(stream: TcpStream, peer: SocketAddr, context: &SessionContext) {
    if let Err(err) = stream.set_nodelay(true) {
        warn!(peer = %peer, error = ?err, "failed to disable nagle");
    }

    let (reader, writer) = stream.into_split();
    let id = context.registry.next_id();
    let (session, outbound) = Session::new(id, Some(peer), reader, writer, context.clone());
    context.registry.register(id, outbound).await;
    tokio::spawn(session.run());
}
