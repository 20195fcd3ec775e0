use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::broadcast,
};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use crate::{
    codec::{self, Message},
    registry::{Outbound, Outbox, Registry, SessionId},
    relay::RelayConfig,
};

/// Everything a session shares with the rest of the relay.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<Registry>,
    /// Receives every line that decodes, for consumers outside the relay.
    pub inspector: broadcast::Sender<Message>,
    pub config: RelayConfig,
}

type LineReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, AnyDelimiterCodec>;

/// Read side of one live connection.
///
/// The write side lives in a separate task fed by the [`Outbound`] returned
/// from [`Session::new`]. Dropping that outbound (unregistering) lets the task
/// flush and close the connection; eviction closes it without flushing.
pub struct Session {
    id: SessionId,
    peer: Option<SocketAddr>,
    reader: LineReader,
    context: SessionContext,
}

impl Session {
    /// Wraps the two halves of a connection and starts its writer task.
    ///
    /// The peer is not validated. The caller registers the returned outbound
    /// and then drives [`Session::run`].
    pub fn new<R, W>(
        id: SessionId,
        peer: Option<SocketAddr>,
        reader: R,
        writer: W,
        context: SessionContext,
    ) -> (Self, Outbound)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        // Lines are split on raw bytes so that invalid UTF-8 is relayed lossily
        // instead of ending the session.
        let codec = AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            context.config.max_line_bytes,
        );
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let (outbound, outbox) = Outbound::channel(peer, context.config.outbound_capacity);

        let writer = FramedWrite::new(writer, LinesCodec::new());
        tokio::spawn(drain_outbox(id, writer, outbox));

        let session = Self {
            id,
            peer,
            reader: FramedRead::new(reader, codec),
            context,
        };
        (session, outbound)
    }

    /// Relays every line read from the connection until EOF or a read error,
    /// then removes this session from the registry.
    pub async fn run(mut self) {
        info!(session = self.id, peer = ?self.peer, "session connected");

        if let Err(err) = self.relay_lines().await {
            warn!(session = self.id, peer = ?self.peer, error = ?err, "session read failed");
        }

        self.context.registry.unregister(self.id).await;
        info!(session = self.id, peer = ?self.peer, "session disconnected");
    }

    async fn relay_lines(&mut self) -> Result<()> {
        while let Some(chunk) = self.reader.next().await {
            let chunk = chunk.context("failed to read line from client")?;
            let line = String::from_utf8_lossy(&chunk);
            let line = line.trim_end_matches('\r');
            self.inspect(line);
            self.context.registry.broadcast(line).await;
        }
        Ok(())
    }

    // Decoding is for observers only; the raw line is relayed either way.
    fn inspect(&self, line: &str) {
        match codec::decode(line) {
            Ok(message) => {
                debug!(
                    session = self.id,
                    kind = %message.kind,
                    nickname = %message.nickname,
                    payload_len = message.payload.len(),
                    "relaying message"
                );
                let _ = self.context.inspector.send(message);
            }
            Err(err) => debug!(session = self.id, error = %err, "relaying undecodable line"),
        }
    }
}

async fn drain_outbox<W>(id: SessionId, writer: FramedWrite<W, LinesCodec>, mut outbox: Outbox)
where
    W: AsyncWrite + Unpin,
{
    let evicted = outbox.evicted();
    select! {
        _ = evicted => debug!(session = id, "dropping connection of evicted session"),
        _ = write_lines(id, writer, &mut outbox) => {}
    }
}

async fn write_lines<W>(id: SessionId, mut writer: FramedWrite<W, LinesCodec>, outbox: &mut Outbox)
where
    W: AsyncWrite + Unpin,
{
    // `send` flushes after every line so peers see it right away.
    while let Some(line) = outbox.recv().await {
        if let Err(err) = writer.send(line).await {
            debug!(session = id, error = ?err, "failed to deliver line to client");
            return;
        }
    }

    if let Err(err) = SinkExt::<Arc<str>>::close(&mut writer).await {
        debug!(session = id, error = ?err, "failed to close client writer");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        id: SessionId,
    }

    fn context(registry: &Arc<Registry>) -> SessionContext {
        let (inspector, _) = broadcast::channel(16);
        SessionContext {
            registry: Arc::clone(registry),
            inspector,
            config: RelayConfig::default(),
        }
    }

    async fn connect(context: &SessionContext) -> Peer {
        connect_with_buffer(context, 64 * 1024).await
    }

    async fn connect_with_buffer(context: &SessionContext, buffer: usize) -> Peer {
        let (client, server) = tokio::io::duplex(buffer);
        let (server_read, server_write) = tokio::io::split(server);
        let id = context.registry.next_id();
        let (session, outbound) =
            Session::new(id, None, server_read, server_write, context.clone());
        context.registry.register(id, outbound).await;
        tokio::spawn(session.run());

        let (reader, writer) = tokio::io::split(client);
        Peer {
            reader: BufReader::new(reader),
            writer,
            id,
        }
    }

    async fn read_line(peer: &mut Peer) -> Option<String> {
        let mut line = String::new();
        let bytes = timeout(Duration::from_secs(1), peer.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for line")
            .expect("read line");
        (bytes > 0).then(|| line.trim_end_matches('\n').to_string())
    }

    #[tokio::test]
    async fn line_is_echoed_to_everyone_including_sender() {
        let registry = Arc::new(Registry::new());
        let context = context(&registry);
        let mut alice = connect(&context).await;
        let mut bob = connect(&context).await;

        let line = "TEXT|||[t]|||alice|||x|||av|||hi";
        alice.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();

        assert_eq!(read_line(&mut alice).await.as_deref(), Some(line));
        assert_eq!(read_line(&mut bob).await.as_deref(), Some(line));
    }

    #[tokio::test]
    async fn malformed_line_is_still_relayed() {
        let registry = Arc::new(Registry::new());
        let context = context(&registry);
        let mut inspected = context.inspector.subscribe();
        let mut alice = connect(&context).await;
        let mut bob = connect(&context).await;

        alice
            .writer
            .write_all(b"only|||three|||fields\nTEXT|||[t]|||alice|||x|||av|||ok\n")
            .await
            .unwrap();

        assert_eq!(
            read_line(&mut bob).await.as_deref(),
            Some("only|||three|||fields")
        );
        assert_eq!(
            read_line(&mut bob).await.as_deref(),
            Some("TEXT|||[t]|||alice|||x|||av|||ok")
        );

        // Only the decodable line reaches observers.
        let message = inspected.recv().await.expect("decoded message");
        assert_eq!(message.payload, "ok");
    }

    #[tokio::test]
    async fn eof_unregisters_the_session_and_closes_its_writer() {
        let registry = Arc::new(Registry::new());
        let context = context(&registry);
        let mut alice = connect(&context).await;
        let bob = connect(&context).await;

        alice.writer.shutdown().await.unwrap();

        assert_eq!(read_line(&mut alice).await, None);
        timeout(Duration::from_secs(1), async {
            while registry.contains(alice.id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session removed after EOF");
        assert!(registry.contains(bob.id).await);
    }

    #[tokio::test]
    async fn oversized_line_ends_only_that_session() {
        let registry = Arc::new(Registry::new());
        let mut context = context(&registry);
        context.config.max_line_bytes = 16;
        let mut alice = connect(&context).await;
        let mut bob = connect(&context).await;

        alice.writer.write_all(&[b'a'; 64]).await.unwrap();
        alice.writer.write_all(b"\n").await.unwrap();
        assert_eq!(read_line(&mut alice).await, None);

        bob.writer.write_all(b"short\n").await.unwrap();
        assert_eq!(read_line(&mut bob).await.as_deref(), Some("short"));
    }

    #[tokio::test]
    async fn invalid_utf8_is_relayed_lossily_and_keeps_the_session() {
        let registry = Arc::new(Registry::new());
        let context = context(&registry);
        let mut alice = connect(&context).await;
        let mut bob = connect(&context).await;

        alice
            .writer
            .write_all(b"TEXT|||[t]|||caf\xe9|||x|||av|||hi\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut bob).await.as_deref(),
            Some("TEXT|||[t]|||caf\u{FFFD}|||x|||av|||hi")
        );

        alice.writer.write_all(b"after\n").await.unwrap();
        assert_eq!(read_line(&mut bob).await.as_deref(), Some("after"));
        assert!(registry.contains(alice.id).await);
    }

    #[tokio::test]
    async fn stalled_peer_is_evicted_while_others_keep_receiving() {
        let registry = Arc::new(Registry::new());
        let mut context = context(&registry);
        context.config.outbound_capacity = 4;
        let mut alice = connect(&context).await;
        let mut bob = connect(&context).await;
        // Never read from, so its writer blocks once the pipe is full.
        let stalled = connect_with_buffer(&context, 256).await;

        for round in 0..100 {
            let line = format!("TEXT|||[t]|||alice|||x|||av|||{round:04}");
            alice.writer.write_all(format!("{line}\n").as_bytes()).await.unwrap();
            assert_eq!(read_line(&mut alice).await.as_deref(), Some(line.as_str()));
            assert_eq!(read_line(&mut bob).await.as_deref(), Some(line.as_str()));
        }

        assert!(!registry.contains(stalled.id).await);
        assert!(registry.contains(alice.id).await);
        assert!(registry.contains(bob.id).await);
    }
}
