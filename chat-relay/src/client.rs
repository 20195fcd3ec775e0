use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{self, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    codec::{self, Message, MessageKind},
    compose::Compose,
    profile::Profile,
    relay::DEFAULT_MAX_LINE_BYTES,
};

type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let profile = Profile::load(&args.nickname, &args.hobby, &args.avatar).await?;
    let (mut reader, mut writer) = establish_connection(&args.server).await?;
    write_stdout(&format!("*** connected as {}", profile.nickname())).await?;

    let mut downloads = Downloads::new(args.download_dir);
    // Framed so that a half-typed line is kept when a relay line wins the select.
    let mut stdin = FramedRead::new(tokio::io::stdin(), LinesCodec::new());

    run_client_loop(
        &profile,
        &mut reader,
        &mut writer,
        &mut stdin,
        &mut downloads,
    )
    .await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(server: &str) -> Result<(LineReader, LineWriter)> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {}", server);

    let (reader, writer) = stream.into_split();
    Ok((
        FramedRead::new(reader, LinesCodec::new_with_max_length(DEFAULT_MAX_LINE_BYTES)),
        FramedWrite::new(writer, LinesCodec::new()),
    ))
}

async fn run_client_loop<R, W, I>(
    profile: &Profile,
    reader: &mut R,
    writer: &mut W,
    input: &mut I,
    downloads: &mut Downloads,
) -> Result<()>
where
    R: Stream<Item = Result<String, LinesCodecError>> + Unpin,
    W: Sink<String, Error = LinesCodecError> + Unpin,
    I: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    loop {
        select! {
            server_line = reader.next() => {
                if !handle_server_line(server_line, downloads).await? {
                    break;
                }
            }
            input_line = input.next() => {
                if !handle_stdin_input(input_line, profile, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(
    line: Option<Result<String, LinesCodecError>>,
    downloads: &mut Downloads,
) -> Result<bool> {
    let Some(line) = line else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };
    let line = line.context("failed to read from relay")?;

    // Lines that do not decode, and kinds we do not know, are skipped.
    let Ok(message) = codec::decode(&line) else {
        return Ok(true);
    };
    render_message(&message, downloads).await?;
    Ok(true)
}

async fn handle_stdin_input<W>(
    input: Option<Result<String, LinesCodecError>>,
    profile: &Profile,
    writer: &mut W,
) -> Result<bool>
where
    W: Sink<String, Error = LinesCodecError> + Unpin,
{
    let Some(input) = input else {
        return Ok(false);
    };
    let input = input.context("failed to read from stdin")?;

    let compose = match Compose::parse(&input) {
        Ok(Some(compose)) => compose,
        Ok(None) => return Ok(true),
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    let message = match compose {
        Compose::Quit => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Compose::Text(text) => profile.text_message(&timestamp(), &text),
        Compose::File(path) => match read_attachment(&path).await {
            Ok(bytes) => profile.binary_message(MessageKind::File, &timestamp(), &bytes),
            Err(err) => {
                write_stderr(&format!("!!! {err:#}")).await?;
                return Ok(true);
            }
        },
        Compose::Image(path) => match read_attachment(&path).await {
            Ok(bytes) => profile.binary_message(MessageKind::Image, &timestamp(), &bytes),
            Err(err) => {
                write_stderr(&format!("!!! {err:#}")).await?;
                return Ok(true);
            }
        },
    };

    send_message(writer, &message).await?;
    Ok(true)
}

async fn send_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: Sink<String, Error = LinesCodecError> + Unpin,
{
    let line = match codec::encode(message) {
        Ok(line) => line,
        Err(err) => {
            write_stderr(&format!("!!! cannot send message: {err}")).await?;
            return Ok(());
        }
    };
    writer
        .send(line)
        .await
        .context("failed to send message to relay")
}

async fn read_attachment(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut LineWriter) {
    if let Err(error) = SinkExt::<String>::close(writer).await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_message(message: &Message, downloads: &mut Downloads) -> io::Result<()> {
    if message.kind == MessageKind::Text {
        return write_stdout(&format!("{}: {}", sender(message), message.payload)).await;
    }
    if !message.kind.is_binary() {
        return Ok(());
    }

    let bytes = match message.payload_bytes() {
        Ok(bytes) => bytes,
        Err(_) => {
            return write_stderr(&format!(
                "!!! {} sent a corrupt attachment",
                message.nickname
            ))
            .await;
        }
    };
    let saved = downloads.save(message, &bytes).await;
    write_stdout(&describe_attachment(message, bytes.len(), saved.as_deref())).await
}

fn sender(message: &Message) -> String {
    if message.hobby.is_empty() {
        format!("[{}] {}", message.time, message.nickname)
    } else {
        format!("[{}] {} ({})", message.time, message.nickname, message.hobby)
    }
}

fn describe_attachment(message: &Message, size: usize, saved: Option<&Path>) -> String {
    let what = match message.kind {
        MessageKind::Image => "an image",
        _ => "a file",
    };
    let mut line = format!("{} sent {what} ({size} bytes)", sender(message));
    if let Some(path) = saved {
        line.push_str(&format!(", saved to {}", path.display()));
    }
    line
}

/// Writes received attachments to disk when a download directory is set.
struct Downloads {
    dir: Option<PathBuf>,
    received: usize,
}

impl Downloads {
    fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, received: 0 }
    }

    async fn save(&mut self, message: &Message, bytes: &[u8]) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        self.received += 1;
        let path = dir.join(attachment_name(self.received, message));

        match tokio::fs::write(&path, bytes).await {
            Ok(()) => Some(path),
            Err(error) => {
                warn!(?error, path = %path.display(), "failed to save attachment");
                None
            }
        }
    }
}

fn attachment_name(index: usize, message: &Message) -> String {
    let nickname: String = message
        .nickname
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let extension = match message.kind {
        MessageKind::Image => "img",
        _ => "bin",
    };
    format!("{index:04}-{nickname}.{extension}")
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
