use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncRead, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    codec::{FrameCodec, FrameError},
    message::Message,
};

/// Lazy stream of messages relayed from other clients. Ends when the relay
/// closes the connection.
pub type MessageStream = FramedRead<OwnedReadHalf, FrameCodec>;

/// Sending half of a relay connection.
pub struct MessageSender {
    frames: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl MessageSender {
    pub async fn send(&mut self, message: &Message) -> Result<(), FrameError> {
        self.frames.send(message).await
    }

    /// Flushes and half-closes the connection; the relay treats this as the
    /// client leaving.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        SinkExt::<&Message>::close(&mut self.frames).await
    }
}

/// Connects to a relay and splits the connection into its two directions.
pub async fn connect(addr: SocketAddr) -> Result<(MessageSender, MessageStream)> {
    connect_with_codec(addr, FrameCodec::new()).await
}

pub async fn connect_with_codec(
    addr: SocketAddr,
    codec: FrameCodec,
) -> Result<(MessageSender, MessageStream)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (reader, writer) = stream.into_split();

    let sender = MessageSender {
        frames: FramedWrite::new(writer, codec.clone()),
    };
    Ok((sender, FramedRead::new(reader, codec)))
}

/// Interactive terminal client.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut sender, mut inbound) = connect(args.server).await?;
    info!("connected to {}", args.server);
    write_stdout(&format!("*** connected to {}", args.server)).await?;

    let mut view = View::new(args.save_dir);
    let mut stdin = input_lines(tokio::io::stdin());

    loop {
        select! {
            relayed = inbound.next() => {
                if !handle_relayed_message(relayed, &mut view).await? {
                    break;
                }
            }
            line = stdin.next() => {
                if !handle_stdin_input(line, &mut sender).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = sender.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
    Ok(())
}

async fn handle_relayed_message(
    relayed: Option<Result<Message, FrameError>>,
    view: &mut View,
) -> Result<bool> {
    match relayed {
        Some(Ok(message)) => {
            view.render(message).await?;
            Ok(true)
        }
        Some(Err(err)) => {
            write_stderr(&format!("!!! connection error: {err}")).await?;
            Ok(false)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

/// Splits terminal input into lines. Partially read lines stay buffered in
/// the codec when a `select!` drops the pending `next()`.
fn input_lines<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new())
}

async fn handle_stdin_input(
    line: Option<Result<String, LinesCodecError>>,
    sender: &mut MessageSender,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    let line = line.context("failed to read from stdin")?;

    let text = line.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let message = match text.strip_prefix("/image ") {
        Some(path) => match read_image(Path::new(path.trim())).await {
            Ok(message) => message,
            Err(err) => {
                write_stderr(&format!("!!! {err:#}")).await?;
                return Ok(true);
            }
        },
        None => Message::text(text),
    };

    sender.send(&message).await?;
    Ok(true)
}

async fn read_image(path: &Path) -> Result<Message> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(Message::image(bytes))
}

/// Terminal rendering of relayed messages.
struct View {
    save_dir: Option<PathBuf>,
    images_received: usize,
}

impl View {
    fn new(save_dir: Option<PathBuf>) -> Self {
        Self {
            save_dir,
            images_received: 0,
        }
    }

    async fn render(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Text(text) => write_stdout(&format!("> {text}")).await?,
            Message::Image(bytes) => {
                self.images_received += 1;
                match &self.save_dir {
                    Some(dir) => {
                        let path = dir.join(format!("image-{}.bin", self.images_received));
                        tokio::fs::write(&path, &bytes)
                            .await
                            .with_context(|| format!("failed to save image to {}", path.display()))?;
                        write_stdout(&format!("[image, {} bytes, saved to {}]", bytes.len(), path.display()))
                            .await?;
                    }
                    None => write_stdout(&format!("[image, {} bytes]", bytes.len())).await?,
                }
            }
        }
        Ok(())
    }
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
