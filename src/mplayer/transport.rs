//! Byte plumbing between the session and the player process.
//!
//! Commands go out through the control pipe, answers come back on stdout.

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use super::protocol::SlaveCommand;

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("Control pipe closed")]
  Closed,
}

/// Writer channel message.
enum WriteMessage {
  Command(String),
  Close,
}

/// Cloneable handle queueing commands for the writer task.
///
/// Writing never waits for the pipe: lines are handed to the writer task in
/// call order and flushed there.
#[derive(Clone)]
pub struct CommandWriter {
  tx: Sender<WriteMessage>,
}

impl CommandWriter {
  /// Queue a command for the pipe.
  pub fn write(&self, cmd: &SlaveCommand) -> Result<(), TransportError> {
    let line = cmd.encode();
    log::debug!("Queueing command: {}", line);
    self
      .tx
      .try_send(WriteMessage::Command(line))
      .map_err(|_| TransportError::Closed)
  }

  /// Ask the writer task to stop after the commands already queued.
  pub fn close(&self) {
    let _ = self.tx.try_send(WriteMessage::Close);
  }

  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }
}

/// Connection to a running player: control pipe writer plus stdout reader.
pub struct Transport {
  writer: CommandWriter,
  lines: Mutex<Option<Receiver<String>>>,
  _reader_handle: JoinHandle<()>,
  _writer_handle: JoinHandle<()>,
}

impl Transport {
  /// Start the reader and writer tasks over the given streams.
  pub fn setup<R, W>(reader: R, writer: W) -> Self
  where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
  {
    let (line_tx, line_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded::<WriteMessage>();

    let reader_handle = tokio::spawn(async move {
      Self::reader_loop(reader, line_tx).await;
    });

    let writer_handle = tokio::spawn(async move {
      Self::writer_loop(writer, write_rx).await;
    });

    Self {
      writer: CommandWriter { tx: write_tx },
      lines: Mutex::new(Some(line_rx)),
      _reader_handle: reader_handle,
      _writer_handle: writer_handle,
    }
  }

  async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(reader: R, line_tx: Sender<String>) {
    log::debug!("MPlayer stdout reader started");
    let mut buf_reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
      buf.clear();
      match buf_reader.read_until(b'\n', &mut buf).await {
        Ok(0) => {
          log::debug!("MPlayer stdout closed");
          break;
        }
        Ok(_) => {
          let line = String::from_utf8_lossy(&buf);
          let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
          if trimmed.is_empty() {
            continue;
          }
          if line_tx.send(trimmed.to_string()).await.is_err() {
            break;
          }
        }
        Err(e) => {
          log::error!("MPlayer stdout read error: {}", e);
          break;
        }
      }
    }
  }

  async fn writer_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: W,
    write_rx: Receiver<WriteMessage>,
  ) {
    log::debug!("Control pipe writer started");

    while let Ok(WriteMessage::Command(mut line)) = write_rx.recv().await {
      line.push('\n');
      let sent = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
      }
      .await;

      if let Err(e) = sent {
        log::error!("Control pipe write failed for '{}': {}", line.trim_end(), e);
        break;
      }
      log::debug!("Sent: {}", line.trim_end());
    }

    log::debug!("Control pipe writer closing");
    write_rx.close();

    write_rx.close();
  }

  /// Handle for queueing commands.
  pub fn writer(&self) -> CommandWriter {
    self.writer.clone()
  }

  /// Take the stdout line stream. Only the first call gets it.
  pub fn take_lines(&self) -> Option<Receiver<String>> {
    self.lines.lock().take()
  }

  /// Close the control pipe.
  pub fn close(&self) {
    self.writer.close();
  }
}
