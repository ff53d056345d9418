//! High-level MPlayer facade with chainable commands and awaitable queries.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{ErrorReport, EventBus, EventKind, Outcome, PlayerEvent};
use super::process::{
  cleanup_fifo, create_fifo, health_check, open_fifo_writer, spawn_mplayer, ProcessError,
};
use super::protocol::SeekMode;
use super::session::{Action, Query, Session, SessionInfo, Status};
use super::transport::Transport;
use crate::config::{ConfigError, InitialState, PlayerConfig};

#[derive(Error, Debug)]
pub enum PlayerError {
  #[error("File '{0}' not found")]
  FileNotFound(PathBuf),
  #[error("No file set. Use set_file() before controlling playback")]
  NoFile,
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
  #[error("Session ended before the request was answered")]
  SessionEnded,
  #[error("Query timeout")]
  Timeout,
}

/// Attempts at opening the control pipe before giving up.
const FIFO_OPEN_RETRIES: u32 = 10;

/// Live session plus the handles needed to tear it down.
struct ActiveSession {
  session: Arc<Session>,
  transport: Transport,
  kill: CancellationToken,
  watcher: Option<JoinHandle<()>>,
}

/// High-level MPlayer client.
///
/// Commands return `&Self` so they chain; their outcome is reported through
/// events. Queries return the value itself.
pub struct Mplayer {
  config: Arc<RwLock<PlayerConfig>>,
  events: EventBus,
  active: Arc<Mutex<Option<ActiveSession>>>,
}

impl Mplayer {
  /// Create a new client. Nothing is spawned until a file is set.
  pub fn new(config: PlayerConfig) -> Self {
    Self {
      config: Arc::new(RwLock::new(config)),
      events: EventBus::new(),
      active: Arc::new(Mutex::new(None)),
    }
  }

  /// Update configuration (takes effect on next file).
  pub fn set_config(&self, config: PlayerConfig) -> Result<(), PlayerError> {
    config.validate()?;
    *self.config.write() = config;
    Ok(())
  }

  pub fn config(&self) -> PlayerConfig {
    self.config.read().clone()
  }

  /// Receive the listed events, across every file played by this client.
  pub fn subscribe(&self, kinds: &[EventKind]) -> Receiver<PlayerEvent> {
    self.events.subscribe(kinds)
  }

  pub fn subscribe_all(&self) -> Receiver<PlayerEvent> {
    self.events.subscribe_all()
  }

  /// Start a fresh player on `file` with the configured initial state.
  pub async fn set_file(&self, file: impl AsRef<Path>) -> Result<&Self, PlayerError> {
    self.set_file_with(file, InitialState::default()).await
  }

  /// Start a fresh player on `file`, with `overrides` merged over the configured initial state.
  ///
  /// Any previous player is shut down first.
  pub async fn set_file_with(
    &self,
    file: impl AsRef<Path>,
    overrides: InitialState,
  ) -> Result<&Self, PlayerError> {
    let file = file.as_ref();
    if !file.exists() {
      return Err(PlayerError::FileNotFound(file.to_path_buf()));
    }

    let config = self.config.read().clone();
    let initial = config.initial.merged(&overrides);
    initial.validate()?;

    self.shutdown().await;

    let mplayer = health_check(config.mplayer_path())?;
    let fifo = config.fifo_path();
    create_fifo(&fifo)?;

    let mut child = match spawn_mplayer(&mplayer, &fifo, file, &config.mplayer_args) {
      Ok(child) => child,
      Err(e) => {
        cleanup_fifo(&fifo);
        return Err(self.fail(e));
      }
    };

    let stdout = match child.stdout.take() {
      Some(stdout) => stdout,
      None => {
        let _ = child.start_kill();
        cleanup_fifo(&fifo);
        return Err(self.fail(ProcessError::SpawnFailed(std::io::Error::other(
          "MPlayer stdout not captured",
        ))));
      }
    };

    let pipe = match open_fifo_writer(&fifo, FIFO_OPEN_RETRIES).await {
      Ok(pipe) => pipe,
      Err(e) => {
        let _ = child.start_kill();
        cleanup_fifo(&fifo);
        return Err(self.fail(e));
      }
    };

    let transport = Transport::setup(stdout, pipe);
    let session = self.install(file, transport, initial);
    self.watch_process(session, child, fifo);

    Ok(self)
  }

  /// Report a failure to start as an `error` event as well as to the caller.
  fn fail(&self, e: ProcessError) -> PlayerError {
    log::error!("Failed to start MPlayer: {}", e);
    self.events.emit(PlayerEvent::Error(ErrorReport {
      status: Outcome::Error,
      error: e.to_string(),
    }));
    e.into()
  }

  /// Bind a new session to an already running player.
  pub(crate) fn install(
    &self,
    file: &Path,
    transport: Transport,
    initial: InitialState,
  ) -> Arc<Session> {
    if let Some(previous) = self.active.lock().take() {
      previous.transport.close();
      previous.kill.cancel();
    }

    let session = Session::new(file.to_path_buf(), transport.writer(), self.events.clone());

    if let Some(lines) = transport.take_lines() {
      let session = session.clone();
      tokio::spawn(async move {
        futures_util::pin_mut!(lines);
        while let Some(line) = lines.next().await {
          session.handle_line(&line);
        }
        log::debug!("[{}] Line stream ended", session.id());
      });
    }

    if let Some(interval) = self.config.read().update_interval() {
      self.spawn_poll_supervisor(session.clone(), interval);
    }

    session.start(initial_actions(&initial));

    *self.active.lock() = Some(ActiveSession {
      session: session.clone(),
      transport,
      kill: CancellationToken::new(),
      watcher: None,
    });

    session
  }

  /// Wait for the player to exit and report it to the session.
  fn watch_process(&self, session: Arc<Session>, mut child: Child, fifo: PathBuf) {
    let mut guard = self.active.lock();
    let Some(active) = guard.as_mut() else {
      return;
    };
    let kill = active.kill.clone();

    active.watcher = Some(tokio::spawn(async move {
      let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
          log::info!("[{}] Killing MPlayer (pid: {:?})", session.id(), child.id());
          if let Err(e) = child.start_kill() {
            log::error!("kill() failed: {}", e);
          }
          child.wait().await
        }
      };

      match status {
        Ok(status) => session.handle_exit(status.into()),
        Err(e) => session.handle_error(e.to_string()),
      }
      cleanup_fifo(&fifo);
    }));
  }

  /// Follow the session's play/stop events and keep the time position fresh while playing.
  fn spawn_poll_supervisor(&self, session: Arc<Session>, interval: Duration) {
    let events = session.subscribe(&[
      EventKind::Play,
      EventKind::Stop,
      EventKind::End,
      EventKind::Error,
    ]);
    let shutdown = session.shutdown_token();

    tokio::spawn(async move {
      let mut poll: Option<CancellationToken> = None;

      loop {
        tokio::select! {
          biased;
          _ = shutdown.cancelled() => break,
          event = events.recv() => match event {
            Ok(PlayerEvent::Play(_)) => {
              if poll.is_none() {
                let token = shutdown.child_token();
                tokio::spawn(poll_time_position(session.clone(), interval, token.clone()));
                poll = Some(token);
              }
            }
            Ok(PlayerEvent::Stop(_)) => {
              if let Some(token) = poll.take() {
                token.cancel();
              }
            }
            _ => break,
          }
        }
      }

      if let Some(token) = poll.take() {
        token.cancel();
      }
    });
  }

  fn session(&self) -> Result<Arc<Session>, PlayerError> {
    let guard = self.active.lock();
    guard
      .as_ref()
      .map(|active| active.session.clone())
      .ok_or(PlayerError::NoFile)
  }

  /// Issue a command and get a future resolved with the state once it went out.
  pub fn send(
    &self,
    action: Action,
  ) -> Result<impl Future<Output = Result<SessionInfo, PlayerError>>, PlayerError> {
    let rx = self.session()?.dispatch(action);
    Ok(async move { rx.await.map_err(|_| PlayerError::SessionEnded) })
  }

  fn fire(&self, action: Action) -> Result<&Self, PlayerError> {
    let _ = self.session()?.dispatch(action);
    Ok(self)
  }

  /// Start playback.
  pub fn play(&self) -> Result<&Self, PlayerError> {
    self.fire(Action::Play)
  }

  /// Toggle pause.
  pub fn pause(&self) -> Result<&Self, PlayerError> {
    self.fire(Action::Pause)
  }

  pub fn stop(&self) -> Result<&Self, PlayerError> {
    self.fire(Action::Stop)
  }

  /// Seek relative to the current position, in seconds.
  pub fn seek(&self, offset: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Seek {
      value: offset,
      mode: SeekMode::Relative,
    })
  }

  /// Seek to a percentage of the length.
  pub fn set_position(&self, percent: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Seek {
      value: percent,
      mode: SeekMode::Percentage,
    })
  }

  /// Seek to an absolute time in seconds.
  pub fn set_time(&self, seconds: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Seek {
      value: seconds,
      mode: SeekMode::Absolute,
    })
  }

  /// Toggle mute.
  pub fn mute(&self) -> Result<&Self, PlayerError> {
    self.fire(Action::Mute(None))
  }

  pub fn set_mute(&self, muted: bool) -> Result<&Self, PlayerError> {
    self.fire(Action::Mute(Some(muted)))
  }

  /// Set volume (0-100).
  pub fn set_volume(&self, volume: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Volume {
      value: volume,
      absolute: true,
    })
  }

  pub fn increase_volume(&self, step: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Volume {
      value: step,
      absolute: false,
    })
  }

  pub fn decrease_volume(&self, step: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Volume {
      value: -step,
      absolute: false,
    })
  }

  /// Loop the file (0 = forever, -1 = off).
  pub fn set_loop(&self, times: i32) -> Result<&Self, PlayerError> {
    self.fire(Action::Loop(times))
  }

  pub fn set_speed(&self, speed: f64) -> Result<&Self, PlayerError> {
    self.fire(Action::Speed(speed))
  }

  /// Ask the player to quit. The session ends with the process.
  pub fn quit(&self) -> Result<&Self, PlayerError> {
    self.fire(Action::Quit)
  }

  /// Current status.
  pub fn status(&self) -> Result<Status, PlayerError> {
    Ok(self.session()?.status())
  }

  /// Current session snapshot.
  pub fn info(&self) -> Result<SessionInfo, PlayerError> {
    Ok(self.session()?.info())
  }

  /// Length of the file in seconds.
  pub async fn time_length(&self) -> Result<f64, PlayerError> {
    self.ask(Query::Duration).await
  }

  /// Current time position in seconds.
  pub async fn time_position(&self) -> Result<f64, PlayerError> {
    self.ask(Query::Time).await
  }

  /// Current volume (0-100).
  pub async fn volume(&self) -> Result<f64, PlayerError> {
    self.ask(Query::Volume).await
  }

  async fn ask(&self, query: Query) -> Result<f64, PlayerError> {
    let rx = self.session()?.query(query);
    let timeout = self.config.read().query_timeout();

    match timeout {
      Some(limit) => match tokio::time::timeout(limit, rx).await {
        Ok(answer) => answer.map_err(|_| PlayerError::SessionEnded),
        Err(_) => {
          log::warn!("{:?} query unanswered after {:?}", query, limit);
          Err(PlayerError::Timeout)
        }
      },
      None => rx.await.map_err(|_| PlayerError::SessionEnded),
    }
  }

  /// Kill the player and wait for its session to end.
  pub async fn shutdown(&self) {
    let active = self.active.lock().take();
    let Some(active) = active else {
      return;
    };

    log::info!("[{}] Shutting down session", active.session.id());
    active.transport.close();
    active.kill.cancel();

    if let Some(watcher) = active.watcher {
      if tokio::time::timeout(Duration::from_secs(2), watcher)
        .await
        .is_err()
      {
        log::warn!("[{}] MPlayer did not exit in time", active.session.id());
      }
    }
  }
}

/// Commands applying `initial` once the player is ready.
fn initial_actions(initial: &InitialState) -> Vec<Action> {
  let mut actions = Vec::new();

  if let Some(volume) = initial.volume {
    actions.push(Action::Volume {
      value: volume,
      absolute: true,
    });
  }
  if let Some(times) = initial.loop_count {
    actions.push(Action::Loop(times));
  }
  if let Some(time) = initial.time {
    actions.push(Action::Seek {
      value: time,
      mode: SeekMode::Absolute,
    });
  }
  if let Some(position) = initial.position {
    actions.push(Action::Seek {
      value: position,
      mode: SeekMode::Percentage,
    });
  }
  if let Some(speed) = initial.speed {
    actions.push(Action::Speed(speed));
  }
  if let Some(muted) = initial.mute {
    actions.push(Action::Mute(Some(muted)));
  }

  actions
}

/// Re-query the time position every `interval`, one query at a time.
async fn poll_time_position(session: Arc<Session>, interval: Duration, token: CancellationToken) {
  log::debug!("[{}] Time position polling started", session.id());

  loop {
    let answer = session.query(Query::Time);
    tokio::select! {
      _ = token.cancelled() => break,
      result = answer => {
        if result.is_err() {
          break;
        }
      }
    }

    tokio::select! {
      _ = token.cancelled() => break,
      _ = tokio::time::sleep(interval) => {}
    }
  }

  log::debug!("[{}] Time position polling stopped", session.id());
}
