//! Session state machine for one player process.
//!
//! All state changes go through [`Session`]: answer lines, process exit,
//! and commands from the facade. Each one takes the state lock once, so
//! they never interleave.

use std::path::PathBuf;
use std::sync::Arc;

use async_channel::Receiver;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{EndReport, ErrorReport, EventBus, EventKind, Outcome, PlayerEvent};
use super::process::ExitInfo;
use super::protocol::{SeekMode, SlaveCommand, StatusLine};
use super::queue::ReadinessQueue;
use super::transport::CommandWriter;

/// Playback status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  /// File set, player not confirmed ready yet.
  Wait,
  Ready,
  Play,
  Pause,
  Stop,
  /// Player process exited.
  End,
  Error,
}

impl Status {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Status::End | Status::Error)
  }
}

/// Snapshot of the session state, handed out with every event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
  pub file: PathBuf,
  pub status: Status,
  /// Elapsed time in seconds.
  pub time: f64,
  /// Length in seconds, 0 while unknown.
  pub duration: f64,
  /// `time / duration`, 0 while the duration is unknown.
  pub position: f64,
  pub volume: Option<f64>,
  pub muted: bool,
}

impl SessionInfo {
  pub fn new(file: PathBuf) -> Self {
    Self {
      file,
      status: Status::Wait,
      time: 0.0,
      duration: 0.0,
      position: 0.0,
      volume: None,
      muted: false,
    }
  }
}

/// Logical command issued by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
  Play,
  /// Toggle pause.
  Pause,
  Stop,
  /// Muted reposition.
  Seek { value: f64, mode: SeekMode },
  /// Set mute, or toggle it with `None`.
  Mute(Option<bool>),
  Volume { value: f64, absolute: bool },
  Loop(i32),
  Speed(f64),
  Quit,
  /// Upstream half of a volume query.
  QueryVolume,
}

/// Value queries answered by a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
  Duration,
  Time,
  Volume,
}

/// Callers waiting on each query kind. A non-empty list means the
/// upstream query is already out.
#[derive(Default)]
struct Inflight {
  duration: Vec<oneshot::Sender<f64>>,
  time: Vec<oneshot::Sender<f64>>,
  volume: Vec<oneshot::Sender<f64>>,
}

impl Inflight {
  fn waiters(&mut self, query: Query) -> &mut Vec<oneshot::Sender<f64>> {
    match query {
      Query::Duration => &mut self.duration,
      Query::Time => &mut self.time,
      Query::Volume => &mut self.volume,
    }
  }

  fn resolve(&mut self, query: Query, value: f64) {
    for tx in self.waiters(query).drain(..) {
      let _ = tx.send(value);
    }
  }

  fn clear(&mut self) {
    self.duration.clear();
    self.time.clear();
    self.volume.clear();
  }
}

struct SessionState {
  info: SessionInfo,
  queue: ReadinessQueue<Action, SessionInfo>,
  inflight: Inflight,
}

/// Control context bound to one player process and one file.
pub struct Session {
  id: Uuid,
  state: Mutex<SessionState>,
  writer: CommandWriter,
  events: EventBus,
  /// Events of this session only, for its own helpers.
  local: EventBus,
  shutdown: CancellationToken,
}

impl Session {
  pub fn new(file: PathBuf, writer: CommandWriter, events: EventBus) -> Arc<Self> {
    Arc::new(Self {
      id: Uuid::new_v4(),
      state: Mutex::new(SessionState {
        info: SessionInfo::new(file),
        queue: ReadinessQueue::new(),
        inflight: Inflight::default(),
      }),
      writer,
      events,
      local: EventBus::new(),
      shutdown: CancellationToken::new(),
    })
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn info(&self) -> SessionInfo {
    self.state.lock().info.clone()
  }

  pub fn status(&self) -> Status {
    self.state.lock().info.status
  }

  pub fn is_ready(&self) -> bool {
    self.state.lock().queue.is_ready()
  }

  /// Receive the listed events, limited to this session.
  pub fn subscribe(&self, kinds: &[EventKind]) -> Receiver<PlayerEvent> {
    self.local.subscribe(kinds)
  }

  /// Cancelled once the session reaches `end` or `error`.
  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Kick off a freshly spawned player.
  ///
  /// The player is paused right away, `initial` is queued behind the ready
  /// gate, and the gate opens once both the time and the length answers arrived.
  pub fn start(self: &Arc<Self>, initial: Vec<Action>) {
    log::info!(
      "[{}] Starting session for {:?}",
      self.id,
      self.state.lock().info.file
    );

    self.write(&SlaveCommand::pause());

    for action in initial {
      let _ = self.dispatch(action);
    }

    let time = self.query(Query::Time);
    let duration = self.query(Query::Duration);

    let session = Arc::clone(self);
    tokio::spawn(async move {
      let (time, duration) = tokio::join!(time, duration);
      match (time, duration) {
        (Ok(_), Ok(_)) => session.mark_ready(),
        _ => log::debug!("[{}] Session ended before becoming ready", session.id),
      }
    });
  }

  /// Issue `action`, or hold it until the session is ready.
  ///
  /// The returned future resolves with the snapshot taken right after the
  /// command went out. It rejects if the session ends first.
  pub fn dispatch(&self, action: Action) -> oneshot::Receiver<SessionInfo> {
    let mut state = self.state.lock();

    if state.info.status.is_terminal() {
      log::warn!("[{}] Session is over, dropping {:?}", self.id, action);
      let (_tx, rx) = oneshot::channel();
      return rx;
    }

    if !state.queue.is_ready() {
      log::debug!("[{}] Queueing {:?} until ready", self.id, action);
      return state.queue.enqueue(action);
    }

    let info = self.apply(&mut state, action);
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(info);
    rx
  }

  /// Ask for a value. Callers asking while the same query is outstanding
  /// share its answer instead of sending another one.
  pub fn query(&self, query: Query) -> oneshot::Receiver<f64> {
    let (tx, rx) = oneshot::channel();
    let mut state = self.state.lock();

    if state.info.status.is_terminal() {
      return rx;
    }

    let waiters = state.inflight.waiters(query);
    // Callers that gave up (timeout, dropped future) no longer hold the query open.
    waiters.retain(|tx| !tx.is_closed());
    let first = waiters.is_empty();
    waiters.push(tx);
    if !first {
      log::debug!("[{}] Joining outstanding {:?} query", self.id, query);
      return rx;
    }

    match query {
      Query::Duration => self.write(&SlaveCommand::get_time_length()),
      Query::Time => self.write(&SlaveCommand::get_time_pos()),
      // Volume changes may still sit in the queue, so the question waits behind them.
      Query::Volume if state.queue.is_ready() => {
        self.apply(&mut state, Action::QueryVolume);
      }
      Query::Volume => {
        let _ = state.queue.enqueue(Action::QueryVolume);
      }
    }

    rx
  }

  /// Feed one line of player stdout.
  pub fn handle_line(&self, line: &str) {
    let Some(answer) = StatusLine::parse(line) else {
      log::debug!("[{}] mplayer: {}", self.id, line);
      return;
    };

    let mut state = self.state.lock();
    match answer {
      StatusLine::Duration(duration) => {
        state.info.duration = duration;
        self.emit(&state, EventKind::Duration);
        state.inflight.resolve(Query::Duration, duration);
      }
      StatusLine::Time(time) => {
        let duration = state.info.duration;
        state.info.time = time;
        state.info.position = if duration > 0.0 { time / duration } else { 0.0 };
        self.emit(&state, EventKind::Time);
        state.inflight.resolve(Query::Time, time);
      }
      StatusLine::Volume(volume) => {
        state.info.volume = Some(volume);
        self.emit(&state, EventKind::Volume);
        state.inflight.resolve(Query::Volume, volume);
      }
    }
  }

  /// Open the ready gate and replay everything queued so far, in order.
  pub fn mark_ready(&self) {
    let mut state = self.state.lock();
    if state.queue.is_ready() || state.info.status.is_terminal() {
      return;
    }

    self.transition(&mut state, Status::Ready, EventKind::Ready);

    let pending = state.queue.drain_on_ready();
    log::info!(
      "[{}] Player ready, replaying {} queued command(s)",
      self.id,
      pending.len()
    );

    for entry in pending {
      let info = self.apply(&mut state, entry.command.clone());
      entry.resolve(info);
    }
  }

  /// The player process exited.
  pub fn handle_exit(&self, exit: ExitInfo) {
    let mut state = self.state.lock();
    if state.info.status == Status::End {
      return;
    }

    state.info.status = Status::End;
    state.queue.clear();
    state.inflight.clear();

    let report = EndReport::from(exit);
    log::info!(
      "[{}] Player exited (code {:?}, signal {:?})",
      self.id,
      report.exit_code,
      report.signal
    );
    self.publish(PlayerEvent::End(report));
    drop(state);

    self.teardown();
  }

  /// The player process failed.
  pub fn handle_error(&self, detail: String) {
    let mut state = self.state.lock();
    if state.info.status.is_terminal() {
      return;
    }

    state.info.status = Status::Error;
    state.queue.clear();
    state.inflight.clear();

    log::error!("[{}] Player error: {}", self.id, detail);
    self.publish(PlayerEvent::Error(ErrorReport {
      status: Outcome::Error,
      error: detail,
    }));
    drop(state);

    self.teardown();
  }

  fn teardown(&self) {
    self.writer.close();
    self.shutdown.cancel();
  }

  /// Write the wire commands for `action` and move the state along.
  fn apply(&self, state: &mut SessionState, action: Action) -> SessionInfo {
    match action {
      Action::Play => {
        // The player starts paused; only an unpaused player must not be toggled.
        if state.info.status != Status::Play {
          self.write(&SlaveCommand::pause());
        }
        self.transition(state, Status::Play, EventKind::Play);
      }
      Action::Pause => {
        self.write(&SlaveCommand::pause());
        if state.info.status == Status::Pause {
          self.transition(state, Status::Play, EventKind::Play);
        } else {
          self.transition(state, Status::Pause, EventKind::Pause);
        }
      }
      Action::Stop => {
        self.write(&SlaveCommand::stop());
        self.transition(state, Status::Stop, EventKind::Stop);
      }
      Action::Seek { value, mode } => {
        let muted = state.info.muted;
        self.write(&SlaveCommand::mute(Some(true)));
        self.write(&SlaveCommand::seek(value, mode));
        self.write(&SlaveCommand::mute(Some(muted)));
        self.emit(state, EventKind::Seek);
      }
      Action::Mute(setting) => {
        self.write(&SlaveCommand::mute(setting));
        state.info.muted = setting.unwrap_or(!state.info.muted);
      }
      Action::Volume { value, absolute } => self.write(&SlaveCommand::volume(value, absolute)),
      Action::Loop(times) => self.write(&SlaveCommand::set_loop(times)),
      Action::Speed(speed) => self.write(&SlaveCommand::speed(speed)),
      Action::Quit => self.write(&SlaveCommand::quit()),
      Action::QueryVolume => self.write(&SlaveCommand::get_property("volume")),
    }

    state.info.clone()
  }

  fn transition(&self, state: &mut SessionState, status: Status, kind: EventKind) {
    log::debug!(
      "[{}] {:?} -> {:?}",
      self.id,
      state.info.status,
      status
    );
    state.info.status = status;
    self.emit(state, kind);
  }

  fn emit(&self, state: &SessionState, kind: EventKind) {
    if let Some(event) = PlayerEvent::with_info(kind, state.info.clone()) {
      self.publish(event);
    }
  }

  fn publish(&self, event: PlayerEvent) {
    self.local.emit(event.clone());
    self.events.emit(event);
  }

  fn write(&self, cmd: &SlaveCommand) {
    if let Err(e) = self.writer.write(cmd) {
      log::warn!("[{}] Dropped command '{}': {}", self.id, cmd, e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mplayer::transport::Transport;
  use async_channel::Receiver;
  use std::time::Duration;
  use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream, Lines};

  struct Harness {
    session: Arc<Session>,
    events: Receiver<PlayerEvent>,
    pipe: Lines<BufReader<DuplexStream>>,
    _stdout: DuplexStream,
    _transport: Transport,
  }

  impl Harness {
    fn new() -> Self {
      let (reader, stdout) = duplex(4096);
      let (writer, pipe) = duplex(4096);
      let transport = Transport::setup(reader, writer);
      let bus = EventBus::new();
      let events = bus.subscribe_all();
      let session = Session::new(PathBuf::from("sample.mp3"), transport.writer(), bus);
      Self {
        session,
        events,
        pipe: BufReader::new(pipe).lines(),
        _stdout: stdout,
        _transport: transport,
      }
    }

    async fn next_command(&mut self) -> String {
      tokio::time::timeout(Duration::from_secs(1), self.pipe.next_line())
        .await
        .expect("command not written in time")
        .unwrap()
        .unwrap()
    }

    async fn commands(&mut self, n: usize) -> Vec<String> {
      let mut out = Vec::with_capacity(n);
      for _ in 0..n {
        out.push(self.next_command().await);
      }
      out
    }

    async fn next_event(&self) -> PlayerEvent {
      tokio::time::timeout(Duration::from_secs(1), self.events.recv())
        .await
        .expect("event not emitted in time")
        .unwrap()
    }

    /// Start and answer the two startup queries.
    async fn ready(&mut self, initial: Vec<Action>) {
      self.session.start(initial);
      self.commands(3).await;
      self.session.handle_line("ANS_TIME_POSITION=0.0");
      self.session.handle_line("ANS_LENGTH=200.00");
      while self.next_event().await.kind() != EventKind::Ready {}
    }
  }

  #[tokio::test]
  async fn test_startup_sequence() {
    let mut h = Harness::new();
    h.session.start(Vec::new());

    assert_eq!(
      h.commands(3).await,
      vec![
        "pausing_keep_force pause",
        "pausing_keep_force get_time_pos",
        "pausing_keep_force get_time_length",
      ]
    );
    assert_eq!(h.session.status(), Status::Wait);
    assert!(!h.session.is_ready());
  }

  #[tokio::test]
  async fn test_ready_requires_both_answers() {
    let mut h = Harness::new();
    h.session.start(Vec::new());
    h.commands(3).await;

    h.session.handle_line("ANS_LENGTH=200.00");
    assert_eq!(h.next_event().await.kind(), EventKind::Duration);
    tokio::task::yield_now().await;
    assert!(!h.session.is_ready());

    h.session.handle_line("ANS_TIME_POSITION=0.0");
    assert_eq!(h.next_event().await.kind(), EventKind::Time);
    let ready = h.next_event().await;
    assert_eq!(ready.kind(), EventKind::Ready);
    assert_eq!(ready.info().unwrap().status, Status::Ready);
    assert!(h.session.is_ready());
  }

  #[tokio::test]
  async fn test_queued_commands_replay_in_order() {
    let mut h = Harness::new();
    h.session.start(vec![Action::Volume {
      value: 50.0,
      absolute: true,
    }]);
    let play = h.session.dispatch(Action::Play);
    let seek = h.session.dispatch(Action::Seek {
      value: 10.0,
      mode: SeekMode::Absolute,
    });
    h.commands(3).await;

    h.session.handle_line("ANS_TIME_POSITION=0.0");
    h.session.handle_line("ANS_LENGTH=200.00");

    assert_eq!(
      h.commands(5).await,
      vec![
        "pausing_keep_force volume 50 1",
        "pausing_keep_force pause",
        "pausing_keep_force mute 1",
        "pausing_keep seek 10 2",
        "pausing_keep_force mute 0",
      ]
    );
    assert_eq!(play.await.unwrap().status, Status::Play);
    assert_eq!(seek.await.unwrap().status, Status::Play);

    let kinds: Vec<EventKind> = std::iter::from_fn(|| h.events.try_recv().ok())
      .map(|e| e.kind())
      .collect();
    assert_eq!(
      kinds,
      vec![
        EventKind::Time,
        EventKind::Duration,
        EventKind::Ready,
        EventKind::Play,
        EventKind::Seek,
      ]
    );
  }

  #[tokio::test]
  async fn test_duplicate_queries_share_one_write() {
    let mut h = Harness::new();
    h.ready(Vec::new()).await;

    let first = h.session.query(Query::Time);
    let second = h.session.query(Query::Time);
    assert_eq!(h.next_command().await, "pausing_keep_force get_time_pos");

    h.session.handle_line("ANS_TIME_POSITION=42.5");
    assert_eq!(first.await.unwrap(), 42.5);
    assert_eq!(second.await.unwrap(), 42.5);

    // Nothing else was written for the second caller.
    let _ = h.session.dispatch(Action::Stop);
    assert_eq!(h.next_command().await, "pausing_keep_force stop");
  }

  #[tokio::test]
  async fn test_abandoned_query_is_sent_again() {
    let mut h = Harness::new();
    h.ready(Vec::new()).await;

    drop(h.session.query(Query::Duration));
    assert_eq!(h.next_command().await, "pausing_keep_force get_time_length");

    let retry = h.session.query(Query::Duration);
    assert_eq!(h.next_command().await, "pausing_keep_force get_time_length");

    h.session.handle_line("ANS_LENGTH=200.00");
    assert_eq!(retry.await.unwrap(), 200.0);
  }

  #[tokio::test]
  async fn test_session_subscription_is_scoped() {
    let bus = EventBus::new();
    let all = bus.subscribe_all();
    let (writer, _pipe) = duplex(64);
    let (reader, _stdout) = duplex(64);
    let transport = Transport::setup(reader, writer);
    let first = Session::new(PathBuf::from("a.mp3"), transport.writer(), bus.clone());
    let second = Session::new(PathBuf::from("b.mp3"), transport.writer(), bus);
    let own = second.subscribe(&[EventKind::End, EventKind::Duration]);

    first.handle_exit(ExitInfo {
      code: Some(0),
      signal: None,
    });
    second.handle_line("ANS_LENGTH=10.0");

    assert_eq!(own.try_recv().unwrap().kind(), EventKind::Duration);
    assert!(own.try_recv().is_err());
    assert_eq!(all.try_recv().unwrap().kind(), EventKind::End);
    assert_eq!(all.try_recv().unwrap().kind(), EventKind::Duration);
  }

  #[tokio::test]
  async fn test_pause_toggle_event_mapping() {
    let mut h = Harness::new();
    h.ready(Vec::new()).await;

    let _ = h.session.dispatch(Action::Play);
    assert_eq!(h.next_event().await.kind(), EventKind::Play);

    let _ = h.session.dispatch(Action::Pause);
    assert_eq!(h.next_event().await.kind(), EventKind::Pause);
    assert_eq!(h.session.status(), Status::Pause);

    let _ = h.session.dispatch(Action::Pause);
    assert_eq!(h.next_event().await.kind(), EventKind::Play);
    assert_eq!(h.session.status(), Status::Play);

    assert_eq!(h.commands(3).await, vec!["pausing_keep_force pause"; 3]);
  }

  #[tokio::test]
  async fn test_play_while_playing_does_not_toggle() {
    let mut h = Harness::new();
    h.ready(Vec::new()).await;

    let _ = h.session.dispatch(Action::Play);
    let _ = h.session.dispatch(Action::Play);
    let _ = h.session.dispatch(Action::Stop);

    assert_eq!(
      h.commands(2).await,
      vec!["pausing_keep_force pause", "pausing_keep_force stop"]
    );
  }

  #[tokio::test]
  async fn test_seek_restores_mute_state() {
    let mut h = Harness::new();
    h.ready(Vec::new()).await;

    let _ = h.session.dispatch(Action::Mute(None));
    let _ = h.session.dispatch(Action::Seek {
      value: -5.0,
      mode: SeekMode::Relative,
    });

    assert_eq!(
      h.commands(4).await,
      vec![
        "pausing_keep_force mute",
        "pausing_keep_force mute 1",
        "pausing_keep seek -5 0",
        "pausing_keep_force mute 1",
      ]
    );
    assert!(h.session.info().muted);
  }

  #[tokio::test]
  async fn test_position_follows_duration() {
    let h = Harness::new();

    h.session.handle_line("ANS_TIME_POSITION=30.0");
    assert_eq!(h.session.info().position, 0.0);

    h.session.handle_line("ANS_LENGTH=120.0");
    h.session.handle_line("ANS_TIME_POSITION=30.0");
    let info = h.session.info();
    assert_eq!(info.time, 30.0);
    assert_eq!(info.position, 0.25);
  }

  #[tokio::test]
  async fn test_volume_query_waits_behind_queue() {
    let mut h = Harness::new();
    h.session.start(vec![Action::Volume {
      value: 30.0,
      absolute: true,
    }]);
    let volume = h.session.query(Query::Volume);
    h.commands(3).await;

    h.session.handle_line("ANS_TIME_POSITION=0.0");
    h.session.handle_line("ANS_LENGTH=200.00");
    assert_eq!(
      h.commands(2).await,
      vec![
        "pausing_keep_force volume 30 1",
        "pausing_keep_force get_property volume",
      ]
    );

    h.session.handle_line("ANS_volume=30.000000");
    assert_eq!(volume.await.unwrap(), 30.0);
    assert_eq!(h.session.info().volume, Some(30.0));
  }

  #[tokio::test]
  async fn test_exit_ends_session_once() {
    let mut h = Harness::new();
    h.ready(Vec::new()).await;
    let pending = h.session.query(Query::Volume);

    h.session.handle_exit(ExitInfo {
      code: Some(0),
      signal: None,
    });
    h.session.handle_exit(ExitInfo {
      code: Some(0),
      signal: None,
    });

    match h.next_event().await {
      PlayerEvent::End(report) => assert_eq!(report.status, Outcome::Success),
      other => panic!("Expected end, got {:?}", other),
    }
    assert!(h.events.try_recv().is_err());
    assert!(pending.await.is_err());
    assert!(h.session.dispatch(Action::Play).await.is_err());
    assert!(h.session.shutdown_token().is_cancelled());
    assert_eq!(h.session.status(), Status::End);
  }

  #[tokio::test]
  async fn test_abnormal_exit_is_error() {
    let h = Harness::new();
    h.session.handle_exit(ExitInfo {
      code: None,
      signal: Some(9),
    });
    match h.next_event().await {
      PlayerEvent::End(report) => {
        assert_eq!(report.status, Outcome::Error);
        assert_eq!(report.signal, Some(9));
      }
      other => panic!("Expected end, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_error_rejects_queued_commands() {
    let h = Harness::new();
    let queued = h.session.dispatch(Action::Play);

    h.session.handle_error("broken pipe".to_string());

    match h.next_event().await {
      PlayerEvent::Error(report) => assert_eq!(report.error, "broken pipe"),
      other => panic!("Expected error, got {:?}", other),
    }
    assert!(queued.await.is_err());
    assert_eq!(h.session.status(), Status::Error);
  }
}
