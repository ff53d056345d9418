//! Player events and their publish/subscribe bus.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use super::process::ExitInfo;
use super::session::SessionInfo;

/// Event names subscribers can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
  Ready,
  Play,
  Pause,
  Stop,
  Seek,
  Duration,
  Time,
  Volume,
  End,
  Error,
}

/// Success or failure classification carried by `end` and `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
  Success,
  Error,
}

/// Payload of the terminal `end` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndReport {
  pub status: Outcome,
  pub exit_code: Option<i32>,
  pub signal: Option<i32>,
}

impl From<ExitInfo> for EndReport {
  fn from(exit: ExitInfo) -> Self {
    Self {
      status: if exit.is_success() {
        Outcome::Success
      } else {
        Outcome::Error
      },
      exit_code: exit.code,
      signal: exit.signal,
    }
  }
}

/// Payload of the `error` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
  pub status: Outcome,
  pub error: String,
}

/// Something that happened to the session, with the state at that moment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PlayerEvent {
  Ready(SessionInfo),
  Play(SessionInfo),
  Pause(SessionInfo),
  Stop(SessionInfo),
  Seek(SessionInfo),
  Duration(SessionInfo),
  Time(SessionInfo),
  Volume(SessionInfo),
  End(EndReport),
  Error(ErrorReport),
}

impl PlayerEvent {
  pub fn kind(&self) -> EventKind {
    match self {
      PlayerEvent::Ready(_) => EventKind::Ready,
      PlayerEvent::Play(_) => EventKind::Play,
      PlayerEvent::Pause(_) => EventKind::Pause,
      PlayerEvent::Stop(_) => EventKind::Stop,
      PlayerEvent::Seek(_) => EventKind::Seek,
      PlayerEvent::Duration(_) => EventKind::Duration,
      PlayerEvent::Time(_) => EventKind::Time,
      PlayerEvent::Volume(_) => EventKind::Volume,
      PlayerEvent::End(_) => EventKind::End,
      PlayerEvent::Error(_) => EventKind::Error,
    }
  }

  /// Build the state-carrying event for `kind`. `End` and `Error` carry reports instead.
  pub(crate) fn with_info(kind: EventKind, info: SessionInfo) -> Option<Self> {
    Some(match kind {
      EventKind::Ready => PlayerEvent::Ready(info),
      EventKind::Play => PlayerEvent::Play(info),
      EventKind::Pause => PlayerEvent::Pause(info),
      EventKind::Stop => PlayerEvent::Stop(info),
      EventKind::Seek => PlayerEvent::Seek(info),
      EventKind::Duration => PlayerEvent::Duration(info),
      EventKind::Time => PlayerEvent::Time(info),
      EventKind::Volume => PlayerEvent::Volume(info),
      EventKind::End | EventKind::Error => return None,
    })
  }

  /// Session snapshot, for the events that carry one.
  pub fn info(&self) -> Option<&SessionInfo> {
    match self {
      PlayerEvent::Ready(info)
      | PlayerEvent::Play(info)
      | PlayerEvent::Pause(info)
      | PlayerEvent::Stop(info)
      | PlayerEvent::Seek(info)
      | PlayerEvent::Duration(info)
      | PlayerEvent::Time(info)
      | PlayerEvent::Volume(info) => Some(info),
      PlayerEvent::End(_) | PlayerEvent::Error(_) => None,
    }
  }
}

struct Subscriber {
  /// `None` receives everything.
  kinds: Option<Vec<EventKind>>,
  tx: Sender<PlayerEvent>,
}

impl Subscriber {
  fn wants(&self, kind: EventKind) -> bool {
    self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
  }
}

/// Fan-out of player events to any number of subscribers.
///
/// Emitting never blocks; every subscriber sees events in emission order.
#[derive(Clone, Default)]
pub struct EventBus {
  subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Receive the listed event kinds.
  pub fn subscribe(&self, kinds: &[EventKind]) -> Receiver<PlayerEvent> {
    self.add(Some(kinds.to_vec()))
  }

  /// Receive every event.
  pub fn subscribe_all(&self) -> Receiver<PlayerEvent> {
    self.add(None)
  }

  fn add(&self, kinds: Option<Vec<EventKind>>) -> Receiver<PlayerEvent> {
    let (tx, rx) = async_channel::unbounded();
    self.subscribers.lock().push(Subscriber { kinds, tx });
    rx
  }

  /// Deliver `event` to every interested subscriber, dropping the ones that went away.
  pub fn emit(&self, event: PlayerEvent) {
    let kind = event.kind();
    let mut subscribers = self.subscribers.lock();
    subscribers.retain(|s| !s.tx.is_closed());
    for subscriber in subscribers.iter().filter(|s| s.wants(kind)) {
      let _ = subscriber.tx.try_send(event.clone());
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.lock().len()
  }
}
