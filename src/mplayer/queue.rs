//! Buffer for commands issued before the player answered its first queries.

use std::collections::VecDeque;

use tokio::sync::oneshot;

/// A buffered command and the future waiting for its replay.
pub struct Pending<T, R> {
  pub command: T,
  responder: oneshot::Sender<R>,
}

impl<T, R> Pending<T, R> {
  /// Resolve the caller's future. A caller that stopped waiting is ignored.
  pub fn resolve(self, value: R) {
    let _ = self.responder.send(value);
  }
}

/// FIFO of commands held back until the session becomes ready.
///
/// Readiness only ever goes from `false` to `true`.
pub struct ReadinessQueue<T, R> {
  ready: bool,
  pending: VecDeque<Pending<T, R>>,
}

impl<T, R> ReadinessQueue<T, R> {
  pub fn new() -> Self {
    Self {
      ready: false,
      pending: VecDeque::new(),
    }
  }

  pub fn is_ready(&self) -> bool {
    self.ready
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  /// Buffer `command` and hand back the future its replay resolves.
  pub fn enqueue(&mut self, command: T) -> oneshot::Receiver<R> {
    debug_assert!(!self.ready, "enqueue after readiness");
    let (responder, rx) = oneshot::channel();
    self.pending.push_back(Pending { command, responder });
    rx
  }

  /// Flip to ready and hand over everything buffered, oldest first.
  ///
  /// Returns nothing on every call after the first.
  pub fn drain_on_ready(&mut self) -> Vec<Pending<T, R>> {
    if self.ready {
      return Vec::new();
    }
    self.ready = true;
    self.pending.drain(..).collect()
  }

  /// Drop every buffered command; their futures observe a closed channel.
  pub fn clear(&mut self) {
    self.pending.clear();
  }
}

impl<T, R> Default for ReadinessQueue<T, R> {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_drain_replays_in_enqueue_order() {
    let mut queue: ReadinessQueue<&str, usize> = ReadinessQueue::new();
    let first = queue.enqueue("pause");
    let second = queue.enqueue("volume");
    let third = queue.enqueue("seek");
    assert_eq!(queue.len(), 3);

    let mut replayed = Vec::new();
    for (i, pending) in queue.drain_on_ready().into_iter().enumerate() {
      replayed.push(pending.command);
      pending.resolve(i);
    }

    assert_eq!(replayed, vec!["pause", "volume", "seek"]);
    assert_eq!(first.await.unwrap(), 0);
    assert_eq!(second.await.unwrap(), 1);
    assert_eq!(third.await.unwrap(), 2);
    assert!(queue.is_ready());
    assert!(queue.is_empty());
  }

  #[test]
  fn test_drain_happens_once() {
    let mut queue: ReadinessQueue<u8, ()> = ReadinessQueue::new();
    let _rx = queue.enqueue(1);
    assert_eq!(queue.drain_on_ready().len(), 1);
    assert!(queue.drain_on_ready().is_empty());
    assert!(queue.is_ready());
  }

  #[tokio::test]
  async fn test_cleared_commands_reject() {
    let mut queue: ReadinessQueue<u8, ()> = ReadinessQueue::new();
    let rx = queue.enqueue(1);
    queue.clear();
    assert!(rx.await.is_err());
  }
}
