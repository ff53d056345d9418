//! MPlayer slave-mode module - spawns and controls an external MPlayer through a named pipe.
//!
//! Architecture:
//! - `process.rs` - MPlayer binary detection, control pipe lifecycle and process spawning
//! - `transport.rs` - Writer task for the control pipe, reader task for stdout lines
//! - `protocol.rs` - Command encoding and answer-line parsing
//! - `queue.rs` - Commands held back until the player is ready
//! - `events.rs` - Player events and their subscribers
//! - `session.rs` - Per-process state machine
//! - `client.rs` - High-level facade with command and query methods

mod client;
mod events;
mod process;
mod protocol;
mod queue;
mod session;
mod transport;

pub use client::{Mplayer, PlayerError};
pub use events::{EndReport, ErrorReport, EventBus, EventKind, Outcome, PlayerEvent};
pub use process::{find_mplayer, health_check, ExitInfo, ProcessError};
pub use protocol::{PreserveFlag, SeekMode, SlaveCommand, StatusLine};
pub use queue::ReadinessQueue;
pub use session::{Action, Query, Session, SessionInfo, Status};
pub use transport::{CommandWriter, Transport, TransportError};
