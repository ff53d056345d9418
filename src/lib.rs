//! Control plane for an MPlayer subprocess.
//!
//! Commands travel to the player through a named pipe; its answers are read
//! back from stdout and folded into a session snapshot that callers observe
//! through events and awaitable queries.

mod config;
mod mplayer;

pub use config::{ConfigError, InitialState, PathsConfig, PlayerConfig};
pub use mplayer::*;
