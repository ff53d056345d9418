//! MPlayer slave-mode protocol types.
//!
//! Reference: http://www.mplayerhq.hu/DOCS/tech/slave.txt

use std::fmt;

/// Prefix keeping the pause state untouched by the command that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreserveFlag {
  /// `pausing_keep`: keep pause state, may leave the pause loop to apply.
  Keep,
  /// `pausing_keep_force`: keep pause state and apply without leaving the pause loop.
  KeepForce,
}

impl PreserveFlag {
  pub fn as_str(&self) -> &'static str {
    match self {
      PreserveFlag::Keep => "pausing_keep",
      PreserveFlag::KeepForce => "pausing_keep_force",
    }
  }
}

/// How the argument of a `seek` command is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
  /// Offset in seconds from the current position.
  Relative,
  /// Percentage of the total length.
  Percentage,
  /// Absolute time in seconds.
  Absolute,
}

impl SeekMode {
  /// Wire discriminator expected by the `seek` command.
  pub fn code(&self) -> u8 {
    match self {
      SeekMode::Relative => 0,
      SeekMode::Percentage => 1,
      SeekMode::Absolute => 2,
    }
  }
}

/// Command written to the control pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveCommand {
  pub name: &'static str,
  pub args: Vec<String>,
}

impl SlaveCommand {
  pub fn new(name: &'static str, args: Vec<String>) -> Self {
    Self { name, args }
  }

  /// Toggle pause.
  pub fn pause() -> Self {
    Self::new("pause", Vec::new())
  }

  /// Stop playback.
  pub fn stop() -> Self {
    Self::new("stop", Vec::new())
  }

  /// Quit the player.
  pub fn quit() -> Self {
    Self::new("quit", Vec::new())
  }

  /// Reposition playback.
  pub fn seek(value: f64, mode: SeekMode) -> Self {
    Self::new("seek", vec![value.to_string(), mode.code().to_string()])
  }

  /// Toggle mute, or set it when `state` is given.
  pub fn mute(state: Option<bool>) -> Self {
    match state {
      Some(on) => Self::new("mute", vec![if on { "1" } else { "0" }.to_string()]),
      None => Self::new("mute", Vec::new()),
    }
  }

  /// Change volume, relative to the current one unless `absolute`.
  pub fn volume(value: f64, absolute: bool) -> Self {
    let mut args = vec![value.to_string()];
    if absolute {
      args.push("1".to_string());
    }
    Self::new("volume", args)
  }

  /// Loop the file `times` times (0 = forever, -1 = off).
  pub fn set_loop(times: i32) -> Self {
    Self::new("loop", vec![times.to_string()])
  }

  /// Set the playback speed factor.
  pub fn speed(speed: f64) -> Self {
    Self::new("speed_set", vec![speed.to_string()])
  }

  /// Ask for the file length, answered by `ANS_LENGTH=`.
  pub fn get_time_length() -> Self {
    Self::new("get_time_length", Vec::new())
  }

  /// Ask for the time position, answered by `ANS_TIME_POSITION=`.
  pub fn get_time_pos() -> Self {
    Self::new("get_time_pos", Vec::new())
  }

  /// Ask for a property value, answered by `ANS_<name>=`.
  pub fn get_property(name: &str) -> Self {
    Self::new("get_property", vec![name.to_string()])
  }

  /// `seek` only honours `pausing_keep`; every other command is forced
  /// through the pause loop.
  pub fn preserve_flag(&self) -> PreserveFlag {
    match self.name {
      "seek" => PreserveFlag::Keep,
      _ => PreserveFlag::KeepForce,
    }
  }

  /// Serialize to the exact line written to the pipe, without terminator.
  pub fn encode(&self) -> String {
    let mut line = format!("{} {}", self.preserve_flag().as_str(), self.name);
    for arg in &self.args {
      line.push(' ');
      line.push_str(arg);
    }
    line
  }
}

impl fmt::Display for SlaveCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.encode())
  }
}

const LENGTH_MARKER: &str = "ANS_LENGTH";
const TIME_POSITION_MARKER: &str = "ANS_TIME_POSITION";
const VOLUME_MARKER: &str = "ANS_volume";

/// Answer line recognised on the player's stdout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusLine {
  Duration(f64),
  Time(f64),
  Volume(f64),
}

impl StatusLine {
  /// Parse one stdout line. Anything that is not a known answer yields `None`.
  pub fn parse(line: &str) -> Option<Self> {
    let (marker, value) = line.trim().split_once('=')?;
    let value: f64 = value.trim().parse().ok()?;

    match marker.trim() {
      m if m.ends_with(LENGTH_MARKER) => Some(StatusLine::Duration(value)),
      m if m.ends_with(TIME_POSITION_MARKER) => Some(StatusLine::Time(value)),
      m if m.ends_with(VOLUME_MARKER) => Some(StatusLine::Volume(value)),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_commands_keep_pause_state_forced() {
    assert_eq!(SlaveCommand::pause().encode(), "pausing_keep_force pause");
    assert_eq!(
      SlaveCommand::volume(50.0, true).encode(),
      "pausing_keep_force volume 50 1"
    );
    assert_eq!(
      SlaveCommand::volume(-5.0, false).encode(),
      "pausing_keep_force volume -5"
    );
    assert_eq!(
      SlaveCommand::get_property("volume").encode(),
      "pausing_keep_force get_property volume"
    );
    assert_eq!(SlaveCommand::speed(1.5).encode(), "pausing_keep_force speed_set 1.5");
    assert_eq!(SlaveCommand::mute(None).encode(), "pausing_keep_force mute");
    assert_eq!(SlaveCommand::mute(Some(false)).encode(), "pausing_keep_force mute 0");
  }

  #[test]
  fn test_seek_uses_plain_keep() {
    assert_eq!(
      SlaveCommand::seek(123.0, SeekMode::Absolute).encode(),
      "pausing_keep seek 123 2"
    );
    assert_eq!(
      SlaveCommand::seek(-10.5, SeekMode::Relative).encode(),
      "pausing_keep seek -10.5 0"
    );
    assert_eq!(
      SlaveCommand::seek(50.0, SeekMode::Percentage).preserve_flag(),
      PreserveFlag::Keep
    );
  }

  #[test]
  fn test_answer_parsing() {
    assert_eq!(
      StatusLine::parse("ANS_LENGTH=212.00"),
      Some(StatusLine::Duration(212.0))
    );
    assert_eq!(
      StatusLine::parse("ANS_TIME_POSITION=12.3\r"),
      Some(StatusLine::Time(12.3))
    );
    assert_eq!(
      StatusLine::parse("ANS_volume=50.000000"),
      Some(StatusLine::Volume(50.0))
    );
    assert_eq!(StatusLine::parse("ANS_LENGTH=7"), Some(StatusLine::Duration(7.0)));
  }

  #[test]
  fn test_unrecognised_lines_are_ignored() {
    assert_eq!(StatusLine::parse("MPlayer SVN-r38151 (C) 2000-2019"), None);
    assert_eq!(StatusLine::parse("Starting playback..."), None);
    assert_eq!(StatusLine::parse("ANS_filename=sample.mp3"), None);
    assert_eq!(StatusLine::parse("ANS_LENGTH=unknown"), None);
    assert_eq!(StatusLine::parse(""), None);
  }
}
