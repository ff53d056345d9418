use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use mplayer_ctl::{health_check, Mplayer, Outcome, PlayerConfig, PlayerError, PlayerEvent};

/// Play a file through an MPlayer slave-mode subprocess.
#[derive(Parser, Debug)]
#[command(name = "mplayer-ctl", version, about)]
struct Cli {
  /// Media file to play.
  file: PathBuf,

  /// JSON configuration file.
  #[arg(long, env = "MPLAYER_CTL_CONFIG")]
  config: Option<PathBuf>,

  /// Control pipe path.
  #[arg(long)]
  fifo: Option<String>,

  /// Time position polling interval in milliseconds (0 disables polling).
  #[arg(long)]
  interval: Option<u64>,

  /// MPlayer executable.
  #[arg(long, env = "MPLAYER_PATH")]
  mplayer: Option<String>,

  /// Initial volume (0-100).
  #[arg(long)]
  volume: Option<f64>,

  /// Initial time in seconds.
  #[arg(long)]
  time: Option<f64>,

  /// Initial position in percent.
  #[arg(long)]
  position: Option<f64>,

  /// Playback speed factor.
  #[arg(long)]
  speed: Option<f64>,

  /// Loop count (0 = forever).
  #[arg(long = "loop")]
  loop_count: Option<i32>,

  /// Start muted.
  #[arg(long)]
  mute: bool,

  /// Print events as JSON lines instead of logging them.
  #[arg(long)]
  json: bool,
}

impl Cli {
  fn into_config(self) -> Result<(PathBuf, bool, PlayerConfig), PlayerError> {
    let mut config = match &self.config {
      Some(path) => PlayerConfig::load(path)?,
      None => PlayerConfig::default(),
    };

    if let Some(fifo) = self.fifo {
      config.paths.fifo = fifo;
    }
    if let Some(interval) = self.interval {
      config.update_interval = interval;
    }
    if self.mplayer.is_some() {
      config.mplayer_path = self.mplayer;
    }

    let initial = &mut config.initial;
    initial.volume = self.volume.or(initial.volume);
    initial.time = self.time.or(initial.time);
    initial.position = self.position.or(initial.position);
    initial.speed = self.speed.or(initial.speed);
    initial.loop_count = self.loop_count.or(initial.loop_count);
    if self.mute {
      initial.mute = Some(true);
    }

    config.validate()?;
    Ok((self.file, self.json, config))
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

  match run(Cli::parse()).await {
    Ok(code) => code,
    Err(e) => {
      log::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}

async fn run(cli: Cli) -> Result<ExitCode, PlayerError> {
  let (file, json, config) = cli.into_config()?;

  health_check(config.mplayer_path())?;

  let player = Mplayer::new(config);
  let events = player.subscribe_all();

  player.set_file(&file).await?.play()?;

  let mut interrupted = false;
  loop {
    tokio::select! {
      event = events.recv() => {
        let Ok(event) = event else {
          return Ok(ExitCode::FAILURE);
        };
        report(&event, json);

        match event {
          PlayerEvent::End(end) => {
            return Ok(match end.status {
              Outcome::Success => ExitCode::SUCCESS,
              Outcome::Error if interrupted => ExitCode::SUCCESS,
              Outcome::Error => ExitCode::FAILURE,
            });
          }
          PlayerEvent::Error(_) => {
            player.shutdown().await;
            return Ok(ExitCode::FAILURE);
          }
          _ => {}
        }
      }
      _ = tokio::signal::ctrl_c() => {
        if interrupted {
          log::info!("Interrupted again, killing MPlayer");
          player.shutdown().await;
          return Ok(ExitCode::FAILURE);
        }
        log::info!("Interrupted, asking MPlayer to quit");
        interrupted = true;
        player.quit()?;
      }
    }
  }
}

fn report(event: &PlayerEvent, json: bool) {
  if json {
    match serde_json::to_string(event) {
      Ok(line) => println!("{}", line),
      Err(e) => log::warn!("Failed to serialize event: {}", e),
    }
    return;
  }

  match event {
    PlayerEvent::Time(info) => log::debug!(
      "time {:.1}s / {:.1}s ({:.0}%)",
      info.time,
      info.duration,
      info.position * 100.0
    ),
    PlayerEvent::End(end) => log::info!(
      "end: {:?} (code {:?}, signal {:?})",
      end.status,
      end.exit_code,
      end.signal
    ),
    PlayerEvent::Error(error) => log::error!("error: {}", error.error),
    other => {
      if let Some(info) = other.info() {
        log::info!("{:?}: {:?}", other.kind(), info.status);
      }
    }
  }
}
