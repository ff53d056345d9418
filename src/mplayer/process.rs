//! MPlayer binary detection, control pipe lifecycle and process spawning.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPlayer executable not found")]
  NotFound,
  #[error("Failed to spawn MPlayer: {0}")]
  SpawnFailed(#[source] io::Error),
  #[error("Control pipe error at {path}: {source}")]
  Fifo {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Permission bits of a freshly created control pipe.
const FIFO_MODE: libc::mode_t = 0o755;

/// Find the MPlayer executable, preferring an explicitly configured path.
pub fn find_mplayer(configured: Option<&Path>) -> Option<PathBuf> {
  if let Some(path) = configured {
    return path.exists().then(|| path.to_path_buf());
  }

  if let Ok(path) = which::which("mplayer") {
    return Some(path);
  }

  let common_paths = [
    "/usr/bin/mplayer",
    "/usr/local/bin/mplayer",
    "/opt/homebrew/bin/mplayer",
  ];
  common_paths
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Check that MPlayer can be launched before any session is created.
pub fn health_check(configured: Option<&Path>) -> Result<PathBuf, ProcessError> {
  let path = find_mplayer(configured).ok_or(ProcessError::NotFound)?;
  log::info!("Using MPlayer at {:?}", path);
  Ok(path)
}

/// Remove a stale control pipe left over by a previous run.
pub fn cleanup_fifo(path: &Path) {
  match std::fs::remove_file(path) {
    Ok(()) => log::debug!("Removed stale control pipe {:?}", path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => log::warn!("Failed to remove control pipe {:?}: {}", path, e),
  }
}

/// Replace whatever sits at `path` with a fresh named pipe.
pub fn create_fifo(path: &Path) -> Result<(), ProcessError> {
  cleanup_fifo(path);

  let fifo_err = |source: io::Error| ProcessError::Fifo {
    path: path.to_path_buf(),
    source,
  };

  let c_path = CString::new(path.as_os_str().as_bytes())
    .map_err(|e| fifo_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

  // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
  let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
  if rc != 0 {
    return Err(fifo_err(io::Error::last_os_error()));
  }

  log::debug!("Created control pipe {:?}", path);
  Ok(())
}

/// Open the write end of the control pipe.
///
/// On Linux the pipe is opened read-write so the call succeeds before the
/// player has opened its end. Elsewhere the open is retried until a reader shows up.
pub async fn open_fifo_writer(path: &Path, retry_count: u32) -> Result<pipe::Sender, ProcessError> {
  let mut last_error = None;

  for attempt in 0..retry_count.max(1) {
    if attempt > 0 {
      tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
    }

    #[cfg_attr(not(target_os = "linux"), allow(unused_mut))]
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);

    match options.open_sender(path) {
      Ok(sender) => return Ok(sender),
      Err(e) => {
        log::debug!("Control pipe open attempt {} failed: {}", attempt + 1, e);
        last_error = Some(e);
      }
    }
  }

  Err(ProcessError::Fifo {
    path: path.to_path_buf(),
    source: last_error.unwrap_or_else(|| io::Error::other("control pipe never opened")),
  })
}

/// Arguments putting MPlayer in slave mode, reading commands from `fifo`.
pub fn slave_args(fifo: &Path, file: &Path, extra_args: &[String]) -> Vec<String> {
  let mut args = vec![
    "-slave".to_string(),
    "-quiet".to_string(),
    "-input".to_string(),
    format!("file={}", fifo.display()),
  ];
  args.extend(extra_args.iter().cloned());
  args.push(file.display().to_string());
  args
}

/// Spawn MPlayer in slave mode with its stdout piped back to us.
pub fn spawn_mplayer(
  mplayer_exe: &Path,
  fifo: &Path,
  file: &Path,
  extra_args: &[String],
) -> Result<Child, ProcessError> {
  let args = slave_args(fifo, file, extra_args);

  log::info!("Spawning MPlayer: {:?} {:?}", mplayer_exe, args);

  Command::new(mplayer_exe)
    .args(&args)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()
    .map_err(ProcessError::SpawnFailed)
}

/// How the player process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
  pub code: Option<i32>,
  pub signal: Option<i32>,
}

impl ExitInfo {
  pub fn is_success(&self) -> bool {
    self.code == Some(0) && self.signal.is_none()
  }
}

impl From<ExitStatus> for ExitInfo {
  fn from(status: ExitStatus) -> Self {
    use std::os::unix::process::ExitStatusExt;

    Self {
      code: status.code(),
      signal: status.signal(),
    }
  }
}
