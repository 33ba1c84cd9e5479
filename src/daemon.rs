//! Server supervision: PID file, log file, detached spawn.
//!
//! `server start` launches the current executable with the hidden
//! `server run` subcommand, detached, with stdout/stderr appended to the log
//! file. Liveness is probed with a zero-signal kill; a PID file whose
//! process is gone (ESRCH) is stale and gets reaped.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::error::{ConfigError, DaemonError};

/// Handle on the broker server's PID and log files.
pub struct Daemon {
    pid_path: PathBuf,
    log_path: PathBuf,
}

impl Daemon {
    /// Files under the default data directory (`~/.2kc/`).
    pub fn from_home() -> Result<Self, ConfigError> {
        let dir = Config::data_dir()?;
        Ok(Self::new(dir.join("server.pid"), dir.join("server.log")))
    }

    pub fn new(pid_path: PathBuf, log_path: PathBuf) -> Self {
        Self { pid_path, log_path }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Spawn the server detached and record its pid. Fails if one is
    /// already running; a stale PID file is reaped first.
    pub fn start(&self, config_path: Option<&Path>) -> Result<i32, DaemonError> {
        if let Some(pid) = self.read_pid()? {
            if process_alive(pid) {
                return Err(DaemonError::AlreadyRunning { pid });
            }
            tracing::debug!(pid, "reaping stale PID file");
            let _ = fs::remove_file(&self.pid_path);
        }

        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;

        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command
            .arg("server")
            .arg("run")
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so terminal signals to the CLI never reach
            // the server.
            command.process_group(0);
        }

        let child = command.spawn().map_err(DaemonError::Spawn)?;
        let pid = child.id() as i32;
        fs::write(&self.pid_path, format!("{pid}\n"))?;

        tracing::info!(pid, "broker server started");
        Ok(pid)
    }

    /// SIGTERM the recorded server and remove the PID file.
    pub fn stop(&self) -> Result<i32, DaemonError> {
        let Some(pid) = self.read_pid()? else {
            return Err(DaemonError::NotRunning);
        };
        if !process_alive(pid) {
            let _ = fs::remove_file(&self.pid_path);
            return Err(DaemonError::NotRunning);
        }

        terminate(pid)?;
        let _ = fs::remove_file(&self.pid_path);
        tracing::info!(pid, "broker server stopped");
        Ok(pid)
    }

    /// The live server pid, if any. Reaps a stale PID file on the way.
    pub fn status(&self) -> Result<Option<i32>, DaemonError> {
        match self.read_pid()? {
            Some(pid) if process_alive(pid) => Ok(Some(pid)),
            Some(_) => {
                let _ = fs::remove_file(&self.pid_path);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn read_pid(&self) -> Result<Option<i32>, DaemonError> {
        if !self.pid_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.pid_path)?;
        let pid = raw
            .trim()
            .parse::<i32>()
            .map_err(|e| DaemonError::BadPidFile {
                path: self.pid_path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(pid))
    }
}

/// Zero-signal probe: alive unless the kernel says the process is gone.
#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    // EPERM means the process exists but belongs to someone else.
    (unsafe { libc::kill(pid, 0) == 0 })
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: i32) -> Result<(), DaemonError> {
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        return Err(DaemonError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: i32) -> Result<(), DaemonError> {
    Err(DaemonError::NotRunning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn daemon(dir: &TempDir) -> Daemon {
        Daemon::new(dir.path().join("server.pid"), dir.path().join("server.log"))
    }

    #[test]
    fn no_pid_file_means_not_running() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);
        assert_eq!(d.status().unwrap(), None);
        assert!(matches!(d.stop(), Err(DaemonError::NotRunning)));
    }

    #[test]
    fn garbage_pid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);
        fs::write(dir.path().join("server.pid"), "not-a-pid").unwrap();
        assert!(matches!(d.status(), Err(DaemonError::BadPidFile { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_counts_as_alive() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);
        fs::write(
            dir.path().join("server.pid"),
            format!("{}\n", std::process::id()),
        )
        .unwrap();
        assert_eq!(d.status().unwrap(), Some(std::process::id() as i32));
    }

    #[cfg(unix)]
    #[test]
    fn stale_pid_file_is_reaped() {
        let dir = TempDir::new().unwrap();
        let d = daemon(&dir);

        // A child that has already been waited on is guaranteed gone.
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        fs::write(dir.path().join("server.pid"), format!("{pid}")).unwrap();
        assert_eq!(d.status().unwrap(), None);
        assert!(!dir.path().join("server.pid").exists(), "stale file kept");
    }
}
