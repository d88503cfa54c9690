//! Single scheduler per project, enforced with a PID file.

use crate::error::ScheduleError;
use anyhow::{Context, Result, bail};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held while a scheduler runs a project. Dropping it removes the PID file
/// and any stop file.
#[derive(Debug)]
pub struct ProjectLease {
    pid_file: PathBuf,
    stop_file: PathBuf,
}

pub fn pid_file(state_dir: &Path, project: &str) -> PathBuf {
    state_dir.join(format!("{}.pid", project))
}

pub fn stop_file(state_dir: &Path, project: &str) -> PathBuf {
    state_dir.join(format!("{}.stop", project))
}

/// Ask a running scheduler to stop after its current cycle. Returns false
/// when no scheduler holds the project.
pub fn request_stop(state_dir: &Path, project: &str) -> Result<bool> {
    let pid_path = pid_file(state_dir, project);
    match read_pid(&pid_path) {
        Some(pid) if process_alive(pid) => {}
        _ => return Ok(false),
    }
    let path = stop_file(state_dir, project);
    fs::write(&path, b"").with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

/// PID of the scheduler holding `project`, if one is alive.
pub fn holder(state_dir: &Path, project: &str) -> Option<u32> {
    read_pid(&pid_file(state_dir, project)).filter(|&pid| process_alive(pid))
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without /proc there is no cheap check; treat the holder as alive
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl ProjectLease {
    /// Take the project. Fails if another live process holds it; a stale
    /// PID file is replaced.
    pub fn acquire(state_dir: &Path, project: &str) -> Result<Self> {
        fs::create_dir_all(state_dir).with_context(|| format!("creating {}", state_dir.display()))?;
        let pid_path = pid_file(state_dir, project);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&pid_path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    let stop_path = stop_file(state_dir, project);
                    if stop_path.exists() {
                        debug!(path = %stop_path.display(), "removing leftover stop file");
                        fs::remove_file(&stop_path)?;
                    }
                    return Ok(Self {
                        pid_file: pid_path,
                        stop_file: stop_path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_pid(&pid_path) {
                    Some(pid) if process_alive(pid) => {
                        return Err(ScheduleError::AlreadyRunning {
                            project: project.to_string(),
                            pid,
                        }
                        .into());
                    }
                    stale => {
                        warn!(path = %pid_path.display(), pid = ?stale, "replacing stale pid file");
                        fs::remove_file(&pid_path)?;
                    }
                },
                Err(e) => return Err(e).with_context(|| format!("creating {}", pid_path.display())),
            }
        }
        bail!("could not take {} after removing a stale copy", pid_path.display())
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn stop_file(&self) -> &Path {
        &self.stop_file
    }
}

impl Drop for ProjectLease {
    fn drop(&mut self) {
        for path in [&self.pid_file, &self.stop_file] {
            if let Err(e) = fs::remove_file(path)
                && e.kind() != ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "could not remove lease file");
            }
        }
    }
}
