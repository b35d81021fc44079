// =============================================================================
// Process Lock — one live engine per machine
// =============================================================================
//
// A PID file at a fixed absolute path (default /tmp/vela-bot.pid, overridable
// via VELA_PID_FILE). Boot refuses to proceed while the file names a live
// process; a stale file left by a crash is replaced. The file is removed on
// clean shutdown via Drop.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID, refusing if another live process owns the file.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if pid_alive(pid) {
                    anyhow::bail!(
                        "another engine instance is running (pid {pid}, pid file {})",
                        path.display()
                    );
                }
                warn!(pid, path = %path.display(), "stale pid file found — replacing");
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let pid = std::process::id();
        std::fs::write(&path, pid.to_string())
            .with_context(|| format!("failed to write pid file {}", path.display()))?;
        info!(pid, path = %path.display(), "pid file acquired");

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = %e, path = %self.path.display(), "failed to remove pid file");
        }
    }
}

/// Whether a process with `pid` is currently alive. Linux procfs check.
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");

        {
            let _lock = PidFile::acquire(&path).unwrap();
            let written: u32 = std::fs::read_to_string(&path)
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            assert_eq!(written, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn refuses_while_owner_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");
        // Our own PID is certainly alive.
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        assert!(PidFile::acquire(&path).is_err());
    }

    #[test]
    fn replaces_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");
        // PID 0 is never a live userspace process.
        std::fs::write(&path, "0").unwrap();
        let _lock = PidFile::acquire(&path).unwrap();
    }
}
