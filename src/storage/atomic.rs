//! Atomic file primitives for cross-daemon table writes.
//!
//! Writers stage to `<path>.tmp<pid>` and swap in with an atomic rename.
//! Cross-daemon exclusivity during read-modify-write is enforced by an
//! advisory `<path>.lock` file created with O_CREAT|O_EXCL.

use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(20);

/// Advisory file lock. Held from acquisition until drop; the lock file
/// holds the owning pid for post-mortem inspection.
pub struct FileLock {
    lock_path: PathBuf,
}

impl FileLock {
    /// Acquire the lock guarding `path`, spin-waiting up to 5s.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::acquire_timeout(path, LOCK_TIMEOUT)
    }

    pub fn acquire_timeout<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<Self> {
        let lock_path = PathBuf::from(format!("{}.lock", path.as_ref().display()));
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(Self { lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        bail!("lock busy: {}", lock_path.display());
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create lock {}", lock_path.display()))
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Path of the staging file for `path`, namespaced by pid so concurrent
/// processes never collide on the temp name.
pub fn staging_path<P: AsRef<Path>>(path: P) -> PathBuf {
    PathBuf::from(format!(
        "{}.tmp{}",
        path.as_ref().display(),
        std::process::id()
    ))
}

/// Atomically replace `path` with the fully-written staging file.
pub fn swap_into_place(staged: &Path, path: &Path) -> Result<()> {
    std::fs::rename(staged, path).with_context(|| {
        format!("rename {} -> {}", staged.display(), path.display())
    })?;
    Ok(())
}
