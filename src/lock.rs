/// Advisory file locks used to keep a single supervisor alive and to
/// serialize watchdog checks.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Pause between attempts in [`InstanceLock::try_acquire_within`].
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// An exclusive lock on a file, released when dropped.
///
/// The owner's PID is written into the file once the lock is held. The file
/// itself is never removed; deleting a lock file another process may be
/// about to open would let two owners coexist.
#[derive(Debug)]
pub struct InstanceLock {
    // Held to maintain the lock; released on drop.
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without waiting. `Ok(None)` means another owner holds it.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<InstanceLock>> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self::claim(file, path)?)),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Like [`InstanceLock::try_acquire`], but keep retrying for up to `wait`
    /// before concluding the lock has a real owner. [`is_held`] has to take
    /// the lock for an instant to confirm an owner, and a contender must not
    /// mistake that for one.
    pub fn try_acquire_within(
        path: &Path,
        wait: Duration,
    ) -> std::io::Result<Option<InstanceLock>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Take the lock, waiting for the current owner to release it.
    pub fn acquire_blocking(path: &Path) -> std::io::Result<InstanceLock> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Self::claim(file, path)
    }

    fn claim(mut file: File, path: &Path) -> std::io::Result<InstanceLock> {
        // Truncate only now that we hold the lock, so a contender never
        // wipes the owner's PID.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(InstanceLock {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Clear the PID first so a released lock never reads as owned.
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

/// Whether some process currently holds the lock at `path`.
///
/// Only a live recorded owner is confirmed with a lock probe. An empty file or
/// a dead owner's PID reads as free without touching the lock, so polling this
/// while a new owner starts up cannot steal its acquisition.
pub fn is_held(path: &Path) -> std::io::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    match read_owner_pid(path) {
        Some(pid) if crate::status::pid_alive(pid) => {}
        _ => return Ok(false),
    }
    let file = OpenOptions::new().read(true).open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            file.unlock()?;
            Ok(false)
        }
        Err(e) if is_contended(&e) => Ok(true),
        Err(e) => Err(e),
    }
}

/// PID recorded by the last owner of the lock file, if readable.
pub fn read_owner_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
