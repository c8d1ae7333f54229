//! Single-holder advisory lock over a directory.
//!
//! The lock is a symbolic link whose target text is the holder's decimal
//! pid. Symlink creation is atomic, which makes the link a reliable mutual
//! exclusion primitive, and the embedded pid lets a later process detect a
//! stale lock (holder died without unlinking) and reap it.

use std::{
    fs, io,
    os::unix::fs::symlink,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use nix::{sys::signal::kill, unistd::Pid};
use tracing::debug;

use crate::error::NotifygError;

/// Exclusive ownership of a directory by at most one live process.
pub struct ProcessLock {
    path: PathBuf,
    pid: i32,
    held: bool,
}

impl ProcessLock {
    /// Creates a lock handle for the given symlink path. No lock is taken
    /// until [`try_acquire`](Self::try_acquire) succeeds.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pid: std::process::id() as i32,
            held: false,
        }
    }

    /// Returns the pid recorded in the lock symlink, or `None` when the
    /// link is absent or its target is not a number.
    pub fn owner(&self) -> Option<i32> {
        let target = fs::read_link(&self.path).ok()?;
        target.to_str()?.parse().ok()
    }

    /// Attempts to take the lock without blocking.
    ///
    /// On collision the recorded owner is probed with a zero signal; a
    /// dead owner's link is unlinked and creation retried once. Returns
    /// `false` on any contention instead of an error. Asking an instance
    /// that already holds the lock is a programming error.
    pub fn try_acquire(&mut self) -> Result<bool, NotifygError> {
        if self.held {
            return Err(NotifygError::AlreadyLocked);
        }
        let mut reaped_stale = false;
        loop {
            match symlink(self.pid.to_string(), &self.path) {
                Ok(()) => {
                    self.held = true;
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(_) => return Ok(false),
            }
            if reaped_stale {
                // Someone else re-created the link between our unlink and
                // retry; they won.
                return Ok(false);
            }
            let Some(owner) = self.owner() else {
                return Ok(false);
            };
            match kill(Pid::from_raw(owner), None) {
                Ok(()) => return Ok(false),
                Err(nix::errno::Errno::ESRCH) => {}
                Err(_) => return Ok(false),
            }
            debug!(owner, path = ?self.path, "reaping stale lock of dead process");
            if fs::remove_file(&self.path).is_err() {
                return Ok(false);
            }
            reaped_stale = true;
        }
    }

    /// Polls [`try_acquire`](Self::try_acquire) until it succeeds or
    /// `maxwait` elapses. `None` waits indefinitely.
    pub fn acquire(
        &mut self,
        maxwait: Option<Duration>,
        interval: Duration,
    ) -> Result<bool, NotifygError> {
        let started = Instant::now();
        loop {
            if self.try_acquire()? {
                return Ok(true);
            }
            if let Some(maxwait) = maxwait
                && started.elapsed() >= maxwait
            {
                return Ok(false);
            }
            thread::sleep(interval);
        }
    }

    /// Releases the lock. Without `force`, the link is only unlinked when
    /// it still records our own pid; a tampered lock is left alone.
    pub fn release(&mut self, force: bool) -> bool {
        if !force && self.owner() != Some(self.pid) {
            return false;
        }
        self.held = false;
        fs::remove_file(&self.path).is_ok()
    }
}

impl Drop for ProcessLock {
    /// Best-effort release; a leaked lock is reaped by the next acquirer's
    /// stale detection.
    fn drop(&mut self) {
        if self.held {
            self.release(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join(".lock");
        let mut lock = ProcessLock::new(path.clone());
        assert!(lock.try_acquire().expect("first acquire should work"));
        assert_eq!(lock.owner(), Some(std::process::id() as i32));
        assert!(lock.release(false));
        assert!(!path.exists());
    }

    #[test]
    fn second_instance_is_rejected() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join(".lock");
        let mut first = ProcessLock::new(path.clone());
        assert!(first.try_acquire().expect("first acquire should work"));

        let mut second = ProcessLock::new(path);
        assert!(!second.try_acquire().expect("probe should not error"));
        assert_eq!(second.owner(), Some(std::process::id() as i32));
    }

    #[test]
    fn reacquire_is_a_programming_error() {
        let dir = tempdir().expect("failed to create tempdir");
        let mut lock = ProcessLock::new(dir.path().join(".lock"));
        assert!(lock.try_acquire().expect("first acquire should work"));
        assert!(matches!(
            lock.try_acquire(),
            Err(NotifygError::AlreadyLocked)
        ));
    }

    #[test]
    fn stale_lock_is_reaped() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join(".lock");
        // A pid far above any default pid_max; certainly not running.
        symlink("999999999", &path).expect("failed to plant stale lock");

        let mut lock = ProcessLock::new(path);
        assert!(lock.try_acquire().expect("stale lock should be reaped"));
        assert_eq!(lock.owner(), Some(std::process::id() as i32));
    }

    #[test]
    fn acquire_gives_up_after_maxwait() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join(".lock");
        let mut holder = ProcessLock::new(path.clone());
        assert!(holder.try_acquire().expect("first acquire should work"));

        let mut waiter = ProcessLock::new(path);
        let acquired = waiter
            .acquire(Some(Duration::from_millis(50)), Duration::from_millis(10))
            .expect("polling should not error");
        assert!(!acquired);

        holder.release(false);
        let acquired = waiter
            .acquire(Some(Duration::from_millis(50)), Duration::from_millis(10))
            .expect("polling should not error");
        assert!(acquired);
    }

    #[test]
    fn release_refuses_foreign_lock() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join(".lock");
        symlink("999999999", &path).expect("failed to plant foreign lock");

        let mut lock = ProcessLock::new(path.clone());
        assert!(!lock.release(false));
        assert!(path.exists());
        assert!(lock.release(true));
        assert!(!path.exists());
    }
}
