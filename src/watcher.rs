//! Directory watcher: blocks the delivery loop until the queue directory
//! changes, a wakeup signal arrives, or a timeout elapses.
//!
//! Two interchangeable implementations satisfy the same contract: one
//! subscribes to inotify move-in events (a committed enqueue is always a
//! rename into the directory), the other is a plain interruptible sleep.
//! Both share a self-pipe that the `SIGUSR1` handler writes to, so a
//! signal ends either wait early without error.

use std::{
    fs::File,
    io::Read,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    path::Path,
    sync::{
        atomic::{AtomicI32, Ordering},
        OnceLock,
    },
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::OFlag,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::{
        inotify::{AddWatchFlags, InitFlags, Inotify},
        signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    },
    unistd::pipe2,
};
use tracing::trace;

use crate::{config::NotifyKind, error::NotifygError};

/// Write end of the wakeup pipe, kept alive for the process lifetime.
static WAKE_WRITE: OnceLock<OwnedFd> = OnceLock::new();

/// Raw fd mirror of [`WAKE_WRITE`] readable from the signal handler.
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_wakeup_signal(_signum: libc::c_int) {
    let fd = WAKE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // write(2) is async-signal-safe; a full pipe already holds a
        // pending wakeup, so the result can be ignored.
        let token = [0u8; 1];
        unsafe { libc::write(fd, token.as_ptr().cast(), 1) };
    }
}

/// Handle that wakes a blocked watcher from another thread.
#[derive(Clone, Copy, Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    /// Writes one wakeup token into the pipe.
    pub fn wake(&self) {
        let token = [0u8; 1];
        unsafe { libc::write(self.fd, token.as_ptr().cast(), 1) };
    }
}

/// Read side of the `SIGUSR1` self-pipe.
pub struct WakeupPipe {
    read: File,
}

impl WakeupPipe {
    /// Creates the pipe and installs the `SIGUSR1` handler. May only be
    /// called once per process.
    pub fn install() -> Result<Self, NotifygError> {
        let (read_fd, write_fd) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        let raw_write = write_fd.as_raw_fd();
        WAKE_WRITE
            .set(write_fd)
            .map_err(|_| NotifygError::Config("wakeup pipe already installed".into()))?;
        WAKE_WRITE_FD.store(raw_write, Ordering::SeqCst);

        // SA_RESTART keeps unrelated syscalls unharmed; poll(2) still
        // returns early because the handler writes to the pipe.
        let action = SigAction::new(
            SigHandler::Handler(on_wakeup_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGUSR1, &action) }?;
        Ok(Self {
            read: File::from(read_fd),
        })
    }

    /// Duplicates the read side, e.g. to drive two watcher instances.
    pub fn try_clone(&self) -> Result<Self, NotifygError> {
        let read = self.read.try_clone().map_err(|err| {
            NotifygError::Sys(Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO)))
        })?;
        Ok(Self { read })
    }

    /// A handle other threads can use to end a wait early.
    pub fn waker(&self) -> Waker {
        Waker {
            fd: WAKE_WRITE_FD.load(Ordering::SeqCst),
        }
    }

    /// Consumes all pending wakeup tokens.
    fn drain(&mut self) {
        let mut buf = [0u8; 64];
        while matches!(self.read.read(&mut buf), Ok(n) if n > 0) {}
    }
}

/// Blocks until the queue directory changes, a wakeup arrives, or the
/// wait times out. Returning early spuriously is fine; the loop always
/// re-inspects the queue afterwards.
pub trait QueueWatcher: Send {
    /// Waits for at most `max_wait` (additionally capped by the
    /// watcher's configured maximum).
    fn wait(&mut self, max_wait: Duration) -> Result<(), NotifygError>;
}

fn poll_interruptible(fds: &mut [PollFd<'_>], timeout: Duration) -> Result<(), NotifygError> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
    match poll(fds, timeout) {
        // Timeouts and readiness are both just "go look at the queue".
        Ok(_) => Ok(()),
        // The wait is expected to be interrupted by signals.
        Err(Errno::EINTR) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Watcher backed by inotify move-in events on the queue directory.
pub struct InotifyWatcher {
    inotify: Inotify,
    wake: WakeupPipe,
    cap: Duration,
}

impl InotifyWatcher {
    /// Subscribes to `IN_MOVED_TO` on the queue directory.
    pub fn new(queuedir: &Path, wake: WakeupPipe, cap: Duration) -> Result<Self, NotifygError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(queuedir, AddWatchFlags::IN_MOVED_TO)?;
        Ok(Self { inotify, wake, cap })
    }

    fn drain_events(&self) {
        loop {
            match self.inotify.read_events() {
                Ok(events) => {
                    trace!(count = events.len(), "drained inotify events");
                    if events.is_empty() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }
}

impl QueueWatcher for InotifyWatcher {
    fn wait(&mut self, max_wait: Duration) -> Result<(), NotifygError> {
        let timeout = max_wait.min(self.cap);
        {
            let mut fds = [
                PollFd::new(self.wake.read.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN),
            ];
            poll_interruptible(&mut fds, timeout)?;
        }
        self.wake.drain();
        self.drain_events();
        Ok(())
    }
}

/// Fallback watcher: a signal-interruptible sleep without filesystem
/// events. Enqueues are still picked up via `SIGUSR1` or by deadline.
pub struct SignalWatcher {
    wake: WakeupPipe,
    cap: Duration,
}

impl SignalWatcher {
    /// Creates the fallback watcher over the shared wakeup pipe.
    pub fn new(wake: WakeupPipe, cap: Duration) -> Self {
        Self { wake, cap }
    }
}

impl QueueWatcher for SignalWatcher {
    fn wait(&mut self, max_wait: Duration) -> Result<(), NotifygError> {
        let timeout = max_wait.min(self.cap);
        {
            let mut fds = [PollFd::new(self.wake.read.as_fd(), PollFlags::POLLIN)];
            poll_interruptible(&mut fds, timeout)?;
        }
        self.wake.drain();
        Ok(())
    }
}

/// Builds the watcher selected by `general.notify`.
pub fn build_watcher(
    kind: NotifyKind,
    queuedir: &Path,
    wake: WakeupPipe,
    cap: Duration,
) -> Result<Box<dyn QueueWatcher>, NotifygError> {
    match kind {
        NotifyKind::Inotify => Ok(Box::new(InotifyWatcher::new(queuedir, wake, cap)?)),
        NotifyKind::Signal => Ok(Box::new(SignalWatcher::new(wake, cap))),
    }
}
