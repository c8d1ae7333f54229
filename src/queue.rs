//! Filesystem-backed persistent queue.
//!
//! An entry's filename is its entire durable state: `<deadline_hex>.
//! <step_hex>.<uid>`, with a `.tmp` suffix while the payload is still
//! being written. Renames are the only state transitions, which makes
//! every transition atomic on a POSIX filesystem and lets enqueue clients
//! commit entries without taking the queue lock. The payload file holds
//! the contact name on the first line and the message body byte-for-byte
//! after it.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nix::unistd::{access, AccessFlags};
use tracing::{debug, trace};

use crate::{
    constants::{LOCK_FILE_NAME, TMP_SUFFIX},
    error::NotifygError,
    lock::ProcessLock,
    retry::{RetryPolicy, RetryToken},
};

/// Per-process counter folded into uids so that entries minted within the
/// same wall-clock second stay distinct.
static UID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generates a unique entry id from pid, wall time, a monotonic counter
/// and 32 random bits. Collision-free as long as a pid rollover takes at
/// least one second.
fn generate_uid() -> String {
    let pid = std::process::id();
    let now = unix_now();
    let counter = UID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let entropy: u32 = rand::random();
    format!("{pid:x}-{now:x}-{counter:x}-{entropy:08x}")
}

/// One pending notification, fully described by its filename.
#[derive(Debug, Clone, Eq)]
pub struct QueueEntry {
    deadline: u64,
    step: u32,
    uid: String,
    temporary: bool,
}

impl PartialEq for QueueEntry {
    /// Entries are equal iff they share a uid; deadline and step change
    /// across renames while the uid stays stable.
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl std::hash::Hash for QueueEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

impl QueueEntry {
    /// Mints a fresh committed entry with `deadline = now` and step 0.
    pub fn new() -> Self {
        Self {
            deadline: unix_now(),
            step: 0,
            uid: generate_uid(),
            temporary: false,
        }
    }

    /// Parses a filename into an entry. Hidden files and names that do not
    /// follow the codec yield `None`; a `.tmp` suffix marks the entry as
    /// temporary.
    pub fn parse(name: &str) -> Option<Self> {
        if name.starts_with('.') {
            return None;
        }
        let (stem, temporary) = match name.strip_suffix(TMP_SUFFIX) {
            Some(stem) => (stem, true),
            None => (name, false),
        };
        let mut parts = stem.splitn(3, '.');
        let deadline = u64::from_str_radix(parts.next()?, 16).ok()?;
        let step = u32::from_str_radix(parts.next()?, 16).ok()?;
        let uid = parts.next()?;
        if uid.is_empty() {
            return None;
        }
        Some(Self {
            deadline,
            step,
            uid: uid.to_string(),
            temporary,
        })
    }

    /// The committed filename of this entry.
    pub fn file_name(&self) -> String {
        format!("{:x}.{:x}.{}", self.deadline, self.step, self.uid)
    }

    /// The in-progress filename used while the payload is written.
    pub fn tmp_file_name(&self) -> String {
        format!("{}{}", self.file_name(), TMP_SUFFIX)
    }

    /// Earliest time (unix seconds) the loop may act on this entry.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Index into the retry policy.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Opaque unique id, stable across renames.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Whether the filename carries the `.tmp` suffix.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Produces a successor entry: `wait` seconds are added onto
    /// `max(now, deadline)` and the step is replaced when given. The uid
    /// is preserved, so old and new entry still compare equal.
    pub fn modify(&self, wait: u64, step: Option<u32>) -> Self {
        Self {
            deadline: unix_now().max(self.deadline) + wait,
            step: step.unwrap_or(self.step),
            uid: self.uid.clone(),
            temporary: self.temporary,
        }
    }

    /// How long until this entry becomes due.
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.deadline.saturating_sub(unix_now()))
    }
}

impl Default for QueueEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Directory-scoped store of queue entries.
pub struct PersistentQueue {
    queuedir: PathBuf,
    policy: RetryPolicy,
    lock: Option<ProcessLock>,
}

impl PersistentQueue {
    /// Opens a queue over an existing directory. The directory must be
    /// readable, writable and searchable.
    pub fn new(queuedir: PathBuf, policy: RetryPolicy) -> Result<Self, NotifygError> {
        if !queuedir.is_dir() {
            return Err(NotifygError::QueueDir(format!(
                "{} does not exist or is not a directory",
                queuedir.display()
            )));
        }
        access(
            &queuedir,
            AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK,
        )
        .map_err(|_| {
            NotifygError::QueueDir(format!(
                "{} lacks required permissions",
                queuedir.display()
            ))
        })?;
        Ok(Self {
            queuedir,
            policy,
            lock: None,
        })
    }

    /// The directory this queue lives in.
    pub fn queuedir(&self) -> &Path {
        &self.queuedir
    }

    /// The retry policy entries are interpreted against.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.queuedir.join(file_name)
    }

    fn io_err(&self, path: PathBuf, source: io::Error) -> NotifygError {
        NotifygError::QueueIo { path, source }
    }

    /// Walks the policy from the entry's current step, folding wait tokens
    /// into the deadline (or skipping them when `fast`) until the step
    /// points at a provider or GIVEUP. The queue itself is not touched.
    pub fn advance_waits(&self, mut entry: QueueEntry, fast: bool) -> QueueEntry {
        while let RetryToken::Wait(seconds) = self.policy.token_at(entry.step()) {
            let wait = if fast { 0 } else { *seconds };
            entry = entry.modify(wait, Some(entry.step() + 1));
        }
        entry
    }

    /// Atomically commits a new entry: the payload is written to the
    /// temporary filename first, then renamed into place. Leading wait
    /// tokens are folded in beforehand so the committed step already
    /// points at the first provider.
    pub fn enqueue(&self, contact: &str, message: &str) -> Result<QueueEntry, NotifygError> {
        let entry = self.advance_waits(QueueEntry::new(), false);
        let tmp_path = self.path_for(&entry.tmp_file_name());
        let final_path = self.path_for(&entry.file_name());
        fs::write(&tmp_path, format!("{contact}\n{message}"))
            .map_err(|err| self.io_err(tmp_path.clone(), err))?;
        fs::rename(&tmp_path, &final_path)
            .map_err(|err| self.io_err(final_path.clone(), err))?;
        debug!(entry = %entry, contact, "enqueued notification");
        Ok(entry)
    }

    /// Lists every committed entry whose filename parses. Temporary and
    /// unrecognized files are skipped.
    pub fn iter_entries(&self) -> Result<Vec<QueueEntry>, NotifygError> {
        let dir = fs::read_dir(&self.queuedir)
            .map_err(|err| self.io_err(self.queuedir.clone(), err))?;
        let mut entries = Vec::new();
        for item in dir {
            let item = item.map_err(|err| self.io_err(self.queuedir.clone(), err))?;
            let name = item.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            trace!(name, "inspecting queue file");
            match QueueEntry::parse(name) {
                Some(entry) if !entry.is_temporary() => entries.push(entry),
                _ => {}
            }
        }
        Ok(entries)
    }

    /// Returns the entry with the smallest deadline; ties are broken by
    /// lexical filename comparison for determinism.
    pub fn find_next(&self) -> Result<Option<QueueEntry>, NotifygError> {
        Ok(self
            .iter_entries()?
            .into_iter()
            .min_by_key(|entry| (entry.deadline(), entry.file_name())))
    }

    /// Reads an entry's payload as `(contact, message)`. A payload without
    /// a newline is contact-only with an empty message.
    pub fn contents(&self, entry: &QueueEntry) -> Result<(String, String), NotifygError> {
        let path = self.path_for(&entry.file_name());
        let raw = fs::read_to_string(&path).map_err(|err| self.io_err(path, err))?;
        Ok(match raw.split_once('\n') {
            Some((contact, message)) => (contact.to_string(), message.to_string()),
            None => (raw, String::new()),
        })
    }

    /// Removes a delivered (or given-up) entry.
    pub fn entry_done(&self, entry: &QueueEntry) -> Result<(), NotifygError> {
        let path = self.path_for(&entry.file_name());
        fs::remove_file(&path).map_err(|err| self.io_err(path, err))
    }

    /// Advances an entry past the current provider: the step is
    /// incremented, subsequent wait tokens are folded into the deadline
    /// (skipped when `fast`), and the file is renamed atomically.
    pub fn entry_next(&self, entry: &QueueEntry, fast: bool) -> Result<QueueEntry, NotifygError> {
        let advanced =
            self.advance_waits(entry.modify(0, Some(entry.step() + 1)), fast);
        let old_path = self.path_for(&entry.file_name());
        let new_path = self.path_for(&advanced.file_name());
        fs::rename(&old_path, &new_path).map_err(|err| self.io_err(new_path.clone(), err))?;
        Ok(advanced)
    }

    /// Removes every committed entry without processing it. Temporary
    /// files from crashed writers are left alone. Idempotent.
    pub fn clear(&self) -> Result<(), NotifygError> {
        for entry in self.iter_entries()? {
            debug!(entry = %entry, "clearing queue entry");
            match self.entry_done(&entry) {
                Ok(()) => {}
                // A concurrent delivery may have removed it already.
                Err(NotifygError::QueueIo { ref source, .. })
                    if source.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Takes the queue lock. The delivery daemon holds it for its entire
    /// lifetime; enqueue clients never take it.
    pub fn lock(&mut self) -> Result<(), NotifygError> {
        if self.lock.is_some() {
            return Err(NotifygError::AlreadyLocked);
        }
        let mut lock = ProcessLock::new(self.queuedir.join(LOCK_FILE_NAME));
        if !lock.try_acquire()? {
            return Err(NotifygError::QueueLocked {
                owner: lock.owner(),
            });
        }
        self.lock = Some(lock);
        Ok(())
    }

    /// Releases the queue lock if held.
    pub fn unlock(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release(false);
        }
    }

    /// Pid of the process holding the queue lock, if any.
    pub fn lock_owner(&self) -> Option<i32> {
        match &self.lock {
            Some(lock) => lock.owner(),
            None => ProcessLock::new(self.queuedir.join(LOCK_FILE_NAME)).owner(),
        }
    }
}

impl Drop for PersistentQueue {
    fn drop(&mut self) {
        self.unlock();
    }
}
