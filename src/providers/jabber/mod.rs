//! Persistent XMPP transport.
//!
//! One long-lived session delivers to recipients whose presence is
//! observed first. A background thread owns the connection (see
//! [`client`]); the delivery thread checks usability, roster membership
//! and server liveness before handing messages over, and classifies
//! every failure into the queue's retry taxonomy.

use std::{
    collections::HashSet,
    str::FromStr,
    sync::{
        atomic::Ordering,
        mpsc,
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use xmpp_parsers::jid::{BareJid, FullJid, Jid};

use crate::{
    config::DriverOptions,
    constants::{DEFAULT_INCLUDE_STATES, DEFAULT_PING_MAX_AGE, DEFAULT_PING_TIMEOUT,
        DEFAULT_RECONNECT_TIMEOUT},
    error::{NotifygError, SendError},
};

use super::{Provider, Recipient};

mod client;
mod state;

use client::{chat_message, Cmd, SessionTask};
use state::{Candidate, Shared};

/// Sends messages over a persistent XMPP session.
///
/// Options: `jid` (required, `node@domain/resource`), `password`
/// (required), `ping_timeout` (seconds, default 10), `ping_max_age`
/// (seconds, default 0), `reconnect_timeout` (seconds, default 600).
///
/// Contact attributes: `jabber` (required target JID),
/// `jabber_exclude_resources` (comma-separated resources that never
/// receive messages), `jabber_include_states` (comma-separated presence
/// states considered deliverable, default `online,chat`).
pub struct JabberProvider {
    shared: Arc<Shared>,
    cmd_tx: UnboundedSender<Cmd>,
    thread: Option<thread::JoinHandle<()>>,
    ping_timeout: Duration,
    ping_max_age: Duration,
    reconnect_timeout: Duration,
    last_reconnect: Mutex<Option<Instant>>,
}

fn duration_option(
    options: &DriverOptions,
    key: &str,
    default: Duration,
) -> Result<Duration, NotifygError> {
    Ok(options
        .get_u64(key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

/// Splits a comma-separated option into a set, dropping empty items.
fn parse_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extracts `(target, exclude_resources, include_states)` from a contact.
fn recipient_target(
    recipient: &Recipient<'_>,
) -> Result<(BareJid, HashSet<String>, HashSet<String>), SendError> {
    let raw = recipient.require("jabber")?;
    let jid = Jid::from_str(raw)
        .map_err(|err| SendError::Config(format!("failed to parse jabber id: {err}")))?;
    let target = jid.to_bare();

    let exclude = recipient
        .get("jabber_exclude_resources")
        .map(parse_set)
        .unwrap_or_default();
    let include = match recipient.get("jabber_include_states") {
        Some(raw) => parse_set(raw),
        None => DEFAULT_INCLUDE_STATES
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };
    if include.is_empty() {
        return Err(SendError::Config("jabber_include_states is empty".into()));
    }
    Ok((target, exclude, include))
}

impl JabberProvider {
    /// Validates the options, builds the session runtime and starts the
    /// background thread. The connection is established asynchronously;
    /// sends fail temporary until the roster has arrived.
    pub fn new(options: &DriverOptions) -> Result<Self, NotifygError> {
        let raw_jid = options.require_str("jid", "jabber")?;
        let jid = FullJid::from_str(&raw_jid).map_err(|err| {
            NotifygError::Config(format!(
                "jid must be of the form node@domain/resource: {err}"
            ))
        })?;
        if jid.node().is_none() {
            return Err(NotifygError::Config(
                "jid must be of the form node@domain/resource".into(),
            ));
        }
        let password = options.require_str("password", "jabber")?;
        let ping_timeout = duration_option(options, "ping_timeout", DEFAULT_PING_TIMEOUT)?;
        let ping_max_age = duration_option(options, "ping_max_age", DEFAULT_PING_MAX_AGE)?;
        let reconnect_timeout =
            duration_option(options, "reconnect_timeout", DEFAULT_RECONNECT_TIMEOUT)?;

        let shared = Arc::new(Shared::default());
        let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let task = SessionTask {
            jid,
            password,
            ping_timeout,
            shared: Arc::clone(&shared),
            cmd_rx,
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                NotifygError::Config(format!("failed to build xmpp runtime: {err}"))
            })?;
        let thread = thread::Builder::new()
            .name("notifyg-xmpp".into())
            .spawn(move || runtime.block_on(task.run()))
            .map_err(|err| {
                NotifygError::Config(format!("failed to spawn xmpp session thread: {err}"))
            })?;

        Ok(Self {
            shared,
            cmd_tx,
            thread: Some(thread),
            ping_timeout,
            ping_max_age,
            reconnect_timeout,
            last_reconnect: Mutex::new(None),
        })
    }

    /// Verifies the server still answers: reuses a young ping result or
    /// requests a fresh ping and waits up to `ping_timeout` for it.
    fn check_availability(&self) -> bool {
        if !self.shared.usable.load(Ordering::SeqCst) {
            return false;
        }
        if let Ok(state) = self.shared.state.lock()
            && let Some((at, answered)) = state.last_ping
            && at.elapsed() < self.ping_max_age
        {
            return answered;
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.cmd_tx.send(Cmd::Ping(reply_tx)).is_err() {
            return false;
        }
        reply_rx.recv_timeout(self.ping_timeout).unwrap_or(false)
    }

    /// Asks the session thread to reconnect. Triggers are debounced:
    /// while the connection is down, at most one reconnect per
    /// `reconnect_timeout` window is initiated.
    fn initiate_reconnect(&self) {
        let Ok(mut last_reconnect) = self.last_reconnect.lock() else {
            return;
        };
        if self.shared.usable.load(Ordering::SeqCst) {
            debug!("initiating jabber reconnect on usable connection");
        } else if last_reconnect.is_none_or(|at| at.elapsed() >= self.reconnect_timeout) {
            debug!("initiating reconnect because previous reconnect timed out");
        } else {
            debug!("not initiating jabber reconnect after recent reconnect");
            return;
        }
        self.shared.usable.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Cmd::Reconnect);
        *last_reconnect = Some(Instant::now());
    }
}

impl Provider for JabberProvider {
    fn send(&self, recipient: &Recipient<'_>, message: &str) -> Result<(), SendError> {
        if self.shared.auth_failed.load(Ordering::SeqCst) {
            return Err(SendError::Fatal("xmpp authentication rejected".into()));
        }
        let (target, exclude_resources, include_states) = recipient_target(recipient)?;

        if !self.shared.usable.load(Ordering::SeqCst) {
            self.initiate_reconnect();
            return Err(SendError::Temporary(
                "jabber client connection is not ready".into(),
            ));
        }
        {
            let state = self
                .shared
                .state
                .lock()
                .map_err(|_| SendError::Temporary("xmpp session state poisoned".into()))?;
            if !state.roster.contains(&target) {
                return Err(SendError::Permanent("contact is not on my roster".into()));
            }
        }
        if !self.check_availability() {
            self.initiate_reconnect();
            return Err(SendError::Temporary(
                "jabber server does not respond to ping, reconnecting".into(),
            ));
        }

        let candidates = {
            let state = self
                .shared
                .state
                .lock()
                .map_err(|_| SendError::Temporary("xmpp session state poisoned".into()))?;
            state
                .candidates(&target, &exclude_resources, &include_states)
                .ok_or_else(|| SendError::Temporary("target contact is offline".into()))?
        };
        if candidates.is_empty() {
            return Err(SendError::Temporary(
                "no usable resources/states found for contact".into(),
            ));
        }

        let mut stanzas = Vec::new();
        for candidate in candidates {
            match candidate {
                Candidate::Send(jid) => {
                    debug!(jid = %jid, "sending xmpp message");
                    stanzas.push(chat_message(Jid::from(jid), message));
                }
                Candidate::Placeholder(jid) => {
                    debug!(jid = %jid, "pretending to deliver; resource asked to be ignored");
                }
            }
        }
        if !stanzas.is_empty() {
            self.cmd_tx
                .send(Cmd::Deliver(stanzas))
                .map_err(|_| SendError::Temporary("xmpp session thread is gone".into()))?;
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.shared.terminating.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Cmd::Terminate);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            warn!("xmpp session thread panicked during shutdown");
        }
    }
}
