//! Shared state of the persistent XMPP session.
//!
//! The presence table and ping cache are written by the session thread
//! and read by the delivery thread under one mutex. Connection usability
//! is a lock-free flag; a racy read only means the next ping re-checks.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Instant,
};

use xmpp_parsers::jid::{BareJid, FullJid};

/// Per-resource user setting, changed by the user messaging the daemon.
/// Session-scoped on purpose: cleared on reconnect and when the resource
/// goes offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSetting {
    /// Deliver normally.
    Normal,
    /// Pretend to deliver without sending.
    Ignore,
    /// Do not deliver to this resource at all.
    Disable,
}

impl ResourceSetting {
    /// Parses a user command body into a setting.
    pub fn from_command(body: &str) -> Option<Self> {
        match body {
            "normal" => Some(Self::Normal),
            "ignore" => Some(Self::Ignore),
            "disable" => Some(Self::Disable),
            _ => None,
        }
    }
}

/// One online resource of a contact.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    /// The user's session-scoped delivery setting.
    pub setting: ResourceSetting,
    /// Presence state as announced by the resource (`online`, `away`,
    /// `chat`, `dnd`, `xa`, ...).
    pub state: String,
}

/// What the send path decided for one candidate resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Actually send a message to this resource.
    Send(FullJid),
    /// Count the resource as delivered without sending (`ignore`).
    Placeholder(FullJid),
}

/// Mutex-guarded part of the session state.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Presence table: bare JID → resourceful JID → entry.
    pub presence: HashMap<BareJid, HashMap<FullJid, ResourceEntry>>,
    /// Bare JIDs the server says we may address.
    pub roster: HashSet<BareJid>,
    /// Most recent completed ping: when it resolved and whether it was
    /// answered.
    pub last_ping: Option<(Instant, bool)>,
}

impl SessionState {
    /// Upserts a resource that announced availability.
    pub fn resource_available(&mut self, jid: FullJid, state: String) {
        self.presence.entry(jid.to_bare()).or_default().insert(
            jid,
            ResourceEntry {
                setting: ResourceSetting::Normal,
                state,
            },
        );
    }

    /// Removes a resource that went offline; drops the bare entry when no
    /// resource remains.
    pub fn resource_unavailable(&mut self, jid: &FullJid) {
        let bare = jid.to_bare();
        if let Some(inner) = self.presence.get_mut(&bare) {
            inner.remove(jid);
            if inner.is_empty() {
                self.presence.remove(&bare);
            }
        }
    }

    /// Whether any resource of this full JID is currently known.
    pub fn knows_resource(&self, jid: &FullJid) -> bool {
        self.presence
            .get(&jid.to_bare())
            .is_some_and(|inner| inner.contains_key(jid))
    }

    /// Updates a resource's setting. Returns the new setting only when it
    /// actually changed, so callers can skip redundant presence
    /// broadcasts.
    pub fn update_setting(
        &mut self,
        jid: &FullJid,
        setting: ResourceSetting,
    ) -> Option<ResourceSetting> {
        let entry = self.presence.get_mut(&jid.to_bare())?.get_mut(jid)?;
        if entry.setting == setting {
            return None;
        }
        entry.setting = setting;
        Some(setting)
    }

    /// Forgets everything tied to the session: presence, roster and ping
    /// state. Called on every reconnect.
    pub fn reset(&mut self) {
        self.presence.clear();
        self.roster.clear();
        self.last_ping = None;
    }

    /// Builds the candidate list for a target: resources that are not
    /// disabled, not excluded by name, and in an included state. `ignore`
    /// resources become placeholders.
    pub fn candidates(
        &self,
        target: &BareJid,
        exclude_resources: &HashSet<String>,
        include_states: &HashSet<String>,
    ) -> Option<Vec<Candidate>> {
        let inner = self.presence.get(target)?;
        let mut picked = Vec::new();
        for (jid, entry) in inner {
            if entry.setting == ResourceSetting::Disable {
                continue;
            }
            if exclude_resources.contains(jid.resource().as_str()) {
                continue;
            }
            if !include_states.contains(&entry.state) {
                continue;
            }
            if entry.setting == ResourceSetting::Ignore {
                picked.push(Candidate::Placeholder(jid.clone()));
            } else {
                picked.push(Candidate::Send(jid.clone()));
            }
        }
        Some(picked)
    }
}

/// State shared between the delivery thread and the session thread.
#[derive(Debug, Default)]
pub struct Shared {
    /// Mutex-guarded presence/roster/ping state.
    pub state: Mutex<SessionState>,
    /// Whether the connection is believed usable. Racy reads are fine;
    /// the send path re-verifies with a ping.
    pub usable: AtomicBool,
    /// Set once when the owner terminates the provider.
    pub terminating: AtomicBool,
    /// Latched when the server rejected our credentials; turns every
    /// subsequent send into a fatal error.
    pub auth_failed: AtomicBool,
}

impl Shared {
    /// Marks the connection unusable and wipes session-scoped state.
    pub fn mark_unusable(&self) {
        self.usable.store(false, Ordering::SeqCst);
        if let Ok(mut state) = self.state.lock() {
            state.reset();
        }
    }
}
