//! Background session thread of the persistent XMPP transport.
//!
//! The thread owns the only connection to the server. It dispatches
//! presence and message stanzas into the shared presence table, answers
//! user commands, serves ping requests from the delivery thread, and
//! reconnects with bounded, jittered backoff when the stream dies or a
//! reconnect trigger arrives.

use std::{
    sync::{atomic::Ordering, mpsc, Arc},
    time::{Duration, Instant},
};

use futures::StreamExt;
use rand::Rng;
use tokio::{sync::mpsc::UnboundedReceiver, time::sleep};
use tokio_xmpp::{starttls::ServerConfig, AsyncClient, Error, Event};
use tracing::{debug, error, info, warn};
use xmpp_parsers::{
    iq::{Iq, IqType},
    jid::{BareJid, FullJid, Jid},
    message::{Body, Message, MessageType},
    minidom::Element,
    ns,
    ping::Ping,
    presence::{Presence, Show, Type as PresenceType},
    roster::Roster,
};

type Client = AsyncClient<ServerConfig>;

use crate::constants::{JABBER_HELP_TEXT, MAX_RECONNECT_WAIT, SESSION_IDLE_TIMEOUT};

use super::state::{ResourceSetting, Shared};

/// Stanza id of the initial roster request.
const ROSTER_REQUEST_ID: &str = "roster-init";

/// Granularity of termination checks during reconnect waits.
const RECONNECT_TICK: Duration = Duration::from_secs(1);

/// Commands from the delivery thread into the session thread. Replaces
/// the trigger pipe of a select-based design.
pub(crate) enum Cmd {
    /// Write these stanzas to the stream.
    Deliver(Vec<Element>),
    /// Ping our own server and report whether it answered.
    Ping(mpsc::Sender<bool>),
    /// Tear the current session down and reconnect.
    Reconnect,
    /// Shut the session thread down for good.
    Terminate,
}

/// Why a session loop ended.
enum SessionEnd {
    Reconnect,
    Terminate,
}

struct PendingPing {
    id: String,
    reply: mpsc::Sender<bool>,
    sent: Instant,
}

/// Backoff before reconnect attempt `attempts`: grows linearly with
/// jitter, capped at two minutes.
fn reconnect_delay(attempts: u32) -> Duration {
    let jitter: u64 = rand::thread_rng().gen_range(1..=10);
    Duration::from_secs(10 * u64::from(attempts) + jitter).min(MAX_RECONNECT_WAIT)
}

/// Interprets a presence `show` value as a state name.
fn show_name(show: Option<Show>) -> &'static str {
    match show {
        None => "online",
        Some(Show::Away) => "away",
        Some(Show::Chat) => "chat",
        Some(Show::Dnd) => "dnd",
        Some(Show::Xa) => "xa",
    }
}

/// Re-parses a JID as resourceful; bare JIDs yield `None`.
fn as_full(jid: &Jid) -> Option<FullJid> {
    FullJid::new(&jid.to_string()).ok()
}

/// Builds an outbound message stanza.
pub(super) fn chat_message(to: Jid, body: &str) -> Element {
    let mut message = Message::new(Some(to));
    message.type_ = MessageType::Normal;
    message.bodies.insert(String::new(), Body(body.to_string()));
    message.into()
}

/// Builds an outbound presence stanza with an optional show value.
fn presence_update(to: Option<Jid>, show: Option<Show>) -> Element {
    let mut presence = Presence::new(PresenceType::None);
    presence.to = to;
    presence.show = show;
    presence.into()
}

/// The session thread's long-running task.
pub(crate) struct SessionTask {
    pub(crate) jid: FullJid,
    pub(crate) password: String,
    pub(crate) ping_timeout: Duration,
    pub(crate) shared: Arc<Shared>,
    pub(crate) cmd_rx: UnboundedReceiver<Cmd>,
}

impl SessionTask {
    fn terminating(&self) -> bool {
        self.shared.terminating.load(Ordering::SeqCst)
    }

    /// Connects, processes the session, reconnects. Runs until the owner
    /// terminates the provider or the server rejects authentication.
    pub(crate) async fn run(mut self) {
        let mut attempts: u32 = 0;
        'outer: loop {
            if self.terminating() {
                break;
            }
            debug!(jid = %self.jid, attempt = attempts, "starting xmpp session");
            let mut client = Client::new(Jid::from(self.jid.clone()), self.password.clone());
            let end = self.session(&mut client, &mut attempts).await;
            self.shared.mark_unusable();
            if let SessionEnd::Terminate = end {
                let _ = client.send_end().await;
                break;
            }
            attempts = attempts.saturating_add(1);
            let wait = reconnect_delay(attempts);
            debug!(seconds = wait.as_secs(), "waiting before xmpp reconnect");
            let mut waited = Duration::ZERO;
            while waited < wait {
                if self.terminating() {
                    break 'outer;
                }
                sleep(RECONNECT_TICK).await;
                waited += RECONNECT_TICK;
            }
        }
        info!("xmpp session thread terminated");
    }

    /// One connection's event loop. Returns how the session ended; the
    /// stanza counter in `attempts` is reset on any successful traffic.
    async fn session(&mut self, client: &mut Client, attempts: &mut u32) -> SessionEnd {
        let mut pending_ping: Option<PendingPing> = None;
        loop {
            if self.terminating() {
                return SessionEnd::Terminate;
            }
            tokio::select! {
                event = client.next() => match event {
                    None => {
                        warn!("xmpp stream ended");
                        return SessionEnd::Reconnect;
                    }
                    Some(Event::Online { bound_jid, .. }) => {
                        debug!(jid = %bound_jid, "xmpp stream online; requesting roster");
                        let roster_request = Iq::from_get(
                            ROSTER_REQUEST_ID,
                            Roster { ver: None, items: vec![] },
                        );
                        if client.send_stanza(roster_request.into()).await.is_err()
                            || client.send_stanza(presence_update(None, None)).await.is_err()
                        {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(Event::Stanza(stanza)) => {
                        *attempts = 0;
                        if self
                            .handle_stanza(client, stanza, &mut pending_ping)
                            .await
                            .is_err()
                        {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(Event::Disconnected(err)) => {
                        if matches!(&err, Error::Auth(_)) {
                            error!(error = %err, "xmpp authentication rejected");
                            self.shared.auth_failed.store(true, Ordering::SeqCst);
                            return SessionEnd::Terminate;
                        }
                        warn!(error = %err, "xmpp stream disconnected");
                        return SessionEnd::Reconnect;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Cmd::Terminate) => return SessionEnd::Terminate,
                    Some(Cmd::Reconnect) => {
                        debug!("session thread received reconnect trigger");
                        return SessionEnd::Reconnect;
                    }
                    Some(Cmd::Deliver(stanzas)) => {
                        for stanza in stanzas {
                            if let Err(err) = client.send_stanza(stanza).await {
                                warn!(error = %err, "failed to send xmpp message");
                                return SessionEnd::Reconnect;
                            }
                        }
                    }
                    Some(Cmd::Ping(reply)) => {
                        match self.send_ping(client).await {
                            Ok(id) => {
                                pending_ping = Some(PendingPing {
                                    id,
                                    reply,
                                    sent: Instant::now(),
                                });
                            }
                            Err(()) => {
                                let _ = reply.send(false);
                                return SessionEnd::Reconnect;
                            }
                        }
                    }
                },
                _ = sleep(SESSION_IDLE_TIMEOUT) => {
                    // Idle housekeeping: expire a ping nobody answered.
                    let expired = pending_ping
                        .as_ref()
                        .is_some_and(|ping| ping.sent.elapsed() >= self.ping_timeout);
                    if expired && let Some(ping) = pending_ping.take() {
                        debug!("expiring unanswered xmpp ping");
                        self.record_ping(ping, false);
                    }
                }
            }
        }
    }

    /// Sends an application-layer ping to our own domain.
    async fn send_ping(&self, client: &mut Client) -> Result<String, ()> {
        let id = format!("ping-{}", rand::random::<u32>());
        let mut ping = Iq::from_get(id.clone(), Ping);
        ping.to = Some(Jid::from(BareJid::from_parts(None, self.jid.domain())));
        match client.send_stanza(ping.into()).await {
            Ok(_) => Ok(id),
            Err(err) => {
                warn!(error = %err, "failed to send xmpp ping");
                Err(())
            }
        }
    }

    fn record_ping(&self, ping: PendingPing, answered: bool) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.last_ping = Some((Instant::now(), answered));
        }
        let _ = ping.reply.send(answered);
    }

    /// Dispatches one inbound stanza. `Err` means the session is beyond
    /// repair and must reconnect.
    async fn handle_stanza(
        &mut self,
        client: &mut Client,
        stanza: Element,
        pending_ping: &mut Option<PendingPing>,
    ) -> Result<(), ()> {
        if stanza.is("presence", ns::DEFAULT_NS) {
            if let Ok(presence) = Presence::try_from(stanza) {
                self.handle_presence(presence);
            }
            return Ok(());
        }
        if stanza.is("message", ns::DEFAULT_NS) {
            if let Ok(message) = Message::try_from(stanza) {
                return self.handle_message(client, message).await;
            }
            return Ok(());
        }
        if stanza.is("iq", ns::DEFAULT_NS)
            && let Ok(iq) = Iq::try_from(stanza)
        {
            return self.handle_iq(client, iq, pending_ping).await;
        }
        Ok(())
    }

    /// Maintains the presence table from available/unavailable stanzas.
    fn handle_presence(&self, presence: Presence) {
        let Some(from) = presence.from else {
            return;
        };
        let Some(full) = as_full(&from) else {
            return;
        };
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        match presence.type_ {
            PresenceType::None => {
                let state_name = show_name(presence.show);
                debug!(jid = %full, state = state_name, "contact went online");
                state.resource_available(full, state_name.to_string());
            }
            PresenceType::Unavailable => {
                debug!(jid = %full, "contact went offline");
                state.resource_unavailable(&full);
            }
            _ => {}
        }
    }

    /// Handles user commands sent as messages from known resources.
    /// Messages from unknown JIDs are dropped.
    async fn handle_message(
        &mut self,
        client: &mut Client,
        message: Message,
    ) -> Result<(), ()> {
        let Some(from) = message.from.clone() else {
            return Ok(());
        };
        let Some(full) = as_full(&from) else {
            return Ok(());
        };
        let known = match self.shared.state.lock() {
            Ok(state) => state.knows_resource(&full),
            Err(_) => false,
        };
        if !known {
            return Ok(());
        }
        let Some(body) = message.bodies.get("").map(|body| body.0.clone()) else {
            return Ok(());
        };
        if body == "help" {
            debug!(jid = %full, "answering help command");
            return client
                .send_stanza(chat_message(from, JABBER_HELP_TEXT))
                .await
                .map(|_| ())
                .map_err(|_| ());
        }
        let Some(setting) = ResourceSetting::from_command(&body) else {
            return Ok(());
        };
        let changed = match self.shared.state.lock() {
            Ok(mut state) => state.update_setting(&full, setting),
            Err(_) => None,
        };
        if let Some(setting) = changed {
            debug!(jid = %full, ?setting, "user changed delivery setting");
            let show = match setting {
                ResourceSetting::Normal => None,
                ResourceSetting::Ignore => Some(Show::Away),
                ResourceSetting::Disable => Some(Show::Dnd),
            };
            return client
                .send_stanza(presence_update(Some(from), show))
                .await
                .map(|_| ())
                .map_err(|_| ());
        }
        Ok(())
    }

    /// Handles iq results (roster, pings) and answers server pings.
    async fn handle_iq(
        &mut self,
        client: &mut Client,
        iq: Iq,
        pending_ping: &mut Option<PendingPing>,
    ) -> Result<(), ()> {
        match iq.payload {
            IqType::Result(payload) => {
                if pending_ping.as_ref().is_some_and(|ping| ping.id == iq.id) {
                    if let Some(ping) = pending_ping.take() {
                        self.record_ping(ping, true);
                    }
                    return Ok(());
                }
                if iq.id == ROSTER_REQUEST_ID {
                    let Some(payload) = payload else {
                        return Ok(());
                    };
                    match Roster::try_from(payload) {
                        Ok(roster) => {
                            let count = roster.items.len();
                            if let Ok(mut state) = self.shared.state.lock() {
                                state.roster =
                                    roster.items.into_iter().map(|item| item.jid).collect();
                            }
                            self.shared.usable.store(true, Ordering::SeqCst);
                            info!(contacts = count, "xmpp roster received; connection usable");
                        }
                        Err(err) => warn!(error = %err, "failed to parse roster"),
                    }
                }
                Ok(())
            }
            IqType::Error(_) => {
                if pending_ping.as_ref().is_some_and(|ping| ping.id == iq.id) {
                    if let Some(ping) = pending_ping.take() {
                        self.record_ping(ping, false);
                    }
                    return Ok(());
                }
                if iq.id == ROSTER_REQUEST_ID {
                    warn!("xmpp roster request failed");
                    return Err(());
                }
                Ok(())
            }
            IqType::Get(payload) => {
                // Answer server-side XEP-0199 pings to keep the stream
                // alive.
                if payload.is("ping", ns::PING)
                    && let Some(from) = iq.from
                {
                    let pong = Iq {
                        from: None,
                        to: Some(from),
                        id: iq.id,
                        payload: IqType::Result(None),
                    };
                    return client
                        .send_stanza(pong.into())
                        .await
                        .map(|_| ())
                        .map_err(|_| ());
                }
                Ok(())
            }
            IqType::Set(_) => Ok(()),
        }
    }
}
