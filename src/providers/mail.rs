//! Mail transport: delivers the message as an email through an SMTP
//! relay.

use lettre::{
    message::{header::ContentType, Mailbox},
    Message, SmtpTransport, Transport,
};
use tracing::debug;

use crate::{
    config::DriverOptions,
    constants::{DEFAULT_MAIL_SUBJECT, MAIL_BODY_PLACEHOLDER},
    error::{NotifygError, SendError},
};

use super::{Provider, Recipient};

/// Sends the message as an email.
///
/// Options: `from` (required sender address), `subject`, `body` (template
/// whose `MESSAGE` placeholder is replaced with the message text),
/// `forceto` (deliver everything to this address instead of the contact's
/// `email` attribute), `smtp_host`/`smtp_port` (relay, default
/// localhost:25).
pub struct MailProvider {
    from: Mailbox,
    subject: String,
    body: String,
    forceto: Option<Mailbox>,
    relay: SmtpTransport,
}

fn parse_mailbox(raw: &str, what: &str) -> Result<Mailbox, NotifygError> {
    raw.parse()
        .map_err(|err| NotifygError::Config(format!("invalid {what} address '{raw}': {err}")))
}

impl MailProvider {
    /// Builds the transport from driver options.
    pub fn new(options: &DriverOptions) -> Result<Self, NotifygError> {
        let from = parse_mailbox(&options.require_str("from", "mail")?, "from")?;
        let subject = options
            .get_str("subject")?
            .unwrap_or_else(|| DEFAULT_MAIL_SUBJECT.to_string());
        let body = options
            .get_str("body")?
            .unwrap_or_else(|| MAIL_BODY_PLACEHOLDER.to_string());
        let forceto = options
            .get_str("forceto")?
            .map(|raw| parse_mailbox(&raw, "forceto"))
            .transpose()?;
        let host = options
            .get_str("smtp_host")?
            .unwrap_or_else(|| "localhost".to_string());
        let port = options.get_u64("smtp_port")?.unwrap_or(25) as u16;
        // Plain relay to a local or trusted MTA, like the original
        // smtplib-based transport.
        let relay = SmtpTransport::builder_dangerous(&host).port(port).build();
        Ok(Self {
            from,
            subject,
            body,
            forceto,
            relay,
        })
    }
}

impl Provider for MailProvider {
    fn send(&self, recipient: &Recipient<'_>, message: &str) -> Result<(), SendError> {
        let mailto = match &self.forceto {
            Some(mailbox) => mailbox.clone(),
            None => recipient
                .require("email")?
                .parse()
                .map_err(|err| SendError::Config(format!("invalid email address: {err}")))?,
        };
        debug!(to = %mailto, "sending mail notification");
        let email = Message::builder()
            .from(self.from.clone())
            .to(mailto)
            .subject(self.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.replace(MAIL_BODY_PLACEHOLDER, message))
            .map_err(|err| SendError::Permanent(format!("failed to build mail: {err}")))?;
        self.relay
            .send(&email)
            .map(|_| ())
            .map_err(|err| SendError::Temporary(format!("SMTP error: {err}")))
    }
}
