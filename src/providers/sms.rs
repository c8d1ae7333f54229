//! SMS transports: truncation contract plus a generic HTTP gateway
//! driver.

use std::{fmt::Write, time::Duration};

use tracing::debug;

use crate::{
    config::DriverOptions,
    constants::DEFAULT_MAX_SMS_LENGTH,
    error::{NotifygError, SendError},
};

use super::{Provider, Recipient};

/// Shared behavior of SMS drivers: the contact needs a `phone` attribute
/// (`+` country code form) and the message is truncated to
/// `maxsmslength` bytes (default 160) before it reaches the gateway.
pub(crate) struct SmsOptions {
    max_length: usize,
}

impl SmsOptions {
    pub(crate) fn new(options: &DriverOptions) -> Result<Self, NotifygError> {
        let max_length = options
            .get_u64("maxsmslength")?
            .unwrap_or(DEFAULT_MAX_SMS_LENGTH as u64) as usize;
        Ok(Self { max_length })
    }

    /// Cuts the message to exactly its first `maxsmslength` bytes. The
    /// cut is a raw byte slice: a trailing multi-byte character may be
    /// split, which is why the gateway treats the message as opaque
    /// bytes from here on.
    pub(crate) fn truncate<'a>(&self, message: &'a str) -> &'a [u8] {
        let bytes = message.as_bytes();
        &bytes[..bytes.len().min(self.max_length)]
    }

    /// Extracts and checks the phone number of a recipient.
    pub(crate) fn phone<'a>(&self, recipient: &'a Recipient<'_>) -> Result<&'a str, SendError> {
        let phone = recipient.require("phone")?;
        if !phone.starts_with('+') {
            return Err(SendError::Config(format!(
                "phone number of contact {} must start with a plus sign",
                recipient.name()
            )));
        }
        Ok(phone)
    }
}

/// Percent-encodes raw bytes into a form-urlencoded buffer. The stock
/// form encoders only accept strings, but a truncated SMS payload may
/// not be valid UTF-8.
fn urlencode_into(out: &mut String, bytes: &[u8]) {
    for &byte in bytes {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b' ' => out.push('+'),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
}

/// Builds an `application/x-www-form-urlencoded` body from byte-valued
/// fields.
fn form_encode(pairs: &[(&str, &[u8])]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        urlencode_into(&mut out, key.as_bytes());
        out.push('=');
        urlencode_into(&mut out, value);
    }
    out
}

/// Sends the message through an HTTP SMS gateway.
///
/// Options: `url` (required gateway endpoint), `key` (required API key),
/// `sender` (optional originator), `route` (basic/gold/direct, default
/// basic), `maxsmslength`. The gateway is called with a form-encoded
/// POST; 2xx counts as delivered, 4xx as permanently rejected and
/// everything else as a temporary failure.
pub struct HttpSmsProvider {
    url: String,
    key: String,
    sender: Option<String>,
    route: String,
    sms: SmsOptions,
    client: reqwest::blocking::Client,
}

impl HttpSmsProvider {
    /// Builds the gateway driver from options.
    pub fn new(options: &DriverOptions) -> Result<Self, NotifygError> {
        let url = options.require_str("url", "httpsms")?;
        let key = options.require_str("key", "httpsms")?;
        let sender = options.get_str("sender")?;
        let route = options
            .get_str("route")?
            .unwrap_or_else(|| "basic".to_string());
        if !matches!(route.as_str(), "basic" | "gold" | "direct") {
            return Err(NotifygError::Config(format!(
                "invalid value '{route}' for route"
            )));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| NotifygError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            url,
            key,
            sender,
            route,
            sms: SmsOptions::new(options)?,
            client,
        })
    }

    /// Pulls a human-readable failure detail out of a gateway response
    /// body, accepting either `{"error": "..."}` JSON or plain text.
    fn failure_detail(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
            && let Some(error) = value.get("error").and_then(|v| v.as_str())
        {
            return error.to_string();
        }
        body.trim().chars().take(200).collect()
    }
}

impl Provider for HttpSmsProvider {
    fn send(&self, recipient: &Recipient<'_>, message: &str) -> Result<(), SendError> {
        let phone = self.sms.phone(recipient)?;
        let message = self.sms.truncate(message);
        debug!(phone, len = message.len(), "sending sms via http gateway");

        let mut form: Vec<(&str, &[u8])> = vec![
            ("key", self.key.as_bytes()),
            ("to", phone[1..].as_bytes()),
            ("message", message),
            ("route", self.route.as_bytes()),
        ];
        if let Some(sender) = &self.sender {
            form.push(("from", sender.as_bytes()));
        }

        let response = self
            .client
            .post(&self.url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(form_encode(&form))
            .send()
            .map_err(|err| SendError::Temporary(format!("http error: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = Self::failure_detail(&response.text().unwrap_or_default());
        if status.is_client_error() {
            Err(SendError::Permanent(format!(
                "gateway rejected sms with status {status}: {detail}"
            )))
        } else {
            Err(SendError::Temporary(format!(
                "gateway failed with status {status}: {detail}"
            )))
        }
    }
}
