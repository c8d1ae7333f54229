//! Transport drivers and the provider registry.
//!
//! Every transport implements the same two-method contract: `send` either
//! delivers or fails with one of the [`SendError`] categories, and
//! `terminate` releases long-lived resources at shutdown. Retrying is the
//! queue's job; a transport never retries internally.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    config::{Config, Contact, DriverOptions},
    error::{NotifygError, SendError},
    retry::RetryPolicy,
};

pub mod jabber;
pub mod mail;
pub mod mock;
pub mod shell;
pub mod sms;

/// Delivery view over one contact: the contact name plus its attribute
/// bag from the configuration.
pub struct Recipient<'a> {
    name: &'a str,
    attrs: &'a Contact,
}

impl<'a> Recipient<'a> {
    /// Builds a recipient from a contact entry.
    pub fn new(name: &'a str, attrs: &'a Contact) -> Self {
        Self { name, attrs }
    }

    /// The contact name the notification was enqueued for.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Looks up a contact attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Looks up a contact attribute that the transport cannot work
    /// without.
    pub fn require(&self, key: &str) -> Result<&str, SendError> {
        self.get(key)
            .ok_or_else(|| SendError::Config(format!("missing {key} on contact {}", self.name)))
    }

    /// Iterates over all contact attributes.
    pub fn attr_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Common contract of every transport.
pub trait Provider: Send {
    /// Delivers `message` to `recipient`, or classifies the failure.
    fn send(&self, recipient: &Recipient<'_>, message: &str) -> Result<(), SendError>;

    /// Called once during shutdown to release resources. Transports
    /// without long-lived state keep the default no-op.
    fn terminate(&mut self) {}
}

/// Constructs a driver instance by its id.
fn build_driver(
    driver: &str,
    options: &DriverOptions,
) -> Result<Box<dyn Provider>, NotifygError> {
    match driver {
        "mock" => Ok(Box::new(mock::MockProvider::new(options)?)),
        "shell" => Ok(Box::new(shell::ShellProvider::new(options)?)),
        "mail" => Ok(Box::new(mail::MailProvider::new(options)?)),
        "httpsms" => Ok(Box::new(sms::HttpSmsProvider::new(options)?)),
        "jabber" => Ok(Box::new(jabber::JabberProvider::new(options)?)),
        other => Err(NotifygError::Config(format!("unknown driver '{other}'"))),
    }
}

/// Name-to-transport mapping with best-effort startup.
///
/// A provider whose driver fails to construct is dropped and the failure
/// reason recorded; the remaining providers stay usable. A retry policy
/// that references a dropped provider is rejected with that reason.
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn Provider>>,
    skipped: HashMap<String, String>,
}

impl ProviderRegistry {
    /// Builds every configured provider, recording failures instead of
    /// aborting.
    pub fn build(config: &Config) -> Self {
        let mut providers: HashMap<String, Box<dyn Provider>> = HashMap::new();
        let mut skipped = HashMap::new();
        for (name, provider_config) in &config.providers {
            match build_driver(&provider_config.driver, &provider_config.options) {
                Ok(provider) => {
                    debug!(provider = %name, driver = %provider_config.driver,
                        "registered provider");
                    providers.insert(name.clone(), provider);
                }
                Err(err) => {
                    warn!(provider = %name, error = %err, "skipping unusable provider");
                    skipped.insert(name.clone(), err.to_string());
                }
            }
        }
        Self { providers, skipped }
    }

    /// Creates an empty registry; callers insert providers directly.
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
            skipped: HashMap::new(),
        }
    }

    /// Inserts a provider under a name, replacing any previous one.
    pub fn insert(&mut self, name: &str, provider: Box<dyn Provider>) {
        self.providers.insert(name.to_string(), provider);
    }

    /// Looks up a registered provider.
    pub fn get(&self, name: &str) -> Option<&dyn Provider> {
        self.providers.get(name).map(Box::as_ref)
    }

    /// Why a provider was dropped at startup, if it was.
    pub fn skip_reason(&self, name: &str) -> Option<&str> {
        self.skipped.get(name).map(String::as_str)
    }

    /// Verifies that every provider token of the retry policy resolves to
    /// a usable provider, failing fast with the recorded skip reason.
    pub fn validate_retry(&self, policy: &RetryPolicy) -> Result<(), NotifygError> {
        for name in policy.provider_names() {
            if self.providers.contains_key(name) {
                continue;
            }
            let reason = self
                .skipped
                .get(name)
                .cloned()
                .unwrap_or_else(|| "provider not configured".to_string());
            return Err(NotifygError::RetryProvider {
                provider: name.to_string(),
                reason,
            });
        }
        Ok(())
    }

    /// Terminates every provider; called once at shutdown.
    pub fn terminate_all(&mut self) {
        for (name, provider) in self.providers.iter_mut() {
            debug!(provider = %name, "terminating provider");
            provider.terminate();
        }
    }
}
