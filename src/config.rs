//! Configuration management for notifyg.
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::error::NotifygError;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Daemon-wide settings.
    pub general: GeneralConfig,
    /// Map of contact names to their attribute bags.
    #[serde(default)]
    pub contacts: HashMap<String, Contact>,
    /// Map of provider names to their driver configurations.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// A contact is a free-form bag of string attributes. Which keys are
/// meaningful depends on the transports (`phone`, `jabber`, `email`, ...);
/// the delivery core only reads keys by name.
pub type Contact = HashMap<String, String>;

/// Daemon-wide settings from the `general` section.
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Directory holding the persistent queue.
    pub queuedir: PathBuf,
    /// Retry script tokens in order (wait seconds, provider names, GIVEUP).
    pub retry: Vec<String>,
    /// Which directory watcher implementation the loop blocks in.
    #[serde(default)]
    pub notify: NotifyKind,
    /// Optional cap (seconds) on a single watcher wait.
    pub maxwait: Option<u64>,
}

/// Selects the directory watcher implementation.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    /// Block on filesystem move-in events (plus the wakeup signal).
    #[default]
    Inotify,
    /// Plain signal-interruptible sleep fallback.
    Signal,
}

/// Configuration of a single provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Transport driver id (`mock`, `shell`, `mail`, `httpsms`, `jabber`).
    pub driver: String,
    /// Driver-specific options.
    #[serde(flatten)]
    pub options: DriverOptions,
}

/// Driver-specific option bag with typed accessors.
///
/// Drivers read their options by name; unknown keys are ignored so that
/// configurations stay forward-compatible.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DriverOptions(HashMap<String, serde_yaml::Value>);

impl DriverOptions {
    /// Builds an option bag from string pairs.
    pub fn from_pairs<const N: usize>(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_yaml::Value::String(v.to_string())))
                .collect(),
        )
    }

    /// Looks up an optional string option. Scalar numbers and booleans are
    /// stringified so YAML authors do not have to quote them.
    pub fn get_str(&self, key: &str) -> Result<Option<String>, NotifygError> {
        match self.0.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(serde_yaml::Value::String(s)) => Ok(Some(s.clone())),
            Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
            Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(other) => Err(NotifygError::Config(format!(
                "option '{key}' must be a scalar, got {other:?}"
            ))),
        }
    }

    /// Looks up a required string option.
    pub fn require_str(&self, key: &str, driver: &str) -> Result<String, NotifygError> {
        self.get_str(key)?.ok_or_else(|| {
            NotifygError::Config(format!("{driver} driver requires option '{key}'"))
        })
    }

    /// Looks up an optional unsigned integer option.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, NotifygError> {
        match self.0.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(serde_yaml::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                NotifygError::Config(format!("option '{key}' must be a non-negative integer"))
            }),
            Some(serde_yaml::Value::String(s)) => {
                s.trim().parse::<u64>().map(Some).map_err(|err| {
                    NotifygError::Config(format!("option '{key}' is not an integer: {err}"))
                })
            }
            Some(other) => Err(NotifygError::Config(format!(
                "option '{key}' must be an integer, got {other:?}"
            ))),
        }
    }

    /// Looks up an optional boolean option. Accepts YAML booleans as well
    /// as the strings no/false/0 and yes/true/1.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, NotifygError> {
        match self.0.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(serde_yaml::Value::Bool(b)) => Ok(Some(*b)),
            Some(serde_yaml::Value::String(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "no" | "false" | "0" => Ok(Some(false)),
                    "yes" | "true" | "1" => Ok(Some(true)),
                    other => Err(NotifygError::Config(format!(
                        "option '{key}' is not a boolean: '{other}'"
                    ))),
                }
            }
            Some(other) => Err(NotifygError::Config(format!(
                "option '{key}' must be a boolean, got {other:?}"
            ))),
        }
    }
}

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> Result<Config, NotifygError> {
    let raw = fs::read_to_string(path).map_err(|source| NotifygError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_yaml::from_str(&raw)?;
    validate(&config)?;
    Ok(config)
}

/// Validates semantic constraints the serde model cannot express.
pub fn validate(config: &Config) -> Result<(), NotifygError> {
    if config.general.queuedir.as_os_str().is_empty() {
        return Err(NotifygError::Config("queuedir must not be empty".into()));
    }
    if config.general.retry.is_empty() {
        return Err(NotifygError::Config(
            "retry policy must contain at least one token".into(),
        ));
    }

    for (name, contact) in &config.contacts {
        validate_contact(contact)
            .map_err(|err| NotifygError::Config(format!("{err} in contact {name}")))?;
    }

    // Provider tokens must name a configured provider; whether that
    // provider actually starts is decided by the registry.
    for token in &config.general.retry {
        let token = token.trim();
        if token.chars().all(|c| c.is_ascii_digit()) || token == crate::constants::GIVEUP_TOKEN
        {
            continue;
        }
        if !config.providers.contains_key(token) {
            return Err(NotifygError::Config(format!("provider {token} not found")));
        }
    }
    Ok(())
}

/// Basic sanity checks on the well-known contact attributes.
fn validate_contact(contact: &Contact) -> Result<(), String> {
    if let Some(phone) = contact.get("phone") {
        let Some(digits) = phone.strip_prefix('+') else {
            return Err("phone number must start with a plus sign".into());
        };
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err("non-digits found in phone number".into());
        }
    }
    if let Some(jabber) = contact.get("jabber")
        && !jabber.contains('@')
    {
        return Err("a jabber id has to contain an @ sign".into());
    }
    if let Some(email) = contact.get("email")
        && !email.contains('@')
    {
        return Err("an email address has to contain an @ sign".into());
    }
    Ok(())
}
