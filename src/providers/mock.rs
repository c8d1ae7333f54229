//! Mock transport: does nothing and fails configurably.

use std::{thread, time::Duration};

use rand::Rng;

use crate::{
    config::DriverOptions,
    constants::DEFAULT_MOCK_DURATION,
    error::{NotifygError, SendError},
};

use super::{Provider, Recipient};

/// How the mock is supposed to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailType {
    /// Deliver successfully.
    Success,
    /// Fail with a permanent error before sleeping.
    Permanent,
    /// Fail with a temporary error after sleeping.
    Temporary,
    /// Fail with a temporary error half of the time.
    Random,
}

/// Test transport that sleeps for `duration` seconds and then fails (or
/// not) according to `failtype`.
pub struct MockProvider {
    duration: Duration,
    failtype: FailType,
}

impl MockProvider {
    /// Reads `duration` (default 3 seconds) and `failtype` (default
    /// `success`) from the driver options.
    pub fn new(options: &DriverOptions) -> Result<Self, NotifygError> {
        let duration = options
            .get_u64("duration")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MOCK_DURATION);
        let failtype = match options.get_str("failtype")?.as_deref() {
            None | Some("success") => FailType::Success,
            Some("permanent") => FailType::Permanent,
            Some("temporary") => FailType::Temporary,
            Some("random") => FailType::Random,
            Some(other) => {
                return Err(NotifygError::Config(format!(
                    "failtype must be one out of permanent, temporary, random or success, got '{other}'"
                )));
            }
        };
        Ok(Self { duration, failtype })
    }
}

impl Provider for MockProvider {
    fn send(&self, _recipient: &Recipient<'_>, _message: &str) -> Result<(), SendError> {
        if self.failtype == FailType::Permanent {
            return Err(SendError::Permanent("mocking permanent error".into()));
        }
        thread::sleep(self.duration);
        match self.failtype {
            FailType::Temporary => Err(SendError::Temporary("mocking temporary error".into())),
            FailType::Random if rand::thread_rng().gen_bool(0.5) => {
                Err(SendError::Temporary("mocking random error".into()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Contact;

    fn mock(failtype: &str) -> MockProvider {
        let options = DriverOptions::from_pairs([("failtype", failtype), ("duration", "0")]);
        MockProvider::new(&options).expect("mock should construct")
    }

    #[test]
    fn failtypes_map_to_outcomes() {
        let attrs = Contact::new();
        let recipient = Recipient::new("alice", &attrs);
        assert!(mock("success").send(&recipient, "hi").is_ok());
        assert!(matches!(
            mock("permanent").send(&recipient, "hi"),
            Err(SendError::Permanent(_))
        ));
        assert!(matches!(
            mock("temporary").send(&recipient, "hi"),
            Err(SendError::Temporary(_))
        ));
    }

    #[test]
    fn invalid_failtype_is_a_config_error() {
        let options = DriverOptions::from_pairs([("failtype", "sometimes")]);
        assert!(MockProvider::new(&options).is_err());
    }
}
