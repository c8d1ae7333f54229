//! Retry policy: the per-deployment script that escalates entries across
//! transports.
//!
//! A policy is an ordered list of tokens, each either a number of seconds
//! to wait or the name of a provider to try next. An entry carries a step
//! index into this list; running off the end (or hitting an explicit
//! `GIVEUP` token) drops the entry.

use crate::constants::GIVEUP_TOKEN;
use crate::error::NotifygError;

/// One token of the retry script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryToken {
    /// Wait this many seconds before acting on the entry again.
    Wait(u64),
    /// Dispatch the entry to this provider.
    Provider(String),
    /// Drop the entry without further attempts.
    GiveUp,
}

const IMPLICIT_GIVEUP: RetryToken = RetryToken::GiveUp;

/// Immutable, validated retry script.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    tokens: Vec<RetryToken>,
}

impl RetryPolicy {
    /// Parses raw configuration tokens. A token of pure ASCII digits is a
    /// wait, the literal `GIVEUP` terminates the script, anything else
    /// names a provider. Provider existence is checked later against the
    /// registry.
    pub fn parse(raw: &[String]) -> Result<Self, NotifygError> {
        if raw.is_empty() {
            return Err(NotifygError::Config(
                "retry policy must contain at least one token".into(),
            ));
        }
        let mut tokens = Vec::with_capacity(raw.len());
        for token in raw {
            let token = token.trim();
            if token.is_empty() {
                return Err(NotifygError::Config("empty retry token".into()));
            }
            if token.chars().all(|c| c.is_ascii_digit()) {
                let seconds = token.parse::<u64>().map_err(|err| {
                    NotifygError::Config(format!("invalid wait token '{token}': {err}"))
                })?;
                tokens.push(RetryToken::Wait(seconds));
            } else if token == GIVEUP_TOKEN {
                tokens.push(RetryToken::GiveUp);
            } else {
                tokens.push(RetryToken::Provider(token.to_string()));
            }
        }
        Ok(Self { tokens })
    }

    /// Resolves a step index to its token. Indices beyond the end of the
    /// script resolve to the implicit `GIVEUP` terminator.
    pub fn token_at(&self, step: u32) -> &RetryToken {
        self.tokens.get(step as usize).unwrap_or(&IMPLICIT_GIVEUP)
    }

    /// Iterates over the provider names used anywhere in the script.
    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().filter_map(|token| match token {
            RetryToken::Provider(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Number of tokens in the script.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the script is empty. Parsing rejects empty scripts, so this
    /// only holds for hand-built policies.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn parses_mixed_tokens() {
        let policy = RetryPolicy::parse(&raw(&["jabber", "60", "sms", "GIVEUP"]))
            .expect("policy should parse");
        assert_eq!(
            policy.token_at(0),
            &RetryToken::Provider("jabber".to_string())
        );
        assert_eq!(policy.token_at(1), &RetryToken::Wait(60));
        assert_eq!(policy.token_at(3), &RetryToken::GiveUp);
    }

    #[test]
    fn out_of_range_step_is_implicit_giveup() {
        let policy = RetryPolicy::parse(&raw(&["mock1"])).expect("policy should parse");
        assert_eq!(policy.token_at(1), &RetryToken::GiveUp);
        assert_eq!(policy.token_at(u32::MAX), &RetryToken::GiveUp);
    }

    #[test]
    fn rejects_empty_policy() {
        assert!(RetryPolicy::parse(&[]).is_err());
        assert!(RetryPolicy::parse(&raw(&[" "])).is_err());
    }

    #[test]
    fn collects_provider_names() {
        let policy = RetryPolicy::parse(&raw(&["a", "10", "b", "GIVEUP"]))
            .expect("policy should parse");
        let names: Vec<&str> = policy.provider_names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn zero_wait_is_valid() {
        let policy = RetryPolicy::parse(&raw(&["0", "mock1"])).expect("policy should parse");
        assert_eq!(policy.token_at(0), &RetryToken::Wait(0));
    }
}
