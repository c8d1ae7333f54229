//! Shell transport: hands the message to an external command.

use std::{
    io::Write,
    process::{Command, Stdio},
};

use tracing::debug;

use crate::{
    config::DriverOptions,
    error::{NotifygError, SendError},
};

use super::{Provider, Recipient};

/// Sends a message by running a configured command.
///
/// The command string is split on whitespace; each argument may contain
/// the placeholders `{message}` and `{contact:<key>}` (any key from the
/// contact section, plus `{contact:name}`), which are substituted before
/// the command runs. With `message_on_stdin` the message is piped to the
/// command's standard input instead.
pub struct ShellProvider {
    command: Vec<String>,
    message_on_stdin: bool,
}

impl ShellProvider {
    /// Reads `command` (required) and `message_on_stdin` (default false).
    pub fn new(options: &DriverOptions) -> Result<Self, NotifygError> {
        let command: Vec<String> = options
            .require_str("command", "shell")?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if command.is_empty() {
            return Err(NotifygError::Config("shell command must not be empty".into()));
        }
        let message_on_stdin = options.get_bool("message_on_stdin")?.unwrap_or(false);
        Ok(Self {
            command,
            message_on_stdin,
        })
    }

    fn render(&self, part: &str, recipient: &Recipient<'_>, message: &str) -> String {
        let mut rendered = part.replace("{message}", message);
        rendered = rendered.replace("{contact:name}", recipient.name());
        for (key, value) in recipient.attr_pairs() {
            rendered = rendered.replace(&format!("{{contact:{key}}}"), value);
        }
        rendered
    }
}

impl Provider for ShellProvider {
    fn send(&self, recipient: &Recipient<'_>, message: &str) -> Result<(), SendError> {
        let argv: Vec<String> = self
            .command
            .iter()
            .map(|part| self.render(part, recipient, message))
            .collect();
        debug!(command = ?argv, "running shell transport");

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        if self.message_on_stdin {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|err| SendError::Permanent(format!("failed to run shell command: {err}")))?;
        if self.message_on_stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin
                .write_all(message.as_bytes())
                .map_err(|err| SendError::Temporary(format!("failed to write message: {err}")))?;
        }
        let status = child
            .wait()
            .map_err(|err| SendError::Temporary(format!("failed to await shell: {err}")))?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(SendError::Temporary(format!(
                "received nonzero exit code from shell: {code}"
            ))),
            None => Err(SendError::Temporary(
                "shell command terminated by signal".into(),
            )),
        }
    }
}
