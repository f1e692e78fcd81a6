//! Interactive prompting for profile fields and passphrases

use age::secrecy::{ExposeSecret, Secret, SecretString};
use std::io::{self, BufRead, IsTerminal, Write};

use crate::error::{Error, Result};

/// Environment variable that supplies the passphrase non-interactively
pub const PASSPHRASE_ENV_VAR: &str = "SCUM_PASSPHRASE";

/// Source of user input
pub trait Prompter {
    /// Ask for a single profile field; `secret` input is not echoed
    fn field(&mut self, label: &str, secret: bool) -> Result<String>;

    /// Ask for the passphrase unlocking `key`
    fn passphrase(&mut self, key: &str) -> Result<SecretString>;

    /// Ask for a new passphrase, with confirmation
    fn new_passphrase(&mut self, key: &str) -> Result<SecretString>;
}

/// Prompter reading from the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }
}

impl Prompter for TerminalPrompter {
    fn field(&mut self, label: &str, secret: bool) -> Result<String> {
        if secret {
            return rpassword::prompt_password(format!("{}: ", label))
                .map(|value| value.trim().to_string())
                .map_err(|e| Error::Prompt(format!("failed to read {}: {}", label, e)));
        }

        eprint!("{}: ", label);
        io::stderr().flush().map_err(|e| Error::Prompt(e.to_string()))?;

        let mut line = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| Error::Prompt(format!("failed to read {}: {}", label, e)))?;
        if read == 0 {
            return Err(Error::Prompt(format!("no input for {}", label)));
        }

        Ok(line.trim().to_string())
    }

    fn passphrase(&mut self, key: &str) -> Result<SecretString> {
        if let Some(passphrase) = passphrase_from_env() {
            return Ok(passphrase);
        }

        if !io::stdin().is_terminal() {
            return Err(Error::Prompt(format!(
                "no passphrase provided. Set {} or run interactively.",
                PASSPHRASE_ENV_VAR
            )));
        }

        let passphrase = rpassword::prompt_password(format!("Enter passphrase for '{}': ", key))
            .map_err(|e| Error::Prompt(format!("failed to read passphrase: {}", e)))?;
        non_empty(passphrase)
    }

    fn new_passphrase(&mut self, key: &str) -> Result<SecretString> {
        if let Some(passphrase) = passphrase_from_env() {
            return Ok(passphrase);
        }

        let first = rpassword::prompt_password(format!("New passphrase for '{}': ", key))
            .map_err(|e| Error::Prompt(format!("failed to read passphrase: {}", e)))?;
        let second = rpassword::prompt_password("Confirm passphrase: ")
            .map_err(|e| Error::Prompt(format!("failed to read passphrase: {}", e)))?;

        if first != second {
            return Err(Error::Prompt("passphrases do not match".to_string()));
        }
        non_empty(first)
    }
}

fn passphrase_from_env() -> Option<SecretString> {
    std::env::var(PASSPHRASE_ENV_VAR)
        .ok()
        .filter(|value| !value.is_empty())
        .map(Secret::new)
}

fn non_empty(passphrase: String) -> Result<SecretString> {
    let passphrase = Secret::new(passphrase);
    if passphrase.expose_secret().is_empty() {
        return Err(Error::Prompt("empty passphrase not allowed".to_string()));
    }
    Ok(passphrase)
}

/// Prompter replaying canned answers, for tests
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub(crate) struct ScriptedPrompter {
        fields: VecDeque<String>,
        passphrase: Option<String>,
        pub(crate) asked_fields: Vec<String>,
        pub(crate) passphrase_requests: usize,
    }

    impl ScriptedPrompter {
        pub(crate) fn new(fields: &[&str], passphrase: &str) -> Self {
            Self {
                fields: fields.iter().map(|f| f.to_string()).collect(),
                passphrase: Some(passphrase.to_string()),
                ..Default::default()
            }
        }

        pub(crate) fn push_fields(&mut self, fields: &[&str]) {
            self.fields.extend(fields.iter().map(|f| f.to_string()));
        }
    }

    impl Prompter for ScriptedPrompter {
        fn field(&mut self, label: &str, _secret: bool) -> Result<String> {
            self.asked_fields.push(label.to_string());
            self.fields
                .pop_front()
                .ok_or_else(|| Error::Prompt(format!("no scripted answer for {}", label)))
        }

        fn passphrase(&mut self, _key: &str) -> Result<SecretString> {
            self.passphrase_requests += 1;
            self.passphrase
                .clone()
                .map(Secret::new)
                .ok_or_else(|| Error::Prompt("no scripted passphrase".to_string()))
        }

        fn new_passphrase(&mut self, key: &str) -> Result<SecretString> {
            self.passphrase(key)
        }
    }
}
