//! Ambient inputs the core needs but never sources itself: where a password
//! comes from, and how many workers to run with (§6.4).
//!
//! Everything here is a seam, not a policy. The core (`repository`,
//! `archiver`, `restore`) only ever sees [`PasswordProvider`]; terminal
//! prompting and environment variables are concerns of whatever links the
//! library in, same as object-store credentials stay out of the backend
//! constructors and live in `std::env` reads at their call sites.

use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Supplies the password used to unlock, or newly wrap, a repository's
/// master key.
pub trait PasswordProvider {
    fn password(&self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Reads the password from an environment variable. Fine for scripted,
/// unattended backup jobs; a poor choice for anything a human watches `ps`
/// output on.
pub struct EnvPassword(pub String);

impl EnvPassword {
    pub fn new(var: impl Into<String>) -> Self {
        Self(var.into())
    }
}

impl PasswordProvider for EnvPassword {
    fn password(&self) -> Result<Zeroizing<Vec<u8>>> {
        let value = std::env::var(&self.0)
            .map_err(|_| Error::invalid("password source", format!("{} is not set", self.0)))?;
        Ok(Zeroizing::new(value.into_bytes()))
    }
}

/// Prompts at the terminal with echo disabled.
pub struct TerminalPassword {
    prompt: String,
    confirm: bool,
}

impl TerminalPassword {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            confirm: false,
        }
    }

    /// Asks twice and requires both entries to match; used when wrapping a
    /// brand new master key, where a typo would otherwise lock the user out
    /// silently (§6.5's `init`).
    pub fn with_confirmation(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            confirm: true,
        }
    }
}

impl PasswordProvider for TerminalPassword {
    fn password(&self) -> Result<Zeroizing<Vec<u8>>> {
        let entered = if self.confirm {
            dialoguer::Password::new()
                .with_prompt(&self.prompt)
                .with_confirmation("confirm password", "passwords didn't match")
                .interact()
        } else {
            dialoguer::Password::new().with_prompt(&self.prompt).interact()
        }
        .map_err(|e| Error::invalid("terminal password prompt", e))?;
        Ok(Zeroizing::new(entered.into_bytes()))
    }
}

/// An already-known password, handed in directly. Used by tests and by
/// anything that already has the bytes (e.g. parsed from a wrapper script's
/// own config).
pub struct FixedPassword(Zeroizing<Vec<u8>>);

impl FixedPassword {
    pub fn new(password: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(password.into()))
    }
}

impl PasswordProvider for FixedPassword {
    fn password(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.0.clone())
    }
}

/// Tries each provider in turn and returns the first one that succeeds,
/// e.g. preferring an environment variable over an interactive prompt when
/// both are configured. Fails with the last provider's error if none work.
pub fn first_available(providers: &[&dyn PasswordProvider]) -> Result<Zeroizing<Vec<u8>>> {
    let mut last_err = None;
    for provider in providers {
        match provider.password() {
            Ok(password) => return Ok(password),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::invalid("password source", "no provider configured")))
}

/// Runtime knobs that sit outside a repository's persistent
/// [`Config`](crate::config::Config): how many worker threads the archiver
/// and restore pipelines use. Populated from `~/.config/cryptopak.toml`'s
/// `parallelism` by default, with room for a CLI flag to override it.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    pub parallelism: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get().max(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_password_round_trips() {
        let p = FixedPassword::new(b"hunter2".to_vec());
        assert_eq!(&*p.password().unwrap(), b"hunter2");
    }

    #[test]
    fn env_password_reports_missing_var() {
        let p = EnvPassword::new("CRYPTOPAK_TEST_DOES_NOT_EXIST");
        assert!(matches!(p.password().unwrap_err(), Error::Invalid { .. }));
    }

    #[test]
    fn first_available_skips_failing_providers() {
        let missing = EnvPassword::new("CRYPTOPAK_TEST_DOES_NOT_EXIST");
        let fixed = FixedPassword::new(b"fallback".to_vec());
        let password = first_available(&[&missing, &fixed]).unwrap();
        assert_eq!(&*password, b"fallback");
    }
}
