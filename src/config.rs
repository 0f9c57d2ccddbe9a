//! Runtime switches, read from the environment.

use std::env;

use tracing::warn;

/// Disables debugger registration altogether when set.
pub const SKIP_ENV: &str = "SKIP_JIT";
/// Forces list verification on (`1`, `true`, `on`) or off (`0`, `false`, `off`).
pub const VERIFY_ENV: &str = "JITREG_VERIFY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub enabled: bool,
    pub verify: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            verify: cfg!(debug_assertions),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if lookup(SKIP_ENV).is_some() {
            config.enabled = false;
        }
        if let Some(value) = lookup(VERIFY_ENV) {
            match parse_switch(&value) {
                Some(verify) => config.verify = verify,
                None => warn!("ignoring {VERIFY_ENV}={value:?}, expected a boolean"),
            }
        }
        config
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
