//! Caller policy: privileged-user and allow-list regexes.
//!
//! Compiles the pattern lists from [`PolicyConfig`] once at construction
//! and answers two questions during authorization:
//!
//! | Question | List | Matched against |
//! |----------|------|-----------------|
//! | may this certificate act as anyone? | `privileged_users` | names embedded in the certificate |
//! | may this caller be accepted at all? | `allow_list` | the caller name being authorized |
//!
//! Patterns are unanchored regexes; an empty list matches nothing.

use regex::Regex;

use crate::config::PolicyConfig;
use crate::{Error, Result};

/// Compiled caller policy.
#[derive(Debug, Clone)]
pub struct CallerPolicy {
    allow_list: Vec<Regex>,
    privileged_users: Vec<Regex>,
}

impl CallerPolicy {
    /// Compile the policy from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationInvalid`] naming the first pattern that
    /// does not compile.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            allow_list: compile("allow_list", &config.allow_list)?,
            privileged_users: compile("privileged_users", &config.privileged_users)?,
        })
    }

    /// Whether any of `names` matches a privileged-user pattern.
    pub fn is_privileged<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> bool {
        names
            .into_iter()
            .any(|name| self.privileged_users.iter().any(|re| re.is_match(name)))
    }

    /// Whether `name` matches an allow-list pattern.
    #[must_use]
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allow_list.iter().any(|re| re.is_match(name))
    }
}

fn compile(list: &str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| Error::config(format!("invalid {list} pattern '{p}': {e}")))
        })
        .collect()
}
