//! Dotted resource/job identifier helpers.
//!
//! `NameGen` is an optional chain-builder for dotted names; it is never
//! required — any `Into<String>` works as a resource or base identifier.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

/// A chainable dotted-name builder: `NameGen::new("reporting").join("events").join("x")`
/// renders as `"reporting.events.x"`.
#[derive(Debug, Clone, Default)]
pub struct NameGen {
    name: String,
}

impl NameGen {
    pub fn new(start: impl Into<String>) -> Self {
        NameGen {
            name: start.into().trim_matches('.').to_string(),
        }
    }

    /// Appends a component, returning a new builder.
    #[must_use]
    pub fn join(&self, component: impl fmt::Display) -> Self {
        if self.name.is_empty() {
            NameGen {
                name: component.to_string(),
            }
        } else {
            NameGen {
                name: format!("{}.{}", self.name, component),
            }
        }
    }
}

impl fmt::Display for NameGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<NameGen> for String {
    fn from(ng: NameGen) -> Self {
        ng.name
    }
}

/// Generates a 48-bit cryptographically random decimal identifier component.
///
/// Do not reduce the width and do not switch to a non-cryptographic source:
/// two processes that reuse a base identifier (e.g. the same module path)
/// must not collide on the lock-holder identity.
pub fn random_component() -> u64 {
    let mut buf = [0u8; 6];
    OsRng.fill_bytes(&mut buf);
    let mut v: u64 = 0;
    for b in buf {
        v = (v << 8) | u64::from(b);
    }
    v
}

/// Builds the effective job identifier `<base>.<random>[.<suffix>]`.
pub fn build_identifier(base: &str, random: u64, suffix: Option<&str>) -> String {
    let base = base.trim_matches('.');
    let mut id = format!("{base}.{random}");
    if let Some(suffix) = suffix {
        let suffix = suffix.trim_matches('.');
        if !suffix.is_empty() {
            id.push('.');
            id.push_str(suffix);
        }
    }
    id
}
