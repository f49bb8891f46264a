//! Dispatch keys derived from models.

use crate::models::Model;
use std::borrow::Cow;
use std::fmt;

/// Name of the fallback registration.
pub const DEFAULT_KEY: &str = "default";

/// Opaque, comparable routing key derived from a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchKey(Cow<'static, str>);

impl DispatchKey {
    pub fn new(key: impl Into<Cow<'static, str>>) -> Self {
        Self(key.into())
    }

    /// The key of the default registration; also used for calls without a model.
    pub const fn default_key() -> Self {
        Self(Cow::Borrowed(DEFAULT_KEY))
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DispatchKey {
    fn default() -> Self {
        Self::default_key()
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for DispatchKey {
    fn from(key: &'static str) -> Self {
        Self::new(key)
    }
}

impl From<String> for DispatchKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// Derive the dispatch key for an optional model.
///
/// Key-less calls map onto the default registration.
pub fn key_of(model: Option<&dyn Model>) -> DispatchKey {
    model.map_or_else(DispatchKey::default_key, |m| m.dispatch_key())
}
