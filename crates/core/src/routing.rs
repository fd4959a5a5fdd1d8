//! Routing key parsing
//!
//! Device state events are published with routing keys of the form
//! `{user_id}.$cloud.device.{device_id}.channel.{channel_id}.event.state`.
//! The identity encoded in the key decides where the payload is cached.
//!
//! The separators in the pattern are unescaped `.`, so any single character
//! is accepted where a dot is expected.

use std::fmt;

use regex::Regex;

/// Binding key used when subscribing to state events on a topic exchange.
pub const STATE_BINDING_KEY: &str = "*.$cloud.device.*.channel.*.event.state";

/// Pattern matched against every routing key.
///
/// `device_id` uses ASCII word characters; `user_id` and `channel_id`
/// additionally allow `-`.
const ROUTING_KEY_PATTERN: &str = concat!(
    r"^(?P<user_id>[a-zA-Z0-9\-_]+)",
    r".\$cloud",
    r".device.(?P<device_id>(?-u:\w)+)",
    r".channel.(?P<channel_id>[a-zA-Z0-9\-_]+)",
    r".event.state$",
);

/// Identity extracted from a routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
    pub channel_id: String,
}

impl Identity {
    /// Derive the key the identity's last known state is stored under.
    pub fn storage_key(&self) -> StorageKey {
        StorageKey(format!(
            "state:{}:{}:{}",
            self.user_id, self.device_id, self.channel_id
        ))
    }
}

/// Key-value store key for an [`Identity`]: `state:{user_id}:{device_id}:{channel_id}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compiled routing key matcher
///
/// Compiled once and shared; cloning is cheap and the matcher is safe to use
/// from any number of workers concurrently.
#[derive(Debug, Clone)]
pub struct RoutingKeyParser {
    pattern: Regex,
}

impl RoutingKeyParser {
    /// Compile the routing key pattern
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(ROUTING_KEY_PATTERN)?,
        })
    }

    /// Extract the identity from a routing key.
    ///
    /// Returns `None` unless the whole key matches; there is no partial
    /// extraction.
    pub fn parse(&self, routing_key: &str) -> Option<Identity> {
        let captures = self.pattern.captures(routing_key)?;

        Some(Identity {
            user_id: captures.name("user_id")?.as_str().to_string(),
            device_id: captures.name("device_id")?.as_str().to_string(),
            channel_id: captures.name("channel_id")?.as_str().to_string(),
        })
    }
}
