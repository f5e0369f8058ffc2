//! Key layout for the shared store.
//!
//! Three prefixed namespaces index the fan-out routing state (the prefix is
//! configurable, `pubsub` by default):
//!
//! - `{prefix}:conn:{connectionId}`: set of the connection's subscription keys
//! - `{prefix}:sub:{subscriptionId}`: set of topic keys the subscription references
//! - `{prefix}:topic:{name}`: set of channel tuples subscribed to the topic
//!
//! Two fixed keys carry per-connection protocol records:
//!
//! - `graphql:connection:{connectionId}`: flattened context hash
//! - `graphql:subscription:{subscriptionId}`: verbatim subscribe payload

/// Prefix of the per-connection context hash key.
pub const CONTEXT_KEY_PREFIX: &str = "graphql:connection:";

/// Prefix of the per-subscription payload record key.
pub const SUBSCRIPTION_RECORD_KEY_PREFIX: &str = "graphql:subscription:";

/// Separator joining the two halves of a channel tuple.
pub const CHANNEL_SEPARATOR: char = '#';

const CONNECTION_NAMESPACE: &str = "conn";
const SUBSCRIPTION_NAMESPACE: &str = "sub";
const TOPIC_NAMESPACE: &str = "topic";

/// Builds and parses the namespaced keys of the fan-out index.
#[derive(Clone, Debug)]
pub struct KeySpace {
    prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("pubsub")
    }
}

impl KeySpace {
    /// Creates a key space rooted at the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The key of a connection's owned-subscription set.
    pub fn connection(&self, connection_id: &str) -> String {
        format!("{}:{CONNECTION_NAMESPACE}:{connection_id}", self.prefix)
    }

    /// The key of a subscription's topic set.
    pub fn subscription(&self, subscription_id: &str) -> String {
        format!("{}:{SUBSCRIPTION_NAMESPACE}:{subscription_id}", self.prefix)
    }

    /// The key of a topic's subscriber set.
    pub fn topic(&self, name: &str) -> String {
        format!("{}:{TOPIC_NAMESPACE}:{name}", self.prefix)
    }

    /// The key of a connection's context hash.
    pub fn context(&self, connection_id: &str) -> String {
        format!("{CONTEXT_KEY_PREFIX}{connection_id}")
    }

    /// The key of a subscription's stored subscribe payload.
    pub fn subscription_record(&self, subscription_id: &str) -> String {
        format!("{SUBSCRIPTION_RECORD_KEY_PREFIX}{subscription_id}")
    }

    /// Encodes the delivery address recorded on a topic's subscriber set: the
    /// full connection and subscription keys joined by `#`.
    pub fn channel(&self, connection_id: &str, subscription_id: &str) -> String {
        format!(
            "{}{CHANNEL_SEPARATOR}{}",
            self.connection(connection_id),
            self.subscription(subscription_id),
        )
    }

    /// Recovers `(connectionId, subscriptionId)` from a channel tuple.
    ///
    /// Both halves are resolved by taking the final `:`-separated segment, so
    /// the parse tolerates any prefix the tuple was written under. Returns
    /// [`None`] for members that do not have two non-empty halves.
    pub fn parse_channel(&self, tuple: &str) -> Option<(String, String)> {
        let (conn_half, sub_half) = tuple.split_once(CHANNEL_SEPARATOR)?;
        let connection_id = final_segment(conn_half)?;
        let subscription_id = final_segment(sub_half)?;
        Some((connection_id.into(), subscription_id.into()))
    }

    /// Strips the topic namespace from a stored topic key.
    pub fn topic_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:{TOPIC_NAMESPACE}:", self.prefix))
    }

    /// Strips the subscription namespace from a stored subscription key.
    pub fn subscription_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:{SUBSCRIPTION_NAMESPACE}:", self.prefix))
    }
}

fn final_segment(half: &str) -> Option<&str> {
    let segment = half.rsplit(':').next()?;
    (!segment.is_empty()).then_some(segment)
}
