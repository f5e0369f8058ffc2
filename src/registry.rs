//! The connection/subscription registry.
//!
//! A many-to-many mapping between topics, subscriptions, and connections,
//! kept in three store namespaces:
//!
//! - the connection's owned-subscription set,
//! - the subscription's topic set,
//! - the topic's subscriber set of channel tuples.
//!
//! Every multi-key mutation runs as one atomic store operation, so two
//! concurrent invocations (say, a Complete racing a DISCONNECT) each observe
//! a consistent state and tolerate "already removed".

use std::sync::Arc;

use crate::{
    keys::KeySpace,
    store::{Store, StoreError},
};

/// The triple index tying topics to the `(connection, subscription)` tuples
/// that receive their publishes.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl Registry {
    /// Creates a registry over the shared store.
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// The key space this registry indexes under.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Records a subscription under every listed topic. Atomic and
    /// idempotent: registering the same triple twice yields exactly one
    /// tuple per topic.
    pub async fn register(
        &self,
        connection_id: &str,
        subscription_id: &str,
        topics: &[String],
    ) -> Result<(), StoreError> {
        let topic_keys: Vec<String> = topics.iter().map(|t| self.keys.topic(t)).collect();
        self.store
            .link_subscription(
                &self.keys.connection(connection_id),
                &self.keys.subscription(subscription_id),
                &topic_keys,
                &self.keys.channel(connection_id, subscription_id),
            )
            .await
    }

    /// Removes one subscription from every topic it references, from its
    /// owning connection's set, and deletes its topic set. Atomic.
    pub async fn unregister(
        &self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Result<(), StoreError> {
        self.store
            .unlink_subscription(
                &self.keys.connection(connection_id),
                &self.keys.subscription(subscription_id),
                &self.keys.channel(connection_id, subscription_id),
            )
            .await
    }

    /// Removes every subscription the connection owns and the connection's
    /// own set. Atomic.
    pub async fn disconnect(&self, connection_id: &str) -> Result<(), StoreError> {
        self.store
            .purge_connection(&self.keys.connection(connection_id))
            .await
    }

    /// The `(connectionId, subscriptionId)` tuples currently subscribed to a
    /// topic. Reads without a lock; callers tolerate concurrent mutation.
    /// Malformed members are dropped silently.
    pub async fn get_channels(&self, topic: &str) -> Result<Vec<(String, String)>, StoreError> {
        let members = self.store.set_members(&self.keys.topic(topic)).await?;
        Ok(members
            .iter()
            .filter_map(|member| self.keys.parse_channel(member))
            .collect())
    }

    /// The topics a subscription is registered under.
    pub async fn get_registered_topics(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let members = self
            .store
            .set_members(&self.keys.subscription(subscription_id))
            .await?;
        Ok(members
            .iter()
            .filter_map(|key| self.keys.topic_name(key).map(str::to_string))
            .collect())
    }

    /// The subscription ids a connection owns.
    pub async fn get_connection_subscriptions(
        &self,
        connection_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let members = self
            .store
            .set_members(&self.keys.connection(connection_id))
            .await?;
        Ok(members
            .iter()
            .filter_map(|key| self.keys.subscription_id(key).map(str::to_string))
            .collect())
    }

    /// Whether a subscription id is currently registered.
    pub async fn is_registered(&self, subscription_id: &str) -> Result<bool, StoreError> {
        self.store
            .key_exists(&self.keys.subscription(subscription_id))
            .await
    }
}
