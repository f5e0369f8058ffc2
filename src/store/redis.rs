use std::collections::HashMap;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};

use super::{Store, StoreError};

// Each registry mutation is one server-side script, so concurrent invocations
// never observe a torn index. The scripts discover keys at runtime, which
// assumes a non-clustered deployment.

const LINK_SCRIPT: &str = r"
redis.call('SADD', KEYS[1], KEYS[2])
for i = 3, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[1])
  redis.call('SADD', KEYS[2], KEYS[i])
end
return redis.status_reply('OK')
";

const UNLINK_SCRIPT: &str = r"
local topics = redis.call('SMEMBERS', KEYS[2])
for _, topic in ipairs(topics) do
  redis.call('SREM', topic, ARGV[1])
end
redis.call('SREM', KEYS[1], KEYS[2])
redis.call('DEL', KEYS[2])
return redis.status_reply('OK')
";

const PURGE_SCRIPT: &str = r"
local subs = redis.call('SMEMBERS', KEYS[1])
for _, sub in ipairs(subs) do
  local channel = KEYS[1] .. '#' .. sub
  local topics = redis.call('SMEMBERS', sub)
  for _, topic in ipairs(topics) do
    redis.call('SREM', topic, channel)
  end
  redis.call('DEL', sub)
end
redis.call('DEL', KEYS[1])
return redis.status_reply('OK')
";

const REPLACE_SCRIPT: &str = r"
redis.call('DEL', KEYS[1])
for i = 1, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return redis.status_reply('OK')
";

/// A [`Store`] backed by a shared Redis instance.
///
/// Built once at cold start and reused across invocations; the underlying
/// connection manager reconnects on its own.
pub struct RedisStore {
    conn: ConnectionManager,
    link: Script,
    unlink: Script,
    purge: Script,
    replace: Script,
}

impl RedisStore {
    /// Wraps an established connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            link: Script::new(LINK_SCRIPT),
            unlink: Script::new(UNLINK_SCRIPT),
            purge: Script::new(PURGE_SCRIPT),
            replace: Script::new(REPLACE_SCRIPT),
        }
    }

    /// Connects to the Redis instance at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self::new(conn))
    }
}

fn backend(err: RedisError) -> StoreError {
    StoreError::Backend(Box::new(err))
}

#[async_trait]
impl Store for RedisStore {
    async fn read_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(backend)
    }

    async fn write_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(backend)
    }

    async fn clear_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, fields).await.map_err(backend)
    }

    async fn replace_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut invocation = self.replace.prepare_invoke();
        invocation.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let mut conn = self.conn.clone();
        invocation.invoke_async::<()>(&mut conn).await.map_err(backend)
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(backend)
    }

    async fn write_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await.map_err(backend)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(backend)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(backend)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await.map_err(backend)
    }

    async fn link_subscription(
        &self,
        conn_key: &str,
        sub_key: &str,
        topic_keys: &[String],
        channel: &str,
    ) -> Result<(), StoreError> {
        let mut invocation = self.link.prepare_invoke();
        invocation.key(conn_key).key(sub_key);
        for topic_key in topic_keys {
            invocation.key(topic_key.as_str());
        }
        invocation.arg(channel);
        let mut conn = self.conn.clone();
        invocation.invoke_async::<()>(&mut conn).await.map_err(backend)
    }

    async fn unlink_subscription(
        &self,
        conn_key: &str,
        sub_key: &str,
        channel: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.unlink
            .prepare_invoke()
            .key(conn_key)
            .key(sub_key)
            .arg(channel)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn purge_connection(&self, conn_key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.purge
            .prepare_invoke()
            .key(conn_key)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(backend)
    }
}
