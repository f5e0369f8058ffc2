use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{Store, StoreError};
use crate::keys::CHANNEL_SEPARATOR;

#[derive(Debug)]
enum Entry {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    Value(String),
}

/// An in-process [`Store`] backed by a mutex-guarded map.
///
/// Used by this crate's own tests and suitable for local development; every
/// multi-key mutation runs inside one critical section, which satisfies the
/// trait's atomicity contract for a single process. Like Redis, a set whose
/// last member is removed ceases to exist.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.into() }
}

fn set_members_of(
    entries: &HashMap<String, Entry>,
    key: &str,
) -> Result<Vec<String>, StoreError> {
    match entries.get(key) {
        Some(Entry::Set(members)) => Ok(members.iter().cloned().collect()),
        Some(_) => Err(wrong_type(key)),
        None => Ok(Vec::new()),
    }
}

fn add_to_set(entries: &mut HashMap<String, Entry>, key: &str, member: String) {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::Set(BTreeSet::new()))
    {
        Entry::Set(members) => {
            members.insert(member);
        }
        // Type collisions inside a scripted mutation are ignored; the
        // non-scripted ops report them.
        _ => {}
    }
}

fn remove_from_set(entries: &mut HashMap<String, Entry>, key: &str, member: &str) {
    if let Some(Entry::Set(members)) = entries.get_mut(key) {
        members.remove(member);
        if members.is_empty() {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn write_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(existing) => {
                for (field, value) in fields {
                    existing.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn clear_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        let emptied = match entries.get_mut(key) {
            Some(Entry::Hash(existing)) => {
                for field in fields {
                    existing.remove(field);
                }
                existing.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        if emptied {
            entries.remove(key);
        }
        Ok(())
    }

    async fn replace_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry::Hash(fields.iter().cloned().collect()),
        );
        Ok(())
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(Entry::Value(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn write_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), Entry::Value(value.to_string()));
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().unwrap();
        set_members_of(&entries, key)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.contains_key(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn link_subscription(
        &self,
        conn_key: &str,
        sub_key: &str,
        topic_keys: &[String],
        channel: &str,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        add_to_set(&mut entries, conn_key, sub_key.to_string());
        for topic_key in topic_keys {
            add_to_set(&mut entries, topic_key, channel.to_string());
            add_to_set(&mut entries, sub_key, topic_key.clone());
        }
        Ok(())
    }

    async fn unlink_subscription(
        &self,
        conn_key: &str,
        sub_key: &str,
        channel: &str,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        for topic_key in set_members_of(&entries, sub_key)? {
            remove_from_set(&mut entries, &topic_key, channel);
        }
        remove_from_set(&mut entries, conn_key, sub_key);
        entries.remove(sub_key);
        Ok(())
    }

    async fn purge_connection(&self, conn_key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        for sub_key in set_members_of(&entries, conn_key)? {
            let channel = format!("{conn_key}{CHANNEL_SEPARATOR}{sub_key}");
            for topic_key in set_members_of(&entries, &sub_key)? {
                remove_from_set(&mut entries, &topic_key, &channel);
            }
            entries.remove(&sub_key);
        }
        entries.remove(conn_key);
        Ok(())
    }
}
