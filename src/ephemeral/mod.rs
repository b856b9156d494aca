//! TTL-bounded ephemeral storage for aggregation windows and batches.
//!
//! The engine only ever touches this tier through [`EphemeralStore`], so the
//! in-process implementation can be swapped for a networked one without
//! changing any aggregation logic.

use anyhow::{bail, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of an atomic create-if-absent write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetIfAbsent {
    /// The key was vacant and now holds the caller's value.
    Set,
    /// The key was already present; carries the value that won.
    Exists(String),
}

/// Key-value store with per-key expiry and atomic single-key mutations.
///
/// Every mutating call refreshes the key's TTL to the supplied duration,
/// except `set_if_absent` losing the race, which leaves the winner's TTL
/// untouched. Reads never extend a TTL. An expired key behaves exactly like
/// an absent one.
pub trait EphemeralStore: Send + Sync {
    /// Atomically set `key` to `value` unless it is already present.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<SetIfAbsent>;

    /// Atomically add `delta` to an integer hash field, creating the hash
    /// and/or field as needed. Returns the value after the increment.
    fn hash_increment(&self, key: &str, field: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Set a hash field, creating the hash as needed.
    fn hash_set(&self, key: &str, field: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read all fields of a hash. Returns an empty map for an absent key.
    fn read_hash(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Atomically add a member to a set, creating the set as needed.
    /// Returns true if the member was not already present.
    fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool>;

    /// Read all members of a set, sorted. Returns an empty vec for an
    /// absent key.
    fn read_set(&self, key: &str) -> Result<Vec<String>>;

    /// Remove the given keys. Missing keys are ignored.
    fn delete(&self, keys: &[&str]) -> Result<()>;
}

enum EntryData {
    Value(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

impl EntryData {
    fn kind(&self) -> &'static str {
        match self {
            EntryData::Value(_) => "value",
            EntryData::Hash(_) => "hash",
            EntryData::Set(_) => "set",
        }
    }
}

struct Entry {
    expires_at: Instant,
    data: EntryData,
}

/// In-process [`EphemeralStore`] backed by a mutex-guarded map.
///
/// Expiry is lazy: an entry past its deadline is dropped the next time its
/// key is touched. [`MemoryEphemeralStore::purge_expired`] sweeps the whole
/// map for long-running processes.
pub struct MemoryEphemeralStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every expired entry. Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for MemoryEphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up a live entry, dropping it first if it has expired.
fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    let expired = entries.get(key).is_some_and(|e| e.expires_at <= now);
    if expired {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

impl EphemeralStore for MemoryEphemeralStore {
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<SetIfAbsent> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = live_entry(&mut entries, key, now) {
            let EntryData::Value(existing) = &entry.data else {
                bail!("key '{}' holds a {}, not a value", key, entry.data.kind());
            };
            return Ok(SetIfAbsent::Exists(existing.clone()));
        }
        entries.insert(
            key.to_string(),
            Entry {
                expires_at: now + ttl,
                data: EntryData::Value(value.to_string()),
            },
        );
        Ok(SetIfAbsent::Set)
    }

    fn hash_increment(&self, key: &str, field: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = live_entry(&mut entries, key, now) {
            let EntryData::Hash(fields) = &mut entry.data else {
                bail!("key '{}' holds a {}, not a hash", key, entry.data.kind());
            };
            let current = match fields.get(field) {
                Some(raw) => raw
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("hash field '{}.{}' is not an integer", key, field))?,
                None => 0,
            };
            let next = current + delta;
            fields.insert(field.to_string(), next.to_string());
            entry.expires_at = now + ttl;
            return Ok(next);
        }
        let mut fields = HashMap::new();
        fields.insert(field.to_string(), delta.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                expires_at: now + ttl,
                data: EntryData::Hash(fields),
            },
        );
        Ok(delta)
    }

    fn hash_set(&self, key: &str, field: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = live_entry(&mut entries, key, now) {
            let EntryData::Hash(fields) = &mut entry.data else {
                bail!("key '{}' holds a {}, not a hash", key, entry.data.kind());
            };
            fields.insert(field.to_string(), value.to_string());
            entry.expires_at = now + ttl;
            return Ok(());
        }
        let mut fields = HashMap::new();
        fields.insert(field.to_string(), value.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                expires_at: now + ttl,
                data: EntryData::Hash(fields),
            },
        );
        Ok(())
    }

    fn read_hash(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                let EntryData::Hash(fields) = &entry.data else {
                    bail!("key '{}' holds a {}, not a hash", key, entry.data.kind());
                };
                Ok(fields.clone())
            }
            None => Ok(HashMap::new()),
        }
    }

    fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        if let Some(entry) = live_entry(&mut entries, key, now) {
            let EntryData::Set(members) = &mut entry.data else {
                bail!("key '{}' holds a {}, not a set", key, entry.data.kind());
            };
            let added = members.insert(member.to_string());
            entry.expires_at = now + ttl;
            return Ok(added);
        }
        let mut members = BTreeSet::new();
        members.insert(member.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                expires_at: now + ttl,
                data: EntryData::Set(members),
            },
        );
        Ok(true)
    }

    fn read_set(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                let EntryData::Set(members) = &entry.data else {
                    bail!("key '{}' holds a {}, not a set", key, entry.data.kind());
                };
                Ok(members.iter().cloned().collect())
            }
            None => Ok(Vec::new()),
        }
    }

    fn delete(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
