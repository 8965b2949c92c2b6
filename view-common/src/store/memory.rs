use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{self, Instant};

use async_trait::async_trait;

use super::{DedupStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Set(HashSet<String>),
    Counter(i64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An in-process `DedupStore`. Each operation holds one lock for its whole
/// duration, which gives it the same atomicity as a single Redis command.
/// Used for tests and single-process deployments without Redis.
#[derive(Clone, Default)]
pub struct MemoryDedupStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a timeout, as if the store
    /// was unreachable, until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current value of a counter without clearing it.
    pub fn peek_counter(&self, key: &str) -> i64 {
        let mut entries = self.lock();
        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => *count,
            _ => 0,
        }
    }

    fn check_available(&self, command: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Timeout(command))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Drop `key` if it has expired, then return what is left.
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(command: &'static str) -> StoreError {
    StoreError::InvalidConfiguration(format!(
        "{command} against a key holding the wrong kind of value"
    ))
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Option<time::Duration>,
    ) -> StoreResult<bool> {
        self.check_available("SADD")?;
        let mut entries = self.lock();

        if live_entry(&mut entries, key).is_none() {
            entries.insert(
                key.to_owned(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };

        let Value::Set(members) = &mut entry.value else {
            return Err(wrong_type("SADD"));
        };
        let added = members.insert(member.to_owned());

        if let Some(ttl) = ttl {
            if added || entry.expires_at.is_none() {
                // A window past what `Instant` can represent never expires.
                entry.expires_at = Instant::now().checked_add(ttl);
            }
        }

        // A zero window expires the set immediately.
        live_entry(&mut entries, key);

        Ok(added)
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_available("SREM")?;
        let mut entries = self.lock();

        let now_empty = match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                members.is_empty()
            }
            Some(_) => return Err(wrong_type("SREM")),
            None => false,
        };

        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available("SMEMBERS")?;
        let mut entries = self.lock();

        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type("SMEMBERS")),
            None => Ok(Vec::new()),
        }
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.check_available("INCRBY")?;
        let mut entries = self.lock();

        match live_entry(&mut entries, key) {
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => {
                *count += delta;
                Ok(*count)
            }
            Some(_) => Err(wrong_type("INCRBY")),
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: Value::Counter(delta),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn get_and_delete(&self, key: &str) -> StoreResult<i64> {
        self.check_available("GETDEL")?;
        let mut entries = self.lock();

        if live_entry(&mut entries, key).is_none() {
            return Ok(0);
        }
        match entries.remove(key) {
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => Ok(count),
            Some(entry) => {
                entries.insert(key.to_owned(), entry);
                Err(wrong_type("GETDEL"))
            }
            None => Ok(0),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available("EXISTS")?;
        let mut entries = self.lock();
        Ok(live_entry(&mut entries, key).is_some())
    }
}
