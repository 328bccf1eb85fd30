//! In-process buffer implementing the [`UpdateBuffer`] command set.
//!
//! One `Arc<MemoryBuffer>` shared by several managers behaves like one
//! buffer server shared by several processes: every command runs under a
//! single keyspace lock, so each command (including the dual-effect
//! `push_update`) is atomic with respect to all others.

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{BufferError, UpdateBuffer};

#[derive(Debug)]
enum Value {
    Set(HashSet<String>),
    List(VecDeque<Vec<u8>>),
    Bytes {
        value: Vec<u8>,
        expires_at: Option<Instant>,
    },
}

impl Value {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Value::Bytes { expires_at: Some(at), .. } if *at <= now)
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Set(_) => "set",
            Value::List(_) => "list",
            Value::Bytes { .. } => "value",
        }
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Value>,
}

impl Keyspace {
    /// Lazily evict an expired key before it is observed.
    fn evict_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|v| v.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut HashSet<String>, BufferError> {
        self.evict_expired(key);
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()))
        {
            Value::Set(set) => Ok(set),
            other => Err(wrong_type(key, "set", other)),
        }
    }

    fn list_mut(&mut self, key: &str) -> Result<&mut VecDeque<Vec<u8>>, BufferError> {
        self.evict_expired(key);
        match self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(list) => Ok(list),
            other => Err(wrong_type(key, "list", other)),
        }
    }

    /// Drop empty collections so they read as missing.
    fn tidy(&mut self, key: &str) {
        let empty = match self.entries.get(key) {
            Some(Value::Set(set)) => set.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> BufferError {
    BufferError::Command(format!(
        "WRONGTYPE key '{key}' holds a {}, expected a {expected}",
        found.kind()
    ))
}

/// In-memory [`UpdateBuffer`].
#[derive(Debug, Default)]
pub struct MemoryBuffer {
    keyspace: Mutex<Keyspace>,
    unavailable: AtomicBool,
}

impl MemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outages. While unavailable every command fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    /// Whether `key` currently exists (expired values count as missing).
    pub async fn exists(&self, key: &str) -> bool {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.evict_expired(key);
        keyspace.entries.contains_key(key)
    }

    /// Members of a set, for inspection.
    pub async fn set_members(&self, key: &str) -> Vec<String> {
        let keyspace = self.keyspace.lock().await;
        match keyspace.entries.get(key) {
            Some(Value::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Current value of a plain key, for inspection.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.evict_expired(key);
        match keyspace.entries.get(key) {
            Some(Value::Bytes { value, .. }) => Some(value.clone()),
            _ => None,
        }
    }

    fn check(&self) -> Result<(), BufferError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BufferError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateBuffer for MemoryBuffer {
    async fn push_update(
        &self,
        set_key: &str,
        list_key: &str,
        member: &str,
        update: &[u8],
    ) -> Result<(), BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;

        // validate both keys before touching either
        for (key, kind) in [(set_key, "set"), (list_key, "list")] {
            keyspace.evict_expired(key);
            if let Some(existing) = keyspace.entries.get(key) {
                if existing.kind() != kind {
                    return Err(wrong_type(key, kind, existing));
                }
            }
        }

        keyspace.set_mut(set_key)?.insert(member.to_string());
        keyspace.list_mut(list_key)?.push_back(update.to_vec());
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<Vec<u8>>, BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;
        keyspace.evict_expired(key);
        match keyspace.entries.get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, "list", other)),
        }
    }

    async fn list_trim_front(&self, key: &str, count: usize) -> Result<(), BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;
        let list = keyspace.list_mut(key)?;
        let count = count.min(list.len());
        list.drain(..count);
        keyspace.tidy(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;
        keyspace.set_mut(key)?.insert(member.to_string());
        Ok(())
    }

    async fn set_pop(&self, key: &str) -> Result<Option<String>, BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;
        let set = keyspace.set_mut(key)?;
        let picked = set.iter().choose(&mut rand::thread_rng()).cloned();
        if let Some(member) = &picked {
            set.remove(member);
        }
        keyspace.tidy(key);
        Ok(picked)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;
        keyspace.evict_expired(key);
        if keyspace.entries.contains_key(key) {
            return Ok(false);
        }
        keyspace.entries.insert(
            key.to_string(),
            Value::Bytes {
                value: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), BufferError> {
        self.check()?;
        let mut keyspace = self.keyspace.lock().await;
        keyspace.entries.remove(key);
        Ok(())
    }
}
