use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::ExpiringStore;

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Process-local [`ExpiringStore`]. State is lost on restart and is not
/// shared between proxy instances.
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: DashMap<String, Slot<V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> ExpiringStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.entries.get(key).map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: V, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .insert(key.to_owned(), Slot { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.expires_at >= now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}
