//! In-memory token store.
//!
//! Same compare-and-swap contract as the SQLite store; state is lost on restart.

use super::{StoreError, TokenKey, TokenRecord, TokenStore};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// `DashMap`-backed [`TokenStore`]. The per-shard lock held by `entry()` makes
/// each version check and write atomic.
///
/// Versions come from one store-wide counter, so a record deleted and created
/// again never reuses a version an in-flight refresh may still hold.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: DashMap<TokenKey, TokenRecord>,
    last_version: AtomicU64,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, account_id: &str, provider: &str) -> Result<Option<TokenRecord>, StoreError> {
        let key = TokenKey::new(account_id, provider);
        Ok(self.records.get(&key).map(|r| r.value().clone()))
    }

    fn put(&self, record: &TokenRecord, expected_version: Option<u64>) -> Result<u64, StoreError> {
        let key = record.key();
        let now = Utc::now();

        match (self.records.entry(key.clone()), expected_version) {
            (Entry::Vacant(slot), None) => {
                let version = self.next_version();
                let mut stored = record.clone();
                stored.version = version;
                stored.updated_at = now;
                slot.insert(stored);
                Ok(version)
            }
            (Entry::Occupied(mut slot), Some(expected)) if slot.get().version == expected => {
                let version = self.next_version();
                let mut stored = record.clone();
                stored.version = version;
                stored.created_at = slot.get().created_at;
                stored.updated_at = now;
                slot.insert(stored);
                Ok(version)
            }
            _ => Err(StoreError::VersionConflict {
                key,
                expected: expected_version,
            }),
        }
    }

    fn delete(&self, account_id: &str, provider: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .remove(&TokenKey::new(account_id, provider))
            .is_some())
    }

    fn delete_if(
        &self,
        account_id: &str,
        provider: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        Ok(self
            .records
            .remove_if(&TokenKey::new(account_id, provider), |_, stored| {
                stored.version == expected_version
            })
            .is_some())
    }

    fn list_keys(&self) -> Result<Vec<TokenKey>, StoreError> {
        let mut keys: Vec<TokenKey> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn list_by_account(&self, account_id: &str) -> Result<Vec<String>, StoreError> {
        let mut providers: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.key().account_id == account_id)
            .map(|r| r.key().provider.clone())
            .collect();
        providers.sort();
        Ok(providers)
    }
}
