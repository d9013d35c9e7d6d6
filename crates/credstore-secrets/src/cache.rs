//! Per-record cache of decrypted values
//!
//! An entry is valid while its `updated` timestamp equals the record's.
//! Every write moves `updated` forward, so a changed record always misses.
//! The lock is held across the decrypt call: concurrent readers of one
//! record wait for the first decryption instead of repeating it.

use crate::cipher::JsonDataCipher;
use chrono::{DateTime, Utc};
use credstore_core::config::CacheConfig;
use credstore_core::{Result, Secret};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::trace;
use zeroize::Zeroize;

struct CachedDecryption {
    updated: DateTime<Utc>,
    values: BTreeMap<String, String>,
}

impl Drop for CachedDecryption {
    fn drop(&mut self) {
        for value in self.values.values_mut() {
            value.zeroize();
        }
    }
}

/// Counters since creation or the last [`DecryptionCache::clear`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    /// No entry for the record
    pub misses: u64,
    /// Entry present but written for an older `updated`
    pub stale: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses + self.stale;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<i64, CachedDecryption>,
    hits: u64,
    misses: u64,
    stale: u64,
}

/// Last successful decryption of each secret, keyed by id
pub struct DecryptionCache {
    enabled: bool,
    state: Mutex<CacheState>,
}

impl DecryptionCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Plaintext for `secret`, decrypting on miss. A failed decryption is
    /// returned as an error and leaves the cache untouched.
    pub async fn get_or_decrypt(
        &self,
        secret: &Secret,
        cipher: &dyn JsonDataCipher,
    ) -> Result<BTreeMap<String, String>> {
        let mut state = self.state.lock().await;

        if !self.enabled {
            state.misses += 1;
            drop(state);
            return cipher.decrypt_json_data(&secret.secure_json_data).await;
        }

        let CacheState {
            entries,
            hits,
            misses,
            stale,
        } = &mut *state;

        match entries.get(&secret.id) {
            Some(entry) if entry.updated == secret.updated => {
                *hits += 1;
                trace!(id = secret.id, "Decryption cache hit");
                return Ok(entry.values.clone());
            }
            Some(_) => {
                *stale += 1;
                trace!(id = secret.id, "Decryption cache entry stale");
            }
            None => {
                *misses += 1;
                trace!(id = secret.id, "Decryption cache miss");
            }
        }

        let values = cipher.decrypt_json_data(&secret.secure_json_data).await?;
        entries.insert(
            secret.id,
            CachedDecryption {
                updated: secret.updated,
                values: values.clone(),
            },
        );
        Ok(values)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            stale: state.stale,
            entries: state.entries.len(),
        }
    }

    /// Drop every entry and reset the counters
    pub async fn clear(&self) {
        *self.state.lock().await = CacheState::default();
    }
}
