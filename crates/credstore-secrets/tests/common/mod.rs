//! Shared fixtures for credstore-secrets end-to-end tests
//!
//! Each environment gets its own key file and SQLite database in a
//! temporary directory.

#![allow(dead_code)]

use async_trait::async_trait;
use camino::Utf8PathBuf;
use credstore_core::config::{CacheConfig, DatabaseConfig};
use credstore_core::{Bus, Error, EventPublisher, Result, SecretEvent, SecureJsonData};
use credstore_secrets::{
    generate_key_file, EncryptionOptions, EnvelopeCipher, JsonDataCipher, SecretService,
};
use credstore_sqlstore::SqlStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Envelope cipher that counts calls
pub struct CountingCipher {
    inner: EnvelopeCipher,
    encrypts: AtomicUsize,
    decrypts: AtomicUsize,
}

impl CountingCipher {
    pub fn new(inner: EnvelopeCipher) -> Self {
        Self {
            inner,
            encrypts: AtomicUsize::new(0),
            decrypts: AtomicUsize::new(0),
        }
    }

    pub fn encrypts(&self) -> usize {
        self.encrypts.load(Ordering::SeqCst)
    }

    pub fn decrypts(&self) -> usize {
        self.decrypts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JsonDataCipher for CountingCipher {
    async fn encrypt_json_data(
        &self,
        values: &BTreeMap<String, String>,
        options: EncryptionOptions,
    ) -> Result<SecureJsonData> {
        self.encrypts.fetch_add(1, Ordering::SeqCst);
        self.inner.encrypt_json_data(values, options).await
    }

    async fn decrypt_json_data(&self, data: &SecureJsonData) -> Result<BTreeMap<String, String>> {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        self.inner.decrypt_json_data(data).await
    }
}

/// Publisher whose sink is always down
#[derive(Default)]
pub struct FailingPublisher {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _event: SecretEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Publish("event sink unavailable".to_string()))
    }
}

pub struct TestEnv {
    pub service: Arc<SecretService>,
    pub bus: Arc<Bus>,
    pub cipher: Arc<CountingCipher>,
    pub events: broadcast::Receiver<SecretEvent>,
    pub key_file: Utf8PathBuf,
    pub database_url: String,
    _temp: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_cache(CacheConfig::default()).await
    }

    pub async fn with_cache(cache: CacheConfig) -> Self {
        Self::build(cache, |url| DatabaseConfig::with_url(url)).await
    }

    /// File database served by a pool of `max_connections`
    pub async fn with_pool_size(max_connections: u32) -> Self {
        Self::build(CacheConfig::default(), |url| DatabaseConfig {
            max_connections,
            ..DatabaseConfig::with_url(url)
        })
        .await
    }

    async fn build(cache: CacheConfig, database: impl FnOnce(&str) -> DatabaseConfig) -> Self {
        let temp = TempDir::new().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("Invalid UTF-8 path");

        let key_file = dir.join("credstore.key");
        generate_key_file(key_file.as_std_path(), false).unwrap();
        let cipher = Arc::new(CountingCipher::new(
            EnvelopeCipher::from_key_file(&key_file).unwrap(),
        ));

        let database_url = format!("sqlite://{}", dir.join("secrets.db"));
        let bus = Arc::new(Bus::new());
        let events = bus.subscribe();
        let store = SqlStore::connect(&database(&database_url), bus.publisher())
            .await
            .unwrap();
        let service = SecretService::provide(&bus, store, cipher.clone(), &cache);

        Self {
            service,
            bus,
            cipher,
            events,
            key_file,
            database_url,
            _temp: temp,
        }
    }

    /// Events received so far, without waiting
    pub fn drain_events(&mut self) -> Vec<SecretEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn plaintext(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
