//! Secret service facade
//!
//! Encrypts plaintext before it reaches the store, passes reads through,
//! and materialises plaintext through the decryption cache.

use crate::cache::{CacheStats, DecryptionCache};
use crate::cipher::{EncryptionOptions, EnvelopeCipher, JsonDataCipher};
use async_trait::async_trait;
use credstore_core::config::{CacheConfig, StoreConfig};
use credstore_core::{
    AddSecretCommand, Bus, DeleteSecretCommand, GetSecretQuery, GetSecretsQuery, Handler, Result,
    Secret, SecureJsonData, UpdateSecretCommand,
};
use credstore_sqlstore::SqlStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Secret CRUD with encrypt-before-write and cached plaintext reads.
///
/// Callers reach it directly or through the [`Bus`] once its handlers are
/// registered. Stored values are always ciphertext; plaintext exists only in
/// command payloads and in [`SecretService::decrypted_values`].
pub struct SecretService {
    store: SqlStore,
    cipher: Arc<dyn JsonDataCipher>,
    cache: DecryptionCache,
}

impl SecretService {
    pub fn new(store: SqlStore, cipher: Arc<dyn JsonDataCipher>, cache_config: &CacheConfig) -> Self {
        Self {
            store,
            cipher,
            cache: DecryptionCache::new(cache_config),
        }
    }

    /// Build the service and register its handlers on `bus`
    pub fn provide(
        bus: &Bus,
        store: SqlStore,
        cipher: Arc<dyn JsonDataCipher>,
        cache_config: &CacheConfig,
    ) -> Arc<Self> {
        let service = Arc::new(Self::new(store, cipher, cache_config));
        service.register_handlers(bus);
        service
    }

    /// Wire a complete service from configuration: key material, database
    /// and migrations, then bus registration. Events are published on `bus`.
    ///
    /// The store only holds a weak handle to `bus`, so the service lives as
    /// long as the bus or the returned `Arc` does.
    pub async fn from_config(config: &StoreConfig, bus: Arc<Bus>) -> Result<Arc<Self>> {
        config.validate()?;

        let cipher = Arc::new(EnvelopeCipher::from_config(&config.encryption)?);
        let store = SqlStore::connect(&config.database, bus.publisher()).await?;

        Ok(Self::provide(&bus, store, cipher, &config.cache))
    }

    pub fn register_handlers(self: &Arc<Self>, bus: &Bus) {
        bus.add_handler::<GetSecretQuery, _>(self.clone());
        bus.add_handler::<GetSecretsQuery, _>(self.clone());
        bus.add_handler::<AddSecretCommand, _>(self.clone());
        bus.add_handler::<UpdateSecretCommand, _>(self.clone());
        bus.add_handler::<DeleteSecretCommand, _>(self.clone());
        info!(cache_enabled = self.cache.is_enabled(), "Secret service registered");
    }

    /// The underlying store, for maintenance queries such as health checks
    pub fn store(&self) -> &SqlStore {
        &self.store
    }

    pub async fn get_secret(&self, query: &GetSecretQuery) -> Result<Secret> {
        self.store.get_secret(query).await
    }

    pub async fn get_secrets(&self, query: &GetSecretsQuery) -> Result<Vec<Secret>> {
        self.store.get_secrets(query).await
    }

    pub async fn add_secret(&self, cmd: &AddSecretCommand) -> Result<Secret> {
        let data = self.encrypt(&cmd.secure_json_data).await?;
        self.store.add_secret(cmd, data).await
    }

    pub async fn update_secret(&self, cmd: &UpdateSecretCommand) -> Result<Secret> {
        let data = self.encrypt(&cmd.secure_json_data).await?;
        self.store.update_secret(cmd, data).await
    }

    pub async fn delete_secret(&self, cmd: &DeleteSecretCommand) -> Result<u64> {
        self.store.delete_secret(cmd).await
    }

    /// Plaintext values of `secret`. Decryption failures yield an empty
    /// map, never a partial one.
    pub async fn decrypted_values(&self, secret: &Secret) -> BTreeMap<String, String> {
        match self.cache.get_or_decrypt(secret, self.cipher.as_ref()).await {
            Ok(values) => values,
            Err(e) => {
                warn!(id = secret.id, org_id = secret.org_id, error = %e, "Failed to decrypt secure json data");
                BTreeMap::new()
            }
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    async fn encrypt(&self, values: &BTreeMap<String, String>) -> Result<SecureJsonData> {
        self.cipher
            .encrypt_json_data(values, EncryptionOptions::without_scope())
            .await
    }
}

#[async_trait]
impl Handler<GetSecretQuery> for SecretService {
    async fn handle(&self, query: GetSecretQuery) -> Result<Secret> {
        self.get_secret(&query).await
    }
}

#[async_trait]
impl Handler<GetSecretsQuery> for SecretService {
    async fn handle(&self, query: GetSecretsQuery) -> Result<Vec<Secret>> {
        self.get_secrets(&query).await
    }
}

#[async_trait]
impl Handler<AddSecretCommand> for SecretService {
    async fn handle(&self, cmd: AddSecretCommand) -> Result<Secret> {
        self.add_secret(&cmd).await
    }
}

#[async_trait]
impl Handler<UpdateSecretCommand> for SecretService {
    async fn handle(&self, cmd: UpdateSecretCommand) -> Result<Secret> {
        self.update_secret(&cmd).await
    }
}

#[async_trait]
impl Handler<DeleteSecretCommand> for SecretService {
    async fn handle(&self, cmd: DeleteSecretCommand) -> Result<u64> {
        self.delete_secret(&cmd).await
    }
}
