//! # credstore-secrets
//!
//! The secret service: encrypts values before they reach the store and
//! decrypts them on demand through a per-record cache.
//!
//! - [`cipher`]: the `JsonDataCipher` seam and the age/ChaCha20-Poly1305 envelope cipher
//! - [`cache`]: decryption cache keyed by secret id and `updated` timestamp
//! - [`service`]: `SecretService` and its bus handlers

pub mod cache;
pub mod cipher;
pub mod service;

pub use cache::{CacheStats, DecryptionCache};
pub use cipher::{generate_key_file, EncryptionOptions, EnvelopeCipher, JsonDataCipher};
pub use service::SecretService;
