//! Value encryption for secure json data
//!
//! [`EnvelopeCipher`] encrypts each value with its own random data key
//! (ChaCha20-Poly1305) and wraps that key for an age X25519 identity.
//! The field name and scope label are bound in as associated data, so a
//! sealed value only opens under the field it was written for.
//!
//! Sealed layout:
//!
//! ```text
//! version(1) | scope_len(u16 BE) | scope | dek_len(u32 BE) | wrapped_dek | nonce(12) | ciphertext
//! ```

use age::secrecy::ExposeSecret;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use credstore_core::config::{EncryptionConfig, KeySource};
use credstore_core::{Error, Result, SecureJsonData};
use rand::RngCore;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

/// Size of the data encryption key in bytes (256 bits)
const DEK_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits for ChaCha20-Poly1305)
const NONCE_SIZE: usize = 12;

const SEALED_VERSION: u8 = 1;

/// Options for one encryption call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionOptions {
    /// Label bound into every value's associated data
    pub scope: Option<String>,
}

impl EncryptionOptions {
    pub fn without_scope() -> Self {
        Self { scope: None }
    }

    pub fn with_scope(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
        }
    }
}

/// Encrypts and decrypts a field → value map
#[async_trait]
pub trait JsonDataCipher: Send + Sync {
    async fn encrypt_json_data(
        &self,
        values: &BTreeMap<String, String>,
        options: EncryptionOptions,
    ) -> Result<SecureJsonData>;

    /// All or nothing: any field failing fails the whole map
    async fn decrypt_json_data(&self, data: &SecureJsonData) -> Result<BTreeMap<String, String>>;
}

/// Envelope cipher keyed by an age X25519 identity
pub struct EnvelopeCipher {
    identity: age::x25519::Identity,
}

impl EnvelopeCipher {
    pub fn new(identity: age::x25519::Identity) -> Self {
        Self { identity }
    }

    /// Read an age secret key (`AGE-SECRET-KEY-1...`) from a file
    pub fn from_key_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let key_content = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read key file: {}", path.display()))?,
        );

        let identity = parse_identity(&key_content)
            .with_context(|| format!("Invalid key file: {}", path.display()))?;
        Ok(Self::new(identity))
    }

    /// Read an age secret key from an environment variable
    pub fn from_env(env_var: &str) -> anyhow::Result<Self> {
        let key_content = Zeroizing::new(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        );

        let identity = parse_identity(&key_content)
            .with_context(|| format!("Invalid identity in {}", env_var))?;
        Ok(Self::new(identity))
    }

    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        config.validate()?;

        let cipher = match (config.key_source, &config.key_file, &config.key_env) {
            (KeySource::File, Some(path), _) => Self::from_key_file(path),
            (KeySource::Env, _, Some(var)) => Self::from_env(var),
            _ => Err(anyhow!("no key material configured")),
        };
        cipher.map_err(|e| Error::invalid_config(format!("{:#}", e)))
    }

    /// Public recipient string (`age1...`) for this identity
    pub fn public_key(&self) -> String {
        self.identity.to_public().to_string()
    }

    fn seal(&self, scope: &str, field: &str, value: &str) -> anyhow::Result<Vec<u8>> {
        let mut dek = Zeroizing::new([0u8; DEK_SIZE]);
        rand::rng().fill_bytes(dek.as_mut());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(dek.as_ref()));
        let aad = associated_data(scope, field);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: value.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let wrapped_dek = self.wrap_dek(dek.as_ref())?;

        let scope_len = u16::try_from(scope.len()).context("Scope label too long")?;
        let dek_len = u32::try_from(wrapped_dek.len()).context("Wrapped key too long")?;

        let mut sealed = Vec::with_capacity(
            1 + 2 + scope.len() + 4 + wrapped_dek.len() + NONCE_SIZE + ciphertext.len(),
        );
        sealed.push(SEALED_VERSION);
        sealed.extend_from_slice(&scope_len.to_be_bytes());
        sealed.extend_from_slice(scope.as_bytes());
        sealed.extend_from_slice(&dek_len.to_be_bytes());
        sealed.extend_from_slice(&wrapped_dek);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, field: &str, sealed: &[u8]) -> anyhow::Result<String> {
        let mut reader = SealedReader { buf: sealed };

        let version = reader.take(1)?[0];
        if version != SEALED_VERSION {
            bail!("Unsupported sealed value version: {}", version);
        }

        let scope_len = u16::from_be_bytes(reader.take(2)?.try_into()?) as usize;
        let scope = std::str::from_utf8(reader.take(scope_len)?).context("Scope is not UTF-8")?;
        let dek_len = u32::from_be_bytes(reader.take(4)?.try_into()?) as usize;
        let wrapped_dek = reader.take(dek_len)?;
        let nonce_bytes = reader.take(NONCE_SIZE)?;
        let ciphertext = reader.buf;

        let dek = self.unwrap_dek(wrapped_dek)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(dek.as_slice()));
        let aad = associated_data(scope, field);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce_bytes),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|e| anyhow!("Decryption failed: {}", e))?,
        );

        String::from_utf8(plaintext.to_vec()).context("Decrypted value is not valid UTF-8")
    }

    fn wrap_dek(&self, dek: &[u8]) -> anyhow::Result<Vec<u8>> {
        let recipient = self.identity.to_public();
        let encryptor =
            age::Encryptor::with_recipients(std::iter::once(&recipient as &dyn age::Recipient))
                .map_err(|e| anyhow!("Failed to create encryptor: {}", e))?;

        let mut wrapped = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut wrapped)
            .map_err(|e| anyhow!("Failed to create encryption writer: {}", e))?;
        writer.write_all(dek).context("Failed to write data key")?;
        writer.finish().context("Failed to finalize data key")?;

        Ok(wrapped)
    }

    fn unwrap_dek(&self, wrapped: &[u8]) -> anyhow::Result<Zeroizing<Vec<u8>>> {
        let decryptor =
            age::Decryptor::new(wrapped).map_err(|e| anyhow!("Failed to create decryptor: {}", e))?;

        let mut dek = Zeroizing::new(Vec::new());
        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|e| anyhow!("Failed to unwrap data key: {}", e))?;
        reader
            .read_to_end(&mut *dek)
            .context("Failed to read data key")?;

        if dek.len() != DEK_SIZE {
            bail!(
                "Data key has wrong size: expected {}, got {}",
                DEK_SIZE,
                dek.len()
            );
        }
        Ok(dek)
    }
}

#[async_trait]
impl JsonDataCipher for EnvelopeCipher {
    async fn encrypt_json_data(
        &self,
        values: &BTreeMap<String, String>,
        options: EncryptionOptions,
    ) -> Result<SecureJsonData> {
        let scope = options.scope.as_deref().unwrap_or_default();
        let sealed = values
            .iter()
            .map(|(field, value)| {
                self.seal(scope, field, value)
                    .map(|sealed| (field.clone(), sealed))
                    .map_err(|e| Error::encryption(format!("field '{}': {:#}", field, e)))
            })
            .collect::<Result<SecureJsonData>>()?;

        debug!(fields = sealed.len(), "Encrypted secure json data");
        Ok(sealed)
    }

    async fn decrypt_json_data(&self, data: &SecureJsonData) -> Result<BTreeMap<String, String>> {
        data.iter()
            .map(|(field, sealed)| {
                self.open(field, sealed)
                    .map(|value| (field.clone(), value))
                    .map_err(|e| Error::decryption(format!("field '{}': {:#}", field, e)))
            })
            .collect()
    }
}

struct SealedReader<'a> {
    buf: &'a [u8],
}

impl<'a> SealedReader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() < n {
            bail!("Sealed value truncated");
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

fn associated_data(scope: &str, field: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(scope.len() + 1 + field.len());
    aad.extend_from_slice(scope.as_bytes());
    aad.push(0);
    aad.extend_from_slice(field.as_bytes());
    aad
}

fn parse_identity(content: &str) -> anyhow::Result<age::x25519::Identity> {
    // Key files written by age-keygen carry comment lines
    let key = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| anyhow!("No age identity found"))?;

    key.parse::<age::x25519::Identity>()
        .map_err(|e| anyhow!("Failed to parse age identity: {}", e))
}

/// Generate a new identity and write it to `path` with 0600 permissions.
/// Returns the public recipient string.
pub fn generate_key_file(path: &Path, overwrite: bool) -> anyhow::Result<String> {
    if path.exists() && !overwrite {
        bail!("Key file already exists: {}", path.display());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let identity = age::x25519::Identity::generate();
    let public_key = identity.to_public().to_string();
    let secret_key = identity.to_string();

    std::fs::write(path, secret_key.expose_secret())
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).with_context(
            || format!("Failed to set permissions on key file: {}", path.display()),
        )?;
    }

    Ok(public_key)
}
