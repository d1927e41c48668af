//! AES-256-GCM encryption for downloaded content stored on disk.
//!
//! Files are written as a small binary envelope:
//! `b"CEF1" || 12-byte nonce || ciphertext+tag`. Files without the magic
//! prefix are returned as-is on load, so turning encryption on does not
//! break reading content written before it was enabled.
//!
//! The [`MasterKey`] wrapper zeroizes key material on drop and redacts its
//! `Debug` output.

use std::fmt;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use courier_core::{ContentStore, CourierError};

/// Envelope magic for encrypted content files.
const MAGIC: &[u8; 4] = b"CEF1";

/// GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// A 32-byte AES-256 key that is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        use aes_gcm::aead::rand_core::RngCore;
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Errors from content encryption and decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided key material is not a valid 32-byte key.
    #[error("invalid master key: {0}")]
    InvalidKey(String),

    /// The stored envelope is truncated or malformed.
    #[error("invalid encrypted envelope: {0}")]
    InvalidEnvelope(String),

    /// Decryption failed: wrong key or corrupted data.
    #[error("decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Filesystem failure while storing or loading.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a 32-byte master key from 64 hex chars or base64.
pub fn parse_master_key(raw: &str) -> Result<MasterKey, CryptoError> {
    let trimmed = raw.trim();
    if trimmed.len() == 64
        && let Ok(bytes) = hex::decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    if let Ok(bytes) = B64.decode(trimmed)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Ok(MasterKey(key));
    }
    Err(CryptoError::InvalidKey(
        "must be 32 bytes encoded as 64 hex chars or base64".to_owned(),
    ))
}

/// Encrypt `plaintext` into an envelope ready to be written to disk.
pub fn seal(key: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut envelope = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(MAGIC);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Decrypt an envelope produced by [`seal`].
///
/// Input without the envelope magic is returned unchanged (plaintext
/// pass-through).
pub fn open(key: &MasterKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if !data.starts_with(MAGIC) {
        return Ok(data.to_vec());
    }
    let rest = &data[MAGIC.len()..];
    if rest.len() < NONCE_LEN {
        return Err(CryptoError::InvalidEnvelope(
            "envelope shorter than nonce".to_owned(),
        ));
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt `bytes` and write the envelope to `path`, creating parent
/// directories as needed.
pub fn encrypt_and_store(key: &MasterKey, bytes: &[u8], path: &Path) -> Result<(), CryptoError> {
    let envelope = seal(key, bytes)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, envelope)?;
    Ok(())
}

/// Read `path` and decrypt its envelope.
pub fn read_and_decrypt(key: &MasterKey, path: &Path) -> Result<Vec<u8>, CryptoError> {
    let data = std::fs::read(path)?;
    open(key, &data)
}

/// [`ContentStore`] implementation that encrypts at rest.
#[derive(Debug, Clone)]
pub struct EncryptedStore {
    key: MasterKey,
}

impl EncryptedStore {
    /// Create a store around an existing key.
    #[must_use]
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    /// Create a store with a freshly generated key. Content is readable for
    /// the lifetime of this store only.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::new(MasterKey::generate())
    }
}

impl ContentStore for EncryptedStore {
    fn store(&self, bytes: &[u8], path: &Path) -> Result<(), CourierError> {
        encrypt_and_store(&self.key, bytes, path).map_err(|e| CourierError::Storage(e.to_string()))
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>, CourierError> {
        read_and_decrypt(&self.key, path).map_err(|e| CourierError::Storage(e.to_string()))
    }
}
