//! Credential vault: upstream secret encryption and API key hashing.
//!
//! Encrypted values are base64 of `salt(64) | nonce(16) | tag(16) | ciphertext`,
//! with the AES-256-GCM key derived per value from the master secret by
//! PBKDF2-HMAC-SHA512.

use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, Aead, KeyInit},
    aes::Aes256,
    AesGcm,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use rand::RngCore;
use sha2::Sha512;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// AES-256-GCM with a 128-bit nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const SALT_LEN: usize = 64;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

/// bcrypt cost for issued API keys.
pub const BCRYPT_COST: u32 = 10;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Cannot {0} empty string")]
    Empty(&'static str),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: Invalid encrypted data or key")]
    Decrypt,

    #[error("Hashing failed: {0}")]
    Hash(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Clone)]
pub struct CredentialVault {
    master: Arc<str>,
    rounds: u32,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("master", &"[REDACTED]")
            .field("rounds", &self.rounds)
            .finish()
    }
}

impl CredentialVault {
    pub fn new(master_secret: &str) -> Result<Self> {
        Self::with_kdf_rounds(master_secret, PBKDF2_ROUNDS)
    }

    /// Vault with a custom PBKDF2 iteration count. Values written with one
    /// count cannot be read back with another; only tests and benches should
    /// use anything but the default.
    pub fn with_kdf_rounds(master_secret: &str, rounds: u32) -> Result<Self> {
        if master_secret.is_empty() {
            return Err(CryptoError::Empty("use"));
        }
        Ok(Self {
            master: Arc::from(master_secret),
            rounds: rounds.max(1),
        })
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha512>(self.master.as_bytes(), salt, self.rounds, &mut key);
        key
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Err(CryptoError::Empty("encrypt"));
        }

        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm16::new_from_slice(&key).map_err(|_| CryptoError::Encrypt)?;
        let sealed = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        // aes-gcm appends the tag; the stored layout puts it before the ciphertext.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut combined = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
        combined.extend_from_slice(&salt);
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(tag);
        combined.extend_from_slice(ciphertext);

        Ok(STANDARD.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.is_empty() {
            return Err(CryptoError::Empty("decrypt"));
        }

        let combined = STANDARD.decode(encoded).map_err(|_| CryptoError::Decrypt)?;
        if combined.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decrypt);
        }

        let (salt, rest) = combined.split_at(SALT_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm16::new_from_slice(&key).map_err(|_| CryptoError::Decrypt)?;
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(nonce), sealed.as_slice())
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decrypt)
    }

    /// bcrypt digest of an issued secret at [`BCRYPT_COST`], the form the
    /// admin tooling stores in `api_keys.key`. The gateway itself only
    /// verifies. Blocking; call from `spawn_blocking` on request paths.
    pub fn hash_secret(secret: &str) -> Result<String> {
        Self::hash_secret_with_cost(secret, BCRYPT_COST)
    }

    pub fn hash_secret_with_cost(secret: &str, cost: u32) -> Result<String> {
        bcrypt::hash(secret, cost).map_err(|e| CryptoError::Hash(e.to_string()))
    }

    /// A malformed digest verifies as `false`.
    pub fn verify_secret(secret: &str, digest: &str) -> bool {
        bcrypt::verify(secret, digest).unwrap_or(false)
    }
}

/// Random URL-safe key: `prefix` followed by `length` characters.
///
/// Used by the admin tooling when issuing keys, together with
/// [`CredentialVault::hash_secret`].
pub fn generate_api_key(prefix: &str, length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    let random: String = URL_SAFE_NO_PAD.encode(&bytes).chars().take(length).collect();
    format!("{}{}", prefix, random)
}

/// Display form of a key: first 10 and last 4 characters.
pub fn mask_api_key(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() < 14 {
        return "***".to_string();
    }
    let start: String = chars[..10].iter().collect();
    let end: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", start, end)
}
