//! # Secrets Manager
//!
//! Per-user derived-key authenticated encryption for arbitrary credential
//! blobs. Each blob gets its own random salt; the encryption key is derived
//! from the base key and the owning user with PBKDF2-HMAC-SHA256 and used
//! with AES-256-GCM. A short fingerprint of the derived key lets rotations
//! be detected without decrypting anything.
//!
//! Plaintext never touches persistent storage or the logs; decryption
//! failures collapse into a single error kind so the manager cannot be used
//! as a padding or authentication oracle.

use aes_gcm::aead::{Aead, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

use crate::audit::{SecurityEvent, Severity, SharedAudit};

/// Salt length in bytes, one salt per blob.
const SALT_LEN: usize = 16;
/// AES-GCM nonce length in bytes, prepended to the ciphertext.
const NONCE_LEN: usize = 12;
/// Derived key length in bytes (AES-256).
const KEY_LEN: usize = 32;
/// Fingerprint length in bytes, taken from the front of SHA-256(key).
const FINGERPRINT_LEN: usize = 8;
/// Upper bound on cached derived keys.
const KEY_CACHE_CAPACITY: usize = 1024;
/// Lower bound on PBKDF2 rounds.
const MIN_ITERATIONS: u32 = 100_000;
/// Substrings that disqualify a master key in production.
const PLACEHOLDER_KEYS: &[&str] = &["changeme", "password", "secret"];

/// Errors from the secrets layer.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    /// Master key malformed, too short, or a known placeholder
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),

    /// Iteration count below the configured floor
    #[error("iteration count {0} below minimum {MIN_ITERATIONS}")]
    InsufficientIterations(u32),

    /// Any decryption failure: tag mismatch, malformed ciphertext, wrong
    /// user, rotated base key. Causes are deliberately not distinguished.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Encryption-side failure (should not happen with valid keys)
    #[error("encryption failed")]
    EncryptionFailed,

    /// A secret with this name already exists for the owner
    #[error("secret '{0}' already exists")]
    Conflict(String),

    /// No secret with this name exists for the owner
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Base secret key, base64-encoded, decoding to ≥32 bytes
    pub master_key: String,
    /// PBKDF2 rounds, fixed at construction
    pub iterations: u32,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            master_key: String::new(),
            iterations: MIN_ITERATIONS,
        }
    }
}

/// The persisted shape of one encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// base64(nonce || gcm body)
    pub ciphertext: String,
    /// base64(16 random bytes)
    pub salt: String,
    /// base64(SHA256(derived key)[..8])
    pub key_fingerprint: String,
}

/// A stored credential blob, as the persistence layer keeps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretBlob {
    pub owner_id: u64,
    /// Logical name, unique per owner
    pub name: String,
    /// Type tag ("api_key", "database_password", ...)
    pub secret_type: String,
    #[serde(flatten)]
    pub payload: EncryptedSecret,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When a rotation becomes due, if scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_due: Option<DateTime<Utc>>,
}

/// Per-user authenticated encryption with derived keys.
pub struct SecretsManager {
    base_key: Vec<u8>,
    iterations: u32,
    /// Derived keys keyed by (user, salt); bounded and wiped on rotation
    key_cache: RwLock<HashMap<(u64, [u8; SALT_LEN]), [u8; KEY_LEN]>>,
    audit: SharedAudit,
}

impl SecretsManager {
    /// Validate the configuration and build a manager.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::InvalidMasterKey`] for malformed or too-short
    /// keys and [`SecretsError::InsufficientIterations`] below the floor.
    pub fn new(config: SecretsConfig, audit: SharedAudit) -> Result<Self, SecretsError> {
        if config.iterations < MIN_ITERATIONS {
            return Err(SecretsError::InsufficientIterations(config.iterations));
        }
        let base_key = BASE64
            .decode(config.master_key.trim())
            .map_err(|e| SecretsError::InvalidMasterKey(format!("not valid base64: {e}")))?;
        if base_key.len() < KEY_LEN {
            return Err(SecretsError::InvalidMasterKey(format!(
                "decodes to {} bytes, need at least {KEY_LEN}",
                base_key.len()
            )));
        }

        Ok(Self {
            base_key,
            iterations: config.iterations,
            key_cache: RwLock::new(HashMap::new()),
            audit,
        })
    }

    /// Generate a fresh master key: 32 random bytes, base64-encoded.
    pub fn generate_master_key() -> String {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }

    /// Reject keys unfit for production: placeholders and short keys.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::InvalidMasterKey`] describing the defect.
    pub fn validate_master_key(master_key: &str) -> Result<(), SecretsError> {
        let lowered = master_key.to_lowercase();
        for placeholder in PLACEHOLDER_KEYS {
            if lowered.contains(placeholder) {
                return Err(SecretsError::InvalidMasterKey(format!(
                    "contains placeholder '{placeholder}'"
                )));
            }
        }
        let decoded = BASE64
            .decode(master_key.trim())
            .map_err(|e| SecretsError::InvalidMasterKey(format!("not valid base64: {e}")))?;
        if decoded.len() < KEY_LEN {
            return Err(SecretsError::InvalidMasterKey(format!(
                "decodes to {} bytes, need at least {KEY_LEN}",
                decoded.len()
            )));
        }
        Ok(())
    }

    /// Encrypt `plaintext` for `user_id` under a fresh salt.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::EncryptionFailed`] when the cipher rejects
    /// the input.
    pub fn encrypt(&self, user_id: u64, plaintext: &[u8]) -> Result<EncryptedSecret, SecretsError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let key = self.derive_key(user_id, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let body = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecretsError::EncryptionFailed)?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + body.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&body);

        Ok(EncryptedSecret {
            ciphertext: BASE64.encode(&ciphertext),
            salt: BASE64.encode(salt),
            key_fingerprint: fingerprint_of(&key),
        })
    }

    /// Decrypt a blob for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::DecryptionFailed`] for every failure mode.
    pub fn decrypt(
        &self,
        user_id: u64,
        ciphertext_b64: &str,
        salt_b64: &str,
    ) -> Result<Vec<u8>, SecretsError> {
        let result = self.try_decrypt(user_id, ciphertext_b64, salt_b64);
        if result.is_err() {
            self.audit.record(
                SecurityEvent::new("secret_decrypt_failed", Severity::Warning, user_id.to_string())
                    .with_risk(40),
            );
        }
        result
    }

    fn try_decrypt(
        &self,
        user_id: u64,
        ciphertext_b64: &str,
        salt_b64: &str,
    ) -> Result<Vec<u8>, SecretsError> {
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|_| SecretsError::DecryptionFailed)?;
        let salt_vec = BASE64
            .decode(salt_b64)
            .map_err(|_| SecretsError::DecryptionFailed)?;
        let salt: [u8; SALT_LEN] = salt_vec
            .try_into()
            .map_err(|_| SecretsError::DecryptionFailed)?;
        if ciphertext.len() < NONCE_LEN {
            return Err(SecretsError::DecryptionFailed);
        }

        let key = self.derive_key(user_id, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SecretsError::DecryptionFailed)
    }

    /// Whether a stored fingerprint matches the key this manager would
    /// derive for `(user_id, salt)` — i.e. whether the blob was produced
    /// under the current base key.
    pub fn validate_key_fingerprint(&self, user_id: u64, salt_b64: &str, fingerprint: &str) -> bool {
        let Ok(salt_vec) = BASE64.decode(salt_b64) else {
            return false;
        };
        let Ok(salt) = <[u8; SALT_LEN]>::try_from(salt_vec) else {
            return false;
        };
        let key = self.derive_key(user_id, &salt);
        fingerprint_of(&key) == fingerprint
    }

    /// Serialize `value` as JSON and encrypt it.
    pub fn encrypt_json<T: Serialize>(
        &self,
        user_id: u64,
        value: &T,
    ) -> Result<EncryptedSecret, SecretsError> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt(user_id, &plaintext)
    }

    /// Decrypt and deserialize a JSON payload.
    pub fn decrypt_json<T: for<'de> Deserialize<'de>>(
        &self,
        user_id: u64,
        ciphertext_b64: &str,
        salt_b64: &str,
    ) -> Result<T, SecretsError> {
        let plaintext = self.decrypt(user_id, ciphertext_b64, salt_b64)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Swap the base key and wipe every cached derived key.
    pub fn rotate_base_key(&mut self, config: SecretsConfig) -> Result<(), SecretsError> {
        let replacement = Self::new(config, std::sync::Arc::clone(&self.audit))?;
        self.base_key = replacement.base_key;
        self.iterations = replacement.iterations;
        self.key_cache.write().clear();
        debug!("base key rotated, key cache wiped");
        Ok(())
    }

    fn derive_key(&self, user_id: u64, salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
        if let Some(key) = self.key_cache.read().get(&(user_id, *salt)) {
            return *key;
        }

        let mut password = self.base_key.clone();
        password.extend_from_slice(format!("user:{user_id}").as_bytes());

        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(&password, salt, self.iterations, &mut key);

        let mut cache = self.key_cache.write();
        if cache.len() >= KEY_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert((user_id, *salt), key);
        key
    }
}

fn fingerprint_of(key: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(key);
    BASE64.encode(&digest[..FINGERPRINT_LEN])
}

/// In-memory blob store with per-owner name uniqueness, the contract the
/// persistence layer implements.
#[derive(Default)]
pub struct SecretStore {
    blobs: DashMap<(u64, String), SecretBlob>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new blob.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::Conflict`] when the owner already has a
    /// secret under this name.
    pub fn store(&self, blob: SecretBlob) -> Result<(), SecretsError> {
        let key = (blob.owner_id, blob.name.clone());
        match self.blobs.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SecretsError::Conflict(blob.name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(blob);
                Ok(())
            }
        }
    }

    /// Replace an existing blob, refreshing `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::NotFound`] when the secret does not exist.
    pub fn update(&self, mut blob: SecretBlob) -> Result<(), SecretsError> {
        let key = (blob.owner_id, blob.name.clone());
        match self.blobs.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                blob.updated_at = Utc::now();
                slot.insert(blob);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(SecretsError::NotFound(blob.name)),
        }
    }

    pub fn get(&self, owner_id: u64, name: &str) -> Option<SecretBlob> {
        self.blobs
            .get(&(owner_id, name.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn delete(&self, owner_id: u64, name: &str) -> bool {
        self.blobs.remove(&(owner_id, name.to_string())).is_some()
    }

    /// Schedule a rotation deadline for one secret.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::NotFound`] when the secret does not exist.
    pub fn schedule_rotation(
        &self,
        owner_id: u64,
        name: &str,
        due: DateTime<Utc>,
    ) -> Result<(), SecretsError> {
        match self.blobs.get_mut(&(owner_id, name.to_string())) {
            Some(mut entry) => {
                entry.value_mut().rotation_due = Some(due);
                Ok(())
            }
            None => Err(SecretsError::NotFound(name.to_string())),
        }
    }

    /// Blobs whose rotation deadline has passed, for the rotation sweep.
    pub fn due_for_rotation(&self, now: DateTime<Utc>) -> Vec<(u64, String)> {
        let mut due: Vec<_> = self
            .blobs
            .iter()
            .filter(|entry| entry.value().rotation_due.is_some_and(|at| at <= now))
            .map(|entry| (entry.key().0, entry.key().1.clone()))
            .collect();
        due.sort();
        due
    }

    /// Names of every secret the owner holds, sorted.
    pub fn list(&self, owner_id: u64) -> Vec<String> {
        let mut names: Vec<_> = self
            .blobs
            .iter()
            .filter(|entry| entry.key().0 == owner_id)
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit;

    fn manager() -> SecretsManager {
        let config = SecretsConfig {
            master_key: SecretsManager::generate_master_key(),
            iterations: MIN_ITERATIONS,
        };
        SecretsManager::new(config, audit::noop()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let manager = manager();
        let secret = manager.encrypt(7, b"hunter2").unwrap();
        let plaintext = manager.decrypt(7, &secret.ciphertext, &secret.salt).unwrap();
        assert_eq!(plaintext, b"hunter2");
    }

    #[test]
    fn test_cross_user_decryption_fails() {
        let manager = manager();
        let secret = manager.encrypt(7, b"hunter2").unwrap();
        let err = manager
            .decrypt(8, &secret.ciphertext, &secret.salt)
            .unwrap_err();
        assert!(matches!(err, SecretsError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let manager = manager();
        let secret = manager.encrypt(7, b"hunter2").unwrap();

        let mut raw = BASE64.decode(&secret.ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(&raw);

        assert!(matches!(
            manager.decrypt(7, &tampered, &secret.salt),
            Err(SecretsError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_salt_fails() {
        let manager = manager();
        let secret = manager.encrypt(7, b"hunter2").unwrap();

        let mut salt = BASE64.decode(&secret.salt).unwrap();
        salt[0] ^= 0x01;
        let tampered = BASE64.encode(&salt);

        assert!(matches!(
            manager.decrypt(7, &secret.ciphertext, &tampered),
            Err(SecretsError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_fingerprint_deterministic_and_plaintext_independent() {
        let manager = manager();
        let a = manager.encrypt(7, b"first payload").unwrap();
        let b = manager.encrypt(7, b"completely different").unwrap();

        // Distinct salts give distinct fingerprints, but re-deriving with a
        // stored salt always reproduces the stored fingerprint.
        assert!(manager.validate_key_fingerprint(7, &a.salt, &a.key_fingerprint));
        assert!(manager.validate_key_fingerprint(7, &b.salt, &b.key_fingerprint));
        assert!(!manager.validate_key_fingerprint(8, &a.salt, &a.key_fingerprint));
    }

    #[test]
    fn test_rotation_invalidates_fingerprint_and_blobs() {
        let config_one = SecretsConfig {
            master_key: SecretsManager::generate_master_key(),
            iterations: MIN_ITERATIONS,
        };
        let manager_one = SecretsManager::new(config_one, audit::noop()).unwrap();
        let secret = manager_one.encrypt(7, b"hunter2").unwrap();

        let config_two = SecretsConfig {
            master_key: SecretsManager::generate_master_key(),
            iterations: MIN_ITERATIONS,
        };
        let manager_two = SecretsManager::new(config_two, audit::noop()).unwrap();

        assert!(!manager_two.validate_key_fingerprint(7, &secret.salt, &secret.key_fingerprint));
        assert!(matches!(
            manager_two.decrypt(7, &secret.ciphertext, &secret.salt),
            Err(SecretsError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_salts_are_unique_per_blob() {
        let manager = manager();
        let a = manager.encrypt(7, b"same").unwrap();
        let b = manager.encrypt(7, b"same").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_json_round_trip() {
        let manager = manager();
        let value = serde_json::json!({"token": "abc", "port": 5432});
        let secret = manager.encrypt_json(3, &value).unwrap();
        let decrypted: serde_json::Value = manager
            .decrypt_json(3, &secret.ciphertext, &secret.salt)
            .unwrap();
        assert_eq!(decrypted, value);
    }

    #[test]
    fn test_master_key_validation() {
        assert!(SecretsManager::validate_master_key(&SecretsManager::generate_master_key()).is_ok());
        assert!(SecretsManager::validate_master_key("changeme-changeme-changeme").is_err());
        assert!(SecretsManager::validate_master_key("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_iteration_floor() {
        let config = SecretsConfig {
            master_key: SecretsManager::generate_master_key(),
            iterations: 50_000,
        };
        assert!(matches!(
            SecretsManager::new(config, audit::noop()),
            Err(SecretsError::InsufficientIterations(50_000))
        ));
    }

    #[test]
    fn test_store_conflict_on_duplicate_name() {
        let store = SecretStore::new();
        let manager = manager();
        let payload = manager.encrypt(1, b"v").unwrap();
        let blob = SecretBlob {
            owner_id: 1,
            name: "deploy-token".to_string(),
            secret_type: "api_key".to_string(),
            payload,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            rotation_due: None,
        };

        store.store(blob.clone()).unwrap();
        assert!(matches!(
            store.store(blob),
            Err(SecretsError::Conflict(name)) if name == "deploy-token"
        ));
        assert_eq!(store.list(1), vec!["deploy-token"]);
        assert!(store.delete(1, "deploy-token"));
        assert!(!store.delete(1, "deploy-token"));
    }

    #[test]
    fn test_rotation_scheduling() {
        let store = SecretStore::new();
        let manager = manager();
        let payload = manager.encrypt(1, b"v").unwrap();
        store
            .store(SecretBlob {
                owner_id: 1,
                name: "db-password".to_string(),
                secret_type: "database_password".to_string(),
                payload,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                rotation_due: None,
            })
            .unwrap();

        assert!(store.due_for_rotation(Utc::now()).is_empty());

        let past = Utc::now() - chrono::Duration::days(1);
        store.schedule_rotation(1, "db-password", past).unwrap();
        assert_eq!(
            store.due_for_rotation(Utc::now()),
            vec![(1, "db-password".to_string())]
        );

        assert!(matches!(
            store.schedule_rotation(1, "ghost", past),
            Err(SecretsError::NotFound(_))
        ));
    }
}
