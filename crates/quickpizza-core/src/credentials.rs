use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::Rng;

use crate::USER_TOKEN_LENGTH;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CredentialError {
    #[error("failed to compute password digest: {0}")]
    Digest(String),
    #[error("invalid password hashing parameters: {0}")]
    Params(String),
}

/// Password digests and session tokens, as consumed by the catalog.
///
/// Implementations must guarantee `verify(p, &digest(p)?)` for every `p`.
pub trait CredentialHelper: Send + Sync {
    /// # Errors
    /// Returns [`CredentialError::Digest`] when the digest cannot be computed.
    fn digest(&self, plaintext: &str) -> Result<String, CredentialError>;

    /// Malformed digests never verify.
    fn verify(&self, plaintext: &str, digest: &str) -> bool;

    /// Opaque token of [`USER_TOKEN_LENGTH`] alphanumeric characters.
    fn generate_token(&self) -> String;
}

/// Argon2id PHC digests with per-digest salts; tokens drawn from the OS CSPRNG.
#[derive(Debug, Clone)]
pub struct Argon2Credentials {
    hasher: Argon2<'static>,
}

impl Argon2Credentials {
    #[must_use]
    pub fn new() -> Self {
        Self { hasher: Argon2::default() }
    }

    /// Build with explicit cost parameters (memory in KiB, iterations, lanes).
    ///
    /// # Errors
    /// Returns [`CredentialError::Params`] when Argon2 rejects the parameters.
    pub fn with_params(
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    ) -> Result<Self, CredentialError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|err| CredentialError::Params(err.to_string()))?;
        Ok(Self { hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params) })
    }
}

impl Default for Argon2Credentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHelper for Argon2Credentials {
    fn digest(&self, plaintext: &str) -> Result<String, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        self.hasher
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| CredentialError::Digest(err.to_string()))
    }

    fn verify(&self, plaintext: &str, digest: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(digest) else {
            return false;
        };
        self.hasher.verify_password(plaintext.as_bytes(), &parsed).is_ok()
    }

    fn generate_token(&self) -> String {
        let mut rng = OsRng;
        (0..USER_TOKEN_LENGTH)
            .map(|_| char::from(TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())]))
            .collect()
    }
}
