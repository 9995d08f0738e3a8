//! Password hashing with Argon2id
//!
//! Hashing is deliberately slow, so the async entry points move the work onto
//! the blocking pool.

use argon2::{
    password_hash::{
        rand_core::{OsRng, RngCore},
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::error::{ApiError, ApiResult};

pub const MIN_PASSWORD_LENGTH: usize = 8;
/// Longer inputs are rejected rather than silently truncated
pub const MAX_PASSWORD_LENGTH: usize = 72;

#[derive(Debug, Clone)]
pub struct Argon2Hasher {
    params: Params,
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Argon2Hasher {
    /// Hasher with the argon2 crate's recommended parameters
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// Hasher with explicit cost parameters (memory in KiB)
    pub fn with_cost(memory_kib: u32, iterations: u32, parallelism: u32) -> ApiResult<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| ApiError::Internal(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash on the calling thread
    pub fn hash_blocking(&self, plaintext: &str) -> ApiResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ApiError::Internal(format!("failed to hash password: {e}")))
    }

    /// Verify on the calling thread. A malformed digest never matches.
    pub fn verify_blocking(&self, plaintext: &str, digest: &str) -> bool {
        let parsed = match PasswordHash::new(digest) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Stored password hash is malformed");
                return false;
            }
        };
        self.argon2()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }

    pub async fn hash(&self, plaintext: &str) -> ApiResult<String> {
        let hasher = self.clone();
        let plaintext = plaintext.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash_blocking(&plaintext))
            .await
            .map_err(|e| ApiError::Internal(format!("hashing task failed: {e}")))?
    }

    pub async fn verify(&self, plaintext: &str, digest: &str) -> ApiResult<bool> {
        let hasher = self.clone();
        let plaintext = plaintext.to_owned();
        let digest = digest.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify_blocking(&plaintext, &digest))
            .await
            .map_err(|e| ApiError::Internal(format!("verification task failed: {e}")))
    }

    /// A well-formed hash of random bytes that no password will ever match.
    /// Verifying against it costs the same as a real check, which keeps
    /// unknown-account logins indistinguishable by timing.
    pub fn generate_impossible_hash(&self) -> ApiResult<String> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(&secret, &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ApiError::Internal(format!("failed to build placeholder hash: {e}")))
    }
}

/// Registration password policy: 8..=72 characters with at least one
/// uppercase letter, one lowercase letter and one digit.
pub fn validate_password_strength(password: &str) -> Result<(), String> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        ));
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(format!(
            "Password must be at most {MAX_PASSWORD_LENGTH} characters"
        ));
    }

    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_lower && has_upper && has_digit) {
        return Err("Password must include uppercase, lowercase and number".to_string());
    }

    Ok(())
}
