use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::sync::OnceLock;

/// Newtype for secrets (passwords, client secrets, session material) so
/// they never end up in a `Debug` log line.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Newtype for a PHC-formatted argon2 hash
#[derive(Debug, Clone)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Hash a secret using Argon2id with a fresh random salt.
pub fn hash_password(password: &Password) -> Result<PasswordHashString, anyhow::Error> {
    let argon2 = Argon2::default();
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = argon2
        .hash_password(password.as_str().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();

    Ok(PasswordHashString::new(password_hash))
}

/// Verify a secret against a stored hash. Comparison is constant-time.
pub fn verify_password(
    password: &Password,
    password_hash: &PasswordHashString,
) -> Result<(), anyhow::Error> {
    let parsed_hash = PasswordHash::new(password_hash.as_str())
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))?;

    Argon2::default()
        .verify_password(password.as_str().as_bytes(), &parsed_hash)
        .map_err(|_| anyhow::anyhow!("Password verification failed"))
}

/// Burn the same CPU as a real verification. Called when the account or
/// client does not exist so response timing does not reveal which.
pub fn dummy_verify(password: &Password) {
    static DUMMY_HASH: OnceLock<Option<PasswordHashString>> = OnceLock::new();

    let hash = DUMMY_HASH.get_or_init(|| hash_password(&Password::new("orbit-dummy-secret")).ok());
    if let Some(hash) = hash {
        let _ = verify_password(password, hash);
    }
}

/// Argon2 hashing is CPU-bound; run it off the async workers.
pub async fn hash_password_blocking(password: Password) -> Result<PasswordHashString, anyhow::Error> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| anyhow::anyhow!("Hashing task failed: {}", e))?
}

/// Blocking-pool counterpart of [`verify_password`]. `None` runs [`dummy_verify`].
pub async fn verify_password_blocking(
    password: Password,
    password_hash: Option<PasswordHashString>,
) -> Result<bool, anyhow::Error> {
    tokio::task::spawn_blocking(move || match password_hash {
        Some(hash) => verify_password(&password, &hash).is_ok(),
        None => {
            dummy_verify(&password);
            false
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("Verification task failed: {}", e))
}
