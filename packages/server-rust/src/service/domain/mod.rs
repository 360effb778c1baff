//! Domain services.
//!
//! Each service owns one store and runs every store call (and every password
//! hash) through the shared [`BoundedExecutor`](crate::service::BoundedExecutor).
//! State-changing calls hand their outbox events to the store in the same
//! call, so an event is recorded if and only if the write commits.

pub mod auth;
pub mod media;
pub mod post;
pub mod user;

use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{self, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::Argon2;

pub use auth::{AuthService, LoginRequest, RegisterRequest};
pub use media::MediaService;
pub use post::{CreatePostRequest, PostService};
pub use user::UserService;

use crate::service::operation::ServiceError;

/// Services hosted by this process; `None` for roles not running here.
#[derive(Clone, Default)]
pub struct DomainServices {
    pub auth: Option<Arc<AuthService>>,
    pub user: Option<Arc<UserService>>,
    pub post: Option<Arc<PostService>>,
    pub media: Option<Arc<MediaService>>,
}

/// Fails with [`ServiceError::Validation`] if `value` is blank.
pub(crate) fn require(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        Err(ServiceError::Validation(format!("{field} is required")))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Synchronous, CPU-bound password hashing. Called on the blocking pool.
pub trait PasswordHasher: Send + Sync {
    /// Returns a self-describing hash string of `password`.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing fails.
    fn hash(&self, password: &str) -> anyhow::Result<String>;

    /// Returns `true` if `password` matches `hash`.
    ///
    /// # Errors
    ///
    /// Returns an error if `hash` is not a valid hash string.
    fn verify(&self, password: &str, hash: &str) -> anyhow::Result<bool>;
}

/// Argon2id with the crate's default parameters.
#[derive(Default)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("hashing password: {e}"))?;
        Ok(hash.to_string())
    }

    fn verify(&self, password: &str, hash: &str) -> anyhow::Result<bool> {
        let parsed =
            PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("stored hash is invalid: {e}"))?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(anyhow::anyhow!("verifying password: {e}")),
        }
    }
}
