//! Registration and login.

use std::sync::Arc;

use serde::Deserialize;
use socialstream_core::{EventMessage, UserCreated};
use tracing::info;

use super::{require, PasswordHasher};
use crate::service::config::ServiceConfig;
use crate::service::executor::BoundedExecutor;
use crate::service::operation::ServiceError;
use crate::storage::{CredentialStore, NewCredentials};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Owns credentials and publishes `user.created` on registration.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    hasher: Arc<dyn PasswordHasher>,
    executor: BoundedExecutor,
    config: Arc<ServiceConfig>,
}

impl AuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        hasher: Arc<dyn PasswordHasher>,
        executor: BoundedExecutor,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            hasher,
            executor,
            config,
        }
    }

    /// Registers a user and returns the new user id.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Validation`] if a field is blank
    /// - [`ServiceError::Conflict`] if the username or email is taken
    /// - [`ServiceError::DeadlineExceeded`] if hashing or the insert times out
    pub async fn register(
        &self,
        request: RegisterRequest,
        correlation_id: Option<&str>,
    ) -> Result<i64, ServiceError> {
        require("email", &request.email)?;
        require("password", &request.password)?;
        require("username", &request.username)?;
        require("firstName", &request.first_name)?;
        require("lastName", &request.last_name)?;
        require("dob", &request.dob)?;

        let hasher = Arc::clone(&self.hasher);
        let password = request.password;
        let password_hash = self
            .executor
            .execute_blocking("auth.hash_password", self.config.hash_deadline, move |_| {
                hasher.hash(&password)
            })
            .await
            .into_result()?;

        let event = UserCreated {
            username: request.username.clone(),
            email: request.email.clone(),
            first_name: request.first_name,
            last_name: request.last_name,
            dob: request.dob,
        };
        let mut message =
            EventMessage::from_payload(&event, self.config.content_type)?.with_source("auth");
        if let Some(id) = correlation_id {
            message = message.with_correlation_id(id);
        }

        let store = Arc::clone(&self.store);
        let credentials = NewCredentials {
            username: request.username,
            email: request.email,
            password_hash,
        };
        let stored = self
            .executor
            .execute("auth.insert_credentials", self.config.store_deadline, move |_| async move {
                store.insert_credentials(credentials, vec![message]).await
            })
            .await
            .into_result()?;

        info!(user_id = stored.user_id, username = %stored.username, "user registered");
        Ok(stored.user_id)
    }

    /// Verifies credentials and returns the user id.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Unauthorized`] for an unknown email or wrong password
    /// - [`ServiceError::DeadlineExceeded`] if the lookup or verification times out
    pub async fn login(&self, request: LoginRequest) -> Result<i64, ServiceError> {
        require("email", &request.email)?;
        require("password", &request.password)?;

        let store = Arc::clone(&self.store);
        let email = request.email;
        let credentials = self
            .executor
            .execute("auth.credentials_by_email", self.config.store_deadline, move |_| async move {
                store.credentials_by_email(&email).await
            })
            .await
            .into_result()?
            .ok_or(ServiceError::Unauthorized)?;

        let hasher = Arc::clone(&self.hasher);
        let password = request.password;
        let hash = credentials.password_hash;
        let verified = self
            .executor
            .execute_blocking("auth.verify_password", self.config.hash_deadline, move |_| {
                hasher.verify(&password, &hash)
            })
            .await
            .into_result()?;

        if verified {
            Ok(credentials.user_id)
        } else {
            Err(ServiceError::Unauthorized)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::service::domain::testing::PlainHasher;
    use crate::storage::{MemoryStore, OutboxStore};

    fn request(username: &str, email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: "hunter2".to_string(),
            username: username.to_string(),
            first_name: "Alice".to_string(),
            last_name: "Liddell".to_string(),
            dob: "1990-01-01".to_string(),
        }
    }

    fn service(store: Arc<MemoryStore>, hasher: Arc<dyn PasswordHasher>) -> AuthService {
        AuthService::new(
            store,
            hasher,
            BoundedExecutor::new(8),
            Arc::new(ServiceConfig::default()),
        )
    }

    #[tokio::test]
    async fn register_stores_credentials_and_outbox_event() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone(), Arc::new(PlainHasher));

        let user_id = auth
            .register(request("alice", "alice@example.com"), Some("req-1"))
            .await
            .unwrap();
        assert_eq!(user_id, 1);

        let pending = store.pending_events(10, 5).await.unwrap();
        assert_eq!(pending.len(), 1);
        let message = &pending[0].message;
        assert_eq!(message.routing_key.as_str(), "user.created");
        assert_eq!(message.source.as_deref(), Some("auth"));
        assert_eq!(message.correlation_id.as_deref(), Some("req-1"));
        let event: UserCreated = message.decode().unwrap();
        assert_eq!(event.username, "alice");
        assert_eq!(event.first_name, "Alice");
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict_without_event() {
        let store = Arc::new(MemoryStore::new());
        let auth = service(store.clone(), Arc::new(PlainHasher));
        auth.register(request("alice", "alice@example.com"), None)
            .await
            .unwrap();

        let err = auth
            .register(request("alice", "other@example.com"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(store.outbox_len(), 1);
    }

    #[tokio::test]
    async fn blank_field_is_rejected_before_hashing() {
        let auth = service(Arc::new(MemoryStore::new()), Arc::new(PlainHasher));
        let err = auth
            .register(request("", "alice@example.com"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(field) if field == "username is required"));
    }

    #[tokio::test]
    async fn login_checks_email_and_password() {
        let auth = service(Arc::new(MemoryStore::new()), Arc::new(PlainHasher));
        let user_id = auth
            .register(request("alice", "alice@example.com"), None)
            .await
            .unwrap();

        let ok = auth
            .login(LoginRequest {
                email: "alice@example.com".to_string(),
                password: "hunter2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(ok, user_id);

        for (email, password) in [("alice@example.com", "wrong"), ("bob@example.com", "hunter2")] {
            let err = auth
                .login(LoginRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Unauthorized));
        }
    }

    struct SlowHasher;

    impl PasswordHasher for SlowHasher {
        fn hash(&self, password: &str) -> anyhow::Result<String> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(password.to_string())
        }

        fn verify(&self, _password: &str, _hash: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn slow_hash_exceeds_deadline_and_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let auth = AuthService::new(
            store.clone(),
            Arc::new(SlowHasher),
            BoundedExecutor::new(8),
            Arc::new(ServiceConfig {
                hash_deadline: Duration::from_millis(20),
                ..ServiceConfig::default()
            }),
        );

        let err = auth
            .register(request("alice", "alice@example.com"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::DeadlineExceeded(elapsed) if elapsed.operation == "auth.hash_password"
        ));
        assert_eq!(store.outbox_len(), 0);
    }
}
