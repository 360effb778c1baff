//! User profiles, materialized from `user.created` events.

use std::sync::Arc;

use socialstream_core::UserCreated;
use tracing::{debug, info};

use crate::broker::{HandlerError, RoutingTable};
use crate::service::config::ServiceConfig;
use crate::service::executor::BoundedExecutor;
use crate::service::operation::ServiceError;
use crate::storage::{NewUserProfile, UserProfile, UserStore};

pub struct UserService {
    store: Arc<dyn UserStore>,
    executor: BoundedExecutor,
    config: Arc<ServiceConfig>,
}

impl UserService {
    #[must_use]
    pub fn new(
        store: Arc<dyn UserStore>,
        executor: BoundedExecutor,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Creates the profile described by `event`.
    ///
    /// A profile that already exists is treated as applied, so redelivered
    /// events are harmless.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DeadlineExceeded`] or [`ServiceError::Internal`]
    /// if the store call times out or fails.
    pub async fn create_profile(&self, event: UserCreated) -> Result<(), ServiceError> {
        let store = Arc::clone(&self.store);
        let username = event.username.clone();
        let profile = NewUserProfile {
            username: event.username,
            email: event.email,
            first_name: event.first_name,
            last_name: event.last_name,
            dob: event.dob,
        };
        let outcome = self
            .executor
            .execute("user.insert_profile", self.config.store_deadline, move |_| async move {
                store.insert_profile(profile).await
            })
            .await
            .into_result();

        match outcome {
            Ok(stored) => {
                info!(user_id = stored.id, username = %stored.username, "profile created");
                Ok(())
            }
            Err(ServiceError::Conflict(_)) => {
                debug!(%username, "profile already exists");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if no profile has `username`.
    pub async fn get_profile(&self, username: &str) -> Result<UserProfile, ServiceError> {
        let store = Arc::clone(&self.store);
        let key = username.to_string();
        self.executor
            .execute("user.profile_by_username", self.config.store_deadline, move |_| async move {
                store.profile_by_username(&key).await
            })
            .await
            .into_result()?
            .ok_or_else(|| ServiceError::NotFound(format!("user {username}")))
    }

    /// Handlers for the user consumer.
    #[must_use]
    pub fn routing_table(self: &Arc<Self>) -> RoutingTable {
        let service = Arc::clone(self);
        RoutingTable::builder()
            .on::<UserCreated, _, _>(move |event| {
                let service = Arc::clone(&service);
                async move { service.create_profile(event).await.map_err(HandlerError::from) }
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use socialstream_core::{ContentType, EventMessage, RoutingKey};

    use super::*;
    use crate::storage::MemoryStore;

    fn alice() -> UserCreated {
        UserCreated {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Liddell".to_string(),
            dob: "1990-01-01".to_string(),
        }
    }

    fn service() -> Arc<UserService> {
        Arc::new(UserService::new(
            Arc::new(MemoryStore::new()),
            BoundedExecutor::new(8),
            Arc::new(ServiceConfig::default()),
        ))
    }

    #[tokio::test]
    async fn create_profile_is_idempotent() {
        let users = service();
        users.create_profile(alice()).await.unwrap();
        users.create_profile(alice()).await.unwrap();

        let profile = users.get_profile("alice").await.unwrap();
        assert_eq!(profile.first_name, "Alice");
        assert_eq!(profile.dob, "1990-01-01");
    }

    #[tokio::test]
    async fn unknown_username_is_not_found() {
        let err = service().get_profile("nobody").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(what) if what == "user nobody"));
    }

    #[tokio::test]
    async fn routing_table_applies_user_created() {
        let users = service();
        let table = users.routing_table();
        let message = EventMessage::from_payload(&alice(), ContentType::Json).unwrap();

        let (handler, matched) = table.resolve(&message.routing_key);
        assert!(matched);
        handler.handle(&message).await.unwrap();
        assert_eq!(users.get_profile("alice").await.unwrap().username, "alice");

        let (_, matched) = table.resolve(&RoutingKey::new("user.deleted").unwrap());
        assert!(!matched);
    }

    #[tokio::test]
    async fn routing_table_reports_malformed_payload() {
        let table = service().routing_table();
        let mut message = EventMessage::from_payload(&alice(), ContentType::Json).unwrap();
        message.payload.truncate(10);

        let (handler, _) = table.resolve(&message.routing_key);
        let err = handler.handle(&message).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }
}
