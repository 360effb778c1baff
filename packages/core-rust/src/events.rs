//! Event payload schemas shared by publishers and consumers.
//!
//! Each payload type is bound to the exchange it is published on and the
//! routing key that identifies it. Field names follow the established wire
//! format, so user and post events are camelCase while media events keep
//! their snake_case `compressed_id`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::routing::RoutingKey;

/// Exchange names, one topic exchange per entity category.
pub mod exchanges {
    pub const USER_EVENTS: &str = "user_events";
    pub const POST_EVENTS: &str = "post_events";
    pub const MEDIA_EVENTS: &str = "media_events";

    /// All exchanges the services publish to or consume from.
    pub const ALL: [&str; 3] = [USER_EVENTS, POST_EVENTS, MEDIA_EVENTS];
}

/// Routing keys in `{entity}.{verb}` form.
pub mod keys {
    pub const USER_CREATED: &str = "user.created";
    pub const POST_CREATED: &str = "post.created";
    pub const MEDIA_UPLOADED: &str = "media.uploaded";
    pub const MEDIA_COMPRESSED: &str = "media.compressed";
}

/// A typed event payload with a fixed exchange and routing key.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Exchange the event is published on.
    const EXCHANGE: &'static str;
    /// Routing key identifying the event.
    const ROUTING_KEY: &'static str;

    /// Returns the routing key as a validated [`RoutingKey`].
    ///
    /// # Panics
    ///
    /// Panics if `ROUTING_KEY` is not a valid routing key.
    #[must_use]
    fn routing_key() -> RoutingKey {
        RoutingKey::new(Self::ROUTING_KEY).expect("ROUTING_KEY must be a valid routing key")
    }
}

/// Published by the auth service after a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreated {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: String,
}

impl EventPayload for UserCreated {
    const EXCHANGE: &'static str = exchanges::USER_EVENTS;
    const ROUTING_KEY: &'static str = keys::USER_CREATED;
}

/// Published by the post service after a post is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreated {
    pub post_id: String,
    pub owner_id: i64,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

impl EventPayload for PostCreated {
    const EXCHANGE: &'static str = exchanges::POST_EVENTS;
    const ROUTING_KEY: &'static str = keys::POST_CREATED;
}

/// Published by the media service when an upload is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUploaded {
    pub id: String,
    pub compressed_id: String,
}

impl EventPayload for MediaUploaded {
    const EXCHANGE: &'static str = exchanges::MEDIA_EVENTS;
    const ROUTING_KEY: &'static str = keys::MEDIA_UPLOADED;
}

/// Published by the compression worker once a compressed copy exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCompressed {
    pub id: String,
    pub compressed_id: String,
    pub status: String,
}

impl EventPayload for MediaCompressed {
    const EXCHANGE: &'static str = exchanges::MEDIA_EVENTS;
    const ROUTING_KEY: &'static str = keys::MEDIA_COMPRESSED;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_constants_are_valid() {
        assert_eq!(UserCreated::routing_key().as_str(), "user.created");
        assert_eq!(PostCreated::routing_key().as_str(), "post.created");
        assert_eq!(MediaUploaded::routing_key().as_str(), "media.uploaded");
        assert_eq!(MediaCompressed::routing_key().as_str(), "media.compressed");
    }

    #[test]
    fn user_created_uses_camel_case_wire_names() {
        let json = r#"{"username":"alice","email":"a@x","firstName":"A","lastName":"L","dob":"1990-01-01"}"#;
        let event: UserCreated = serde_json::from_str(json).unwrap();
        assert_eq!(event.first_name, "A");
        assert_eq!(event.last_name, "L");

        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("firstName").is_some());
        assert!(value.get("first_name").is_none());
    }

    #[test]
    fn media_compressed_keeps_snake_case_id() {
        let json = r#"{"id":"m1","compressed_id":"m1-c","status":"done"}"#;
        let event: MediaCompressed = serde_json::from_str(json).unwrap();
        assert_eq!(event.compressed_id, "m1-c");
    }

    #[test]
    fn post_created_omits_missing_media() {
        let event = PostCreated {
            post_id: "p-1".to_string(),
            owner_id: 1,
            body: "hello".to_string(),
            media_id: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("mediaId").is_none());
        assert_eq!(value["ownerId"], 1);
    }
}
