//! socialstream core: the event contract shared by publishing and consuming services.
//!
//! Routing keys and topic patterns, content-type tagged payload codecs, the
//! [`EventMessage`] envelope, and the typed event payload schemas.

pub mod codec;
pub mod events;
pub mod message;
pub mod routing;

pub use codec::{CodecError, ContentType};
pub use events::{
    exchanges, keys, EventPayload, MediaCompressed, MediaUploaded, PostCreated, UserCreated,
};
pub use message::{now_millis, EventMessage};
pub use routing::{RoutingError, RoutingKey, Segment, TopicPattern};

