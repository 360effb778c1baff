//! Bounded operations, domain services and their managed lifecycle.
//!
//! 1. **Execution** (`executor`, `operation`): every store call and password
//!    hash runs under a deadline and yields exactly one [`Outcome`]
//! 2. **Domain services** (`domain`): auth, user, post and media
//! 3. **Outbox relays** (`outbox`): publish events committed with store writes
//! 4. **Consumers** (`consumer`): run an event adapter for the process lifetime
//! 5. **Lifecycle** (`registry`): ordered init and reverse shutdown

pub mod config;
pub mod consumer;
pub mod domain;
pub mod executor;
pub mod operation;
pub mod outbox;
pub mod registry;

pub use config::ServiceConfig;
pub use consumer::ConsumerService;
pub use domain::{
    Argon2Hasher, AuthService, DomainServices, MediaService, PasswordHasher, PostService,
    UserService,
};
pub use executor::BoundedExecutor;
pub use operation::{DeadlineExceeded, ErrorKind, Outcome, ServiceError};
pub use outbox::{OutboxRelay, OutboxRelayService, RelayError};
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
