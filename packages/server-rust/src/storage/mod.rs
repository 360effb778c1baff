//! Backing-store capability for the domain services.
//!
//! Each service owns its own tables, reached through the narrow traits in
//! [`store`]. Every write method takes the outbox events describing the
//! change and persists them in the same transaction as the record, so an
//! event is published if and only if its record was committed.
//!
//! Backends:
//!
//! - [`MemoryStore`]: a single-process store for development and tests
//! - `PgStore` (feature `postgres`): PostgreSQL via `sqlx`

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod records;
pub mod store;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use records::*;
pub use store::*;
