//! spacegrid-state — embedded state store for SpaceGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for packages, installs, spaces, capabilities, tenant KV, event
//! subscriptions, and the event/target queue.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{install_id}/{id}`, `{event_id:019}/{target_id:019}`)
//! enable prefix scans for related records. Numeric ids are allocated from
//! the `counters` table inside the same write transaction as the insert.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
