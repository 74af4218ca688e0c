//! spacegrid-engine — the SpaceGrid composition root.
//!
//! Wires the routing index, its reconciler, the capability and add-on
//! hubs, the room multiplexer, and the event hub around one
//! `StateStore` and one script `Runtime`.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── IndexSync ── RoutingIndex (namespace → space entry)
//!   ├── CapabilityHub ── HigherSockd ── Room per capability instance
//!   ├── AddOnHub (kv, events)
//!   ├── EventHub (active index, event/target workers, sweeper)
//!   └── installer (zip package → package version + install)
//! ```

pub mod addons;
pub mod engine;
pub mod error;
pub mod installer;

pub use addons::EventsAddOn;
pub use engine::{Engine, SpaceSpec, SubscriptionSpec};
pub use error::{EngineError, EngineResult};
pub use installer::{PackageBundle, read_package};
