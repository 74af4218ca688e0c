//! SpaceGrid capability layer.
//!
//! Capabilities are named, pluggable features enabled per space. Socket
//! capabilities multiplex WebSocket connections through per-instance
//! [`Room`]s, each driven by a single event loop task.
//!
//! # Components
//!
//! - **`registry`** — `LazyRegistry`, double-checked memoization by key
//! - **`room`** — `Room` and `Session`, the per-instance multiplexer
//! - **`sockd`** — `HigherSockd`, rooms by key plus idle eviction
//! - **`hub`** — `CapabilityRegistry` and `CapabilityHub`
//! - **`addon`** — `AddOnRegistry` and `AddOnHub`, install-scoped add-ons
//! - **`builtin`** — the `sockd` and `kv` capabilities

pub mod addon;
pub mod builtin;
pub mod error;
pub mod hub;
pub mod registry;
pub mod room;
pub mod sockd;

pub use addon::{AddOn, AddOnContext, AddOnHub, AddOnRegistry};
pub use error::{CapabilityError, CapabilityResult};
pub use hub::{Capability, CapabilityContext, CapabilityHub, CapabilityRegistry};
pub use registry::LazyRegistry;
pub use room::{Room, RoomLease, Session, SocketConn};
pub use sockd::HigherSockd;
