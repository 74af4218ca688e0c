//! spacegrid-core — shared types and configuration for SpaceGrid.
//!
//! Every other crate in the workspace depends on this one for the id
//! aliases, the request/response shapes handed to package scripts, the
//! deferred parameter bag used by capabilities, `spacegrid.toml`, and the
//! small outbound HTTP client used for webhooks and package downloads.

pub mod config;
pub mod net;
pub mod runtime;
pub mod source;
pub mod types;

pub use config::SpaceGridConfig;
pub use runtime::{EventInvocation, ExecuteOptions, Runtime, UnconfiguredRuntime};
pub use source::PackageSource;
pub use types::*;
