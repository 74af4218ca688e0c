//! SpaceGrid routing — resolves namespace keys to installed spaces and
//! executes the matched route.
//!
//! # Components
//!
//! - **`index`** — `RoutingIndex`, the live namespace → space map
//! - **`matcher`** — structural path matching with `:param` segments
//! - **`template`** — package templates (minijinja) compiled at index build time
//! - **`dispatch`** — runs a request against one index entry
//! - **`sync`** — `IndexSync`, the reconciliation loop rebuilding the index

pub mod dispatch;
pub mod error;
pub mod index;
pub mod matcher;
pub mod sync;
pub mod template;

pub use dispatch::serve;
pub use error::{RouteError, RouteResult};
pub use index::{RoutingIndex, RoutingIndexEntry};
pub use matcher::match_path;
pub use sync::IndexSync;
pub use template::TemplateSet;
