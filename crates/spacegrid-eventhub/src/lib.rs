//! SpaceGrid event pipeline.
//!
//! Events published by an install are persisted only when some enabled
//! subscription listens for them. Each matching subscription gets its own
//! target record, which is driven through `new → processing → processed`
//! (or `failed`, or `delayed` for a later retry) by the target worker.
//!
//! # Components
//!
//! - **`rules`** — nested AND/OR predicate trees over JSON payloads
//! - **`hub`** — `EventHub`: active index, publish, worker loops
//! - **`targets`** — `TargetExecutors` with `log`, `script`, `webhook`

pub mod error;
pub mod hub;
pub mod rules;
pub mod targets;

pub use error::{EventHubError, EventHubResult};
pub use hub::{EventHub, EventOptions, MAX_HOLD_SECS, MAX_RETRIES, TargetOutcome};
pub use rules::{RuleError, RuleSet, evaluate};
pub use targets::{Delivery, TargetExecutor, TargetExecutors};
