//! panewatch-source-hooks: turns loosely-typed agent hook payloads into
//! [`HookEvent`]s and suppresses re-deliveries.

pub mod dedup;
pub mod error;
pub mod normalize;

pub use dedup::{DedupConfig, DedupKey, DedupWindow};
pub use error::HookError;
pub use normalize::{normalize, normalize_line};
pub use panewatch_core::types::{HookEvent, HookKind};
