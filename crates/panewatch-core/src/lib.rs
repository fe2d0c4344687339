//! panewatch-core: pure domain logic for agent session monitoring.
//!
//! Fingerprinting, ANSI stripping, prompt classification and the per-session
//! state machine. No async, no subprocesses; everything here is deterministic
//! and safe to call while holding a session lock.

pub mod ansi;
pub mod error;
pub mod fingerprint;
pub mod patterns;
pub mod session;
pub mod types;

pub use error::CoreError;
pub use fingerprint::fingerprint;
pub use patterns::{PatternRegistry, PatternSet};
pub use session::{GuardAction, HookApplied, HookRules, SessionError, SessionState, Subtask};
pub use types::{
    Confidence, HookEvent, HookKind, PromptKind, PromptOption, PromptSource, Question,
    ReconcileOutcome, SessionStatus,
};
