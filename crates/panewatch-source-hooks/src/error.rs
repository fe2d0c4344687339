use thiserror::Error;

/// Why a payload was rejected. Unknown hook kinds are not an error.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hook payload must be a JSON object")]
    NotAnObject,

    #[error("hook payload has neither a session id nor a pane id")]
    Unroutable,
}
