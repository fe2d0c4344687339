//! Error types for pattern loading.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to parse pattern set: {0}")]
    PatternParse(#[from] toml::de::Error),

    #[error("invalid regex in {context}: {source}")]
    InvalidRegex {
        context: String,
        #[source]
        source: regex::Error,
    },

    #[error("pattern io error: {0}")]
    Io(#[from] std::io::Error),
}
