//! Configuration error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no safekeepers configured")]
    NoSafekeepers,

    #[error("{count} safekeepers configured, at most {max} are supported")]
    TooManySafekeepers { count: usize, max: usize },

    #[error("invalid safekeeper address '{0}', expected host:port")]
    InvalidSafekeeperAddress(String),

    #[error("WAL segment size {0} is not a positive power of two")]
    InvalidSegmentSize(u32),

    #[error("failed to render configuration as TOML: {0}")]
    Render(#[from] toml::ser::Error),
}
