#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QworkerError {
    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("config error: {0}")]
    Config(String),

    #[error("SECURITY: {0}")]
    Security(String),

    #[error("{0}")]
    Other(String),
}
