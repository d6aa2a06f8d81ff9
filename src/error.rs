//! Error taxonomy shared across the pipeline.
//!
//! Operations return structured results; panics are reserved for genuinely
//! unexpected conditions and are converted at the CLI boundary. Retries
//! happen at the lowest layer that can decide: the HTTP layer retries
//! timeouts and 5xx, the provider manager fails over on retriable provider
//! errors, and higher layers never retry.

use thiserror::Error;

/// Stable process exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    General = 1,
    InvalidArgs = 2,
    Auth = 3,
    NotFound = 4,
    RateLimit = 5,
    Network = 6,
    Database = 7,
    Validation = 8,
    Cancelled = 9,
    Timeout = 10,
    Config = 11,
    Permission = 13,
}

/// Top-level error for pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication: {0}")]
    Auth(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("conflicting state: {0}")]
    ConflictingState(String),

    #[error("cancelled")]
    Cancelled,

    #[error("configuration: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgs(_) => "INVALID_ARGS",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Network(_) => "NETWORK",
            Error::Timeout(_) => "TIMEOUT",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::Auth(_) => "AUTH",
            Error::Validation(_) => "VALIDATION",
            Error::Database(_) => "DATABASE",
            Error::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Error::ConflictingState(_) => "CONFLICTING_STATE",
            Error::Cancelled => "CANCELLED",
            Error::Config(_) => "CONFIG",
            Error::Internal(_) => "INTERNAL",
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::InvalidArgs(_) => ExitCode::InvalidArgs,
            Error::NotFound(_) => ExitCode::NotFound,
            Error::Network(_) => ExitCode::Network,
            Error::Timeout(_) => ExitCode::Timeout,
            Error::RateLimited(_) => ExitCode::RateLimit,
            Error::Auth(_) => ExitCode::Auth,
            Error::Validation(_) => ExitCode::Validation,
            Error::Database(_) => ExitCode::Database,
            Error::ProviderUnavailable(_) => ExitCode::General,
            Error::ConflictingState(_) => ExitCode::General,
            Error::Cancelled => ExitCode::Cancelled,
            Error::Config(_) => ExitCode::Config,
            Error::Internal(_) => ExitCode::General,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(format!("json: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(Error::InvalidArgs(String::new()).exit_code() as i32, 2);
        assert_eq!(Error::Auth(String::new()).exit_code() as i32, 3);
        assert_eq!(Error::NotFound(String::new()).exit_code() as i32, 4);
        assert_eq!(Error::RateLimited(String::new()).exit_code() as i32, 5);
        assert_eq!(Error::Network(String::new()).exit_code() as i32, 6);
        assert_eq!(Error::Validation(String::new()).exit_code() as i32, 8);
        assert_eq!(Error::Cancelled.exit_code() as i32, 9);
        assert_eq!(Error::Timeout(String::new()).exit_code() as i32, 10);
    }
}
