//! CLI command implementations.

pub mod object;
pub mod output;
pub mod query;
pub mod transport;

use nimbus_client::ClientError;
use thiserror::Error;

/// Errors raised while turning arguments into requests.
#[derive(Debug, Error)]
pub enum CliError {
    /// The `--where` argument is not a usable constraint object.
    #[error("invalid --where: {0}")]
    InvalidWhere(String),

    /// The `--where` argument uses an operator the CLI cannot express.
    #[error("unsupported operator {0} in --where")]
    UnsupportedOperator(String),

    /// The client rejected or failed the request.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Output could not be encoded.
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
