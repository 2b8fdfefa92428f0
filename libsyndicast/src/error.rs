//! Error types for Syndicast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicastError>;

#[derive(Error, Debug)]
pub enum SyndicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SyndicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicastError::InvalidInput(_) => 3,
            SyndicastError::Credential(_) => 2,
            SyndicastError::Config(_) => 2,
            SyndicastError::Database(_) => 1,
            SyndicastError::Publish(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database unreachable: {0}")]
    Unreachable(String),

    #[error("Query timed out after {0}s")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed (wrong key or corrupted ciphertext)")]
    DecryptionFailed,

    #[error("Encryption key too short (minimum {0} characters)")]
    WeakKey(usize),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account revoked: {0}")]
    Revoked(String),

    #[error("Token endpoint error: {0}")]
    TokenEndpoint(String),
}

/// Errors surfaced by a platform client for a single publish attempt.
///
/// The `Duplicate` variant carries the identifier of the already-existing
/// object so callers can treat the rejection as a success instead of
/// pattern-matching on error text.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Duplicate of existing post {existing_id}")]
    Duplicate { existing_id: String },

    #[error("Rate limited by platform: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Platform API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("No publisher registered for platform: {0}")]
    UnknownPlatform(String),
}

impl PublishError {
    /// Whether a failed attempt may succeed on a later retry.
    ///
    /// Validation and authentication failures are deterministic; network
    /// problems, 5xx responses and platform-side throttling are not.
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Network(_) | PublishError::RateLimited(_) => true,
            PublishError::Api { status, .. } => *status >= 500,
            PublishError::Authentication(_)
            | PublishError::Validation(_)
            | PublishError::Duplicate { .. }
            | PublishError::UnknownPlatform(_) => false,
        }
    }
}
