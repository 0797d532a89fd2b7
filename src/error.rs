use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Custom error type for gitlab_webhook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cannot resolve placeholder {{{{{placeholder}}}}}: {reason}")]
    TemplateResolution { placeholder: String, reason: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to open output log '{}': {source}", .path.display())]
    SinkOpen { path: PathBuf, source: io::Error },

    #[error("Output log path '{}' leaves its directory", .0.display())]
    UnsafeLogPath(PathBuf),

    #[error("Timed out after {timeout:?} opening output log '{}'", .path.display())]
    SinkTimeout { path: PathBuf, timeout: Duration },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn { program: String, source: io::Error },

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Helper type for Results that use HookError
pub type Result<T> = std::result::Result<T, HookError>;
