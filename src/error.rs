use std::io;

pub use crate::config::ConfigError;

/// Errors surfaced by the `start*` operations.
///
/// Per-connection failures (TLS handshakes, ACME rejections) never reach
/// this type; they are logged and the connection is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind server: {0}")]
    Bind(#[from] io::Error),

    #[error("Failed to load TLS configuration: {0}")]
    Tls(String),

    #[error("ACME setup failed: {0}")]
    Acme(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<rustls::Error> for ServerError {
    fn from(err: rustls::Error) -> Self {
        ServerError::Tls(err.to_string())
    }
}
