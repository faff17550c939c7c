use std::io;

use thiserror::Error;

use crate::core::CoreError;
use crate::netstack::NetstackError;

/// Errors surfaced by the gateway.
///
/// Validation and state errors reject the caller's input before any effect;
/// transient per-connection failures never appear here, they are logged by
/// the owning loop and accounted in statistics.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Overlay core error: {0}")]
    Core(#[from] CoreError),

    #[error("Netstack error: {0}")]
    Netstack(#[from] NetstackError),

    #[error("Not resolvable: {0}")]
    NotResolvable(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Stable error code reported over the control plane.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::State(_) => "STATE_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Core(_) => "CORE_ERROR",
            GatewayError::Netstack(_) => "NETSTACK_ERROR",
            GatewayError::NotResolvable(_) => "RESOLVE_ERROR",
            GatewayError::Proxy(_) => "PROXY_ERROR",
            GatewayError::Mapping(_) => "MAPPING_ERROR",
            GatewayError::Serialization(_) => "PARSE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(GatewayError::State("x".into()).code(), "STATE_ERROR");
        assert_eq!(GatewayError::Config("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(GatewayError::Proxy("x".into()).code(), "PROXY_ERROR");
        assert_eq!(GatewayError::Mapping("x".into()).code(), "MAPPING_ERROR");
    }

    #[test]
    fn io_errors_convert() {
        let err: GatewayError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
