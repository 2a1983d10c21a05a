use std::time::Duration;
use thiserror::Error;

/// Failure reported by a driver callback.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for DriverError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for DriverError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection outbound queue closed")]
    ConnectionClosed,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("store io error: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error("store decode error: {0}")]
    StoreDecode(String),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("timed out after {0:?} waiting for broadcast lock")]
    LockTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_converts_into_bridge_error() {
        let err: BridgeError = DriverError::from("device offline").into();
        assert_eq!(err.to_string(), "driver error: device offline");
    }

    #[test]
    fn missing_field_names_the_field() {
        assert_eq!(
            BridgeError::MissingField("msg").to_string(),
            "missing field 'msg'"
        );
    }
}
