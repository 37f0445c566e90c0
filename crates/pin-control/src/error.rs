use device_link::TransportError;
use thiserror::Error;

pub type Result<T, E = ControlError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    InvalidPayload(#[from] InvalidPayload),
    #[error("not connected")]
    NotConnected,
    #[error("node stopped: {0}")]
    Stopped(String),
    #[error("metrics init error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// A per-message payload outside the domain of the pin's mode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid input: {payload}")]
pub struct InvalidPayload {
    pub payload: String,
}

impl InvalidPayload {
    pub fn new(payload: &serde_json::Value) -> Self {
        Self {
            payload: payload.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lower_errors_keep_their_text() {
        let err: ControlError = InvalidPayload::new(&json!("dim")).into();
        assert_eq!(err.to_string(), r#"invalid input: "dim""#);
        let err: ControlError = TransportError::Closed.into();
        assert!(matches!(err, ControlError::Transport(TransportError::Closed)));
        assert_eq!(err.to_string(), TransportError::Closed.to_string());
    }
}
