use thiserror::Error;

use crate::domain::models::{AdapterState, DeviceId, SessionState};

/// Failure to decode a Heart Rate Measurement payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: needed {needed} more bytes, {remaining} remaining")]
    TooShort { needed: usize, remaining: usize },

    #[error("RR interval field ends with an odd byte")]
    TrailingOddByte,
}

/// Reason reported by the radio when a connection attempt fails.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("connection timed out")]
    Timeout,

    #[error("connection rejected by peripheral")]
    Rejected,

    #[error("peripheral unreachable")]
    Unreachable,
}

/// Error reported by a discover/subscribe/read callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("GATT operation failed: {0}")]
pub struct GattError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("bluetooth adapter unavailable ({0})")]
    AdapterUnavailable(AdapterState),

    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("connect failed: {0}")]
    ConnectFailed(ConnectFailure),

    #[error("heart rate service not supported by peripheral")]
    ServiceNotSupported,

    #[error("heart rate characteristic not supported by peripheral")]
    CharacteristicNotSupported,

    #[error(transparent)]
    Gatt(#[from] GattError),

    #[error("connection to peripheral lost")]
    ConnectionLost,

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("{command} is not valid while {state}")]
    InvalidState {
        command: &'static str,
        state: SessionState,
    },
}

impl SessionError {
    /// Structural errors end the current connection attempt.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Decode(_) | Self::InvalidState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::ConnectFailed(ConnectFailure::Timeout);
        assert_eq!(err.to_string(), "connect failed: connection timed out");

        let err = SessionError::UnknownDevice(DeviceId::from("AA:BB"));
        assert_eq!(err.to_string(), "unknown device: AA:BB");

        let err = SessionError::AdapterUnavailable(AdapterState::PoweredOff);
        assert_eq!(err.to_string(), "bluetooth adapter unavailable (powered off)");

        let err = SessionError::InvalidState {
            command: "start_scan",
            state: SessionState::Streaming,
        };
        assert_eq!(err.to_string(), "start_scan is not valid while Streaming");

        let err: SessionError = DecodeError::TooShort {
            needed: 1,
            remaining: 0,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "decode error: payload too short: needed 1 more bytes, 0 remaining"
        );
    }

    #[test]
    fn test_terminal_classification() {
        assert!(SessionError::ServiceNotSupported.is_terminal());
        assert!(SessionError::Gatt(GattError("x".into())).is_terminal());
        assert!(!SessionError::Decode(DecodeError::TrailingOddByte).is_terminal());
    }
}
