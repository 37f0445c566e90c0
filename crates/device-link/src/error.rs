use std::io;
use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint not found: {0}")]
    NotFound(String),
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device rejected command ({code}): {reason}")]
    Rejected { code: i32, reason: &'static str },
    #[error("connection closed")]
    Closed,
    #[error("timeout")]
    Timeout,
}

impl TransportError {
    /// Expected while a device is unplugged or its daemon is down.
    /// Reported once per outage rather than on every retry.
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }

    /// Map an error raised while opening `what`, classifying the
    /// unreachable cases as [`TransportError::NotFound`].
    pub fn from_open(what: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::TimedOut => TransportError::NotFound(format!("{what}: {err}")),
            _ => TransportError::Io(format!("{what}: {err}")),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Closed,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_is_benign() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let mapped = TransportError::from_open("127.0.0.1:8888", &err);
        assert!(mapped.is_benign());
        assert!(mapped.to_string().contains("127.0.0.1:8888"));
    }

    #[test]
    fn permission_denied_is_unexpected() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let mapped = TransportError::from_open("/dev/ttyACM0", &err);
        assert!(!mapped.is_benign());
    }

    #[test]
    fn eof_maps_to_closed() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(TransportError::from(err), TransportError::Closed);
    }
}
