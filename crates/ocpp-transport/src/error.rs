//! Transport layer error types

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Transport layer errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Endpoint could not be reached or the handshake failed
    #[error("WebSocket connection error: {message}")]
    ConnectionError { message: String },

    #[error("Invalid endpoint URL: {message}")]
    InvalidUrl { message: String },

    #[error("WebSocket protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Connection timeout after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Connection not ready, current state: {state:?}")]
    NotReady { state: crate::ConnectionState },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("TLS error: {message}")]
    TlsError { message: String },

    #[error("Internal transport error: {message}")]
    Internal { message: String },
}

impl TransportError {
    /// Whether the link itself is gone and a reconnect is needed
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed { .. }
                | TransportError::NotReady { .. }
                | TransportError::IoError { .. }
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for TransportError {
    fn from(err: url::ParseError) -> Self {
        TransportError::InvalidUrl {
            message: err.to_string(),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed => TransportError::ConnectionClosed {
                reason: "WebSocket connection closed".to_string(),
            },
            tungstenite::Error::AlreadyClosed => TransportError::ConnectionClosed {
                reason: "WebSocket already closed".to_string(),
            },
            tungstenite::Error::Protocol(msg) => TransportError::ProtocolError {
                message: msg.to_string(),
            },
            tungstenite::Error::Io(io_err) => TransportError::IoError {
                message: io_err.to_string(),
            },
            tungstenite::Error::Tls(tls_err) => TransportError::TlsError {
                message: tls_err.to_string(),
            },
            tungstenite::Error::Http(response) => TransportError::ConnectionError {
                message: format!("handshake rejected with HTTP {}", response.status()),
            },
            tungstenite::Error::Url(url_err) => TransportError::InvalidUrl {
                message: url_err.to_string(),
            },
            other => TransportError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::MessageTooLarge {
            size: 100000,
            limit: 65536,
        };
        assert_eq!(
            error.to_string(),
            "Message too large: 100000 bytes exceeds limit of 65536 bytes"
        );
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Connection refused");
        let transport_error = TransportError::from(io_error);

        assert!(transport_error.is_connection_lost());
        assert!(transport_error.to_string().contains("Connection refused"));
    }

    #[test]
    fn test_error_conversion_from_tungstenite() {
        let transport_error = TransportError::from(tungstenite::Error::ConnectionClosed);
        assert!(matches!(
            transport_error,
            TransportError::ConnectionClosed { .. }
        ));
    }

    #[test]
    fn test_error_conversion_from_url() {
        let err = url::Url::parse("not a url").unwrap_err();
        assert!(matches!(
            TransportError::from(err),
            TransportError::InvalidUrl { .. }
        ));
    }
}
