use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection failed: {0}")]
    Connection(String),

    /// The gateway asked us to reconnect elsewhere during the handshake.
    #[error("gateway redirected the connection to {0}")]
    Redirect(String),

    #[error("unsupported server version {version} (client accepts {min}..={max})")]
    UnsupportedServerVersion { version: i32, min: i32, max: i32 },

    /// A request needs a newer server than the one negotiated.
    #[error("{request} requires server version {required}, negotiated {negotiated}")]
    RequestNotSupported {
        request: &'static str,
        required: i32,
        negotiated: i32,
    },

    #[error("encode failed: {0}")]
    Encoding(String),

    #[error("decode failed: {0}")]
    Decoding(String),

    /// Framing violations.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
