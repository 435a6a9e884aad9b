use std::io;

/// Crate-wide error type. Closing a channel always carries one of these as
/// the close future's failure cause; `Io` wraps everything the OS can throw
/// at a socket op that isn't `WouldBlock` (which never reaches here — it is
/// handled by interest toggling before an `Error` is built).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame length fell outside the codec's declared bounds.
    #[error("invalid frame length: {0}")]
    InvalidLength(String),

    /// Malformed header, checksum mismatch, or decompression failure.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// The configured TLS engine raised an error mid-handshake or mid-record.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Transient or fatal I/O failure other than `WouldBlock`.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The channel was already closed.
    #[error("channel closed")]
    Closed,
}

impl Error {
    pub fn invalid_length(msg: impl Into<String>) -> Error {
        Error::InvalidLength(msg.into())
    }

    pub fn invalid_encoding(msg: impl Into<String>) -> Error {
        Error::InvalidEncoding(msg.into())
    }

    /// Whether this cause should close the channel. Everything except
    /// backpressure and rate-limit denial, which are not errors at all and
    /// never constructed as one.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
