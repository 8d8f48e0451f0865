use std::io;

/// Errors from accepting, reading or writing a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listening socket could not be opened.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    /// Writing or flushing failed.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// The peer closed its side; the payload says at which point.
    #[error("peer closed the stream {0}")]
    PeerClosed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let err = TransportError::Bind {
            addr: "127.0.0.1:1883".into(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "failed to bind 127.0.0.1:1883: in use");
    }
}
