use thiserror::Error;

/// Errors that can occur in the proxy core
#[derive(Error, Debug)]
pub enum EchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ECH unavailable: {0}")]
    EchUnavailable(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EchError {
    /// True for errors raised by a rejected or unusable Encrypted Client
    /// Hello; these are the only dial failures worth an ECH refresh.
    pub fn mentions_ech(&self) -> bool {
        let msg = self.to_string();
        msg.contains("ECH") || msg.to_ascii_lowercase().contains("encrypted client hello")
    }
}

pub type Result<T> = std::result::Result<T, EchError>;

/// Peer-closed conditions that end a session without being errors.
pub fn is_benign_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    ) || err.to_string().contains("closed")
}
