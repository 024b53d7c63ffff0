pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed endpoint name: {0}")]
    MalformedName(String),

    #[error("Malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Datagram too short for packet header")]
    Truncated,

    #[error("Unknown packet type {0:#04x}")]
    UnknownType(u8),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No send buffer available")]
    BufExhausted,

    #[error("Connection closed")]
    Closed,

    #[error("Operation not supported on this endpoint type")]
    Unsupported,

    #[error("Failed to adjust MEMLOCK limit: {0}")]
    Memlock(#[from] nix::Error),

    #[error("Fatal: {0}")]
    Fatal(String),
}
