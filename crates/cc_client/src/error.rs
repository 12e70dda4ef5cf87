use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] cc_proto::ProtoError),

    #[error(transparent)]
    Crypto(#[from] cc_crypto::CryptoError),

    #[error("Not registered with the broker yet")]
    NotRegistered,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("File transfer error: {0}")]
    Transfer(String),

    #[error("Connection closed by broker")]
    ConnectionClosed,
}
