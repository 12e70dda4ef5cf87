use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid JSON message: {0}")]
    Malformed(String),

    #[error("Message missing type field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {tag} frame: {detail}")]
    InvalidFrame { tag: String, detail: String },

    #[error("{0}")]
    Validation(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
