use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed client frame: {0}")]
    MalformedFrame(String),
}

/// Credential verification failures, shared by the connection handshake and
/// the REST surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    Unauthenticated,

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
}
