use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream out of sync: {0}")]
    Desync(#[from] crate::frame::Desync),

    #[error("A response is already awaited for key {0}")]
    DuplicateKey(i64),

    #[error("Connect timeout exceeded after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Send timeout exceeded after {0:?}")]
    SendTimeout(std::time::Duration),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, Error>;
