use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Fabric error: {0}")]
    Fabric(#[from] courier_fabric::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unable to find a consumer for service '{0}'")]
    NoConsumer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Already running on {0}")]
    AlreadyRunning(String),

    #[error("Provider has been disposed")]
    Disposed,
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
