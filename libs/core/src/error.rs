use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid {kind} value: {value}")]
    InvalidEnum { kind: &'static str, value: i32 },
}

pub type Result<T> = std::result::Result<T, Error>;
