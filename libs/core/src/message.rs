use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::unique_key::next_unique_key;

/// Whether the caller needs guaranteed execution of a command
///
/// Advisory only: the messaging layer never persists anything itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ExecutionType {
    #[default]
    Transient = 1,
    Persistent = 2,
}

impl From<ExecutionType> for i32 {
    fn from(value: ExecutionType) -> Self {
        value as i32
    }
}

impl ExecutionType {
    fn from_code(value: i32) -> Option<Self> {
        match value {
            1 => Some(ExecutionType::Transient),
            2 => Some(ExecutionType::Persistent),
            _ => None,
        }
    }
}

impl TryFrom<i32> for ExecutionType {
    type Error = Error;

    fn try_from(value: i32) -> Result<ExecutionType> {
        ExecutionType::from_code(value).ok_or(Error::InvalidEnum {
            kind: "ExecutionType",
            value,
        })
    }
}

/// How the `response` payload of a [`CommandResponse`] should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ResponseType {
    Json = 1,
    Xml = 2,
    Text = 3,
    Html = 4,
    Error = 5,
    None = 6,
}

impl From<ResponseType> for i32 {
    fn from(value: ResponseType) -> Self {
        value as i32
    }
}

impl ResponseType {
    fn from_code(value: i32) -> Option<Self> {
        match value {
            1 => Some(ResponseType::Json),
            2 => Some(ResponseType::Xml),
            3 => Some(ResponseType::Text),
            4 => Some(ResponseType::Html),
            5 => Some(ResponseType::Error),
            6 => Some(ResponseType::None),
            _ => None,
        }
    }
}

impl TryFrom<i32> for ResponseType {
    type Error = Error;

    fn try_from(value: i32) -> Result<ResponseType> {
        ResponseType::from_code(value).ok_or(Error::InvalidEnum {
            kind: "ResponseType",
            value,
        })
    }
}

/// A command sent from a provider to a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandMessage {
    /// Correlates the command with its response. Zero means "not assigned yet";
    /// the sender assigns a key before the command hits the wire.
    pub unique_key: i64,
    pub execution_type: ExecutionType,
    pub route: String,
    pub command: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
    /// Set only when a collaborator stored the command
    #[serde(default)]
    pub database_id: Option<i64>,
    pub company_id: i32,
}

impl CommandMessage {
    /// Create a transient command with a fresh unique key
    pub fn new(company_id: i32, route: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            unique_key: next_unique_key(),
            execution_type: ExecutionType::Transient,
            route: route.into(),
            command: command.into(),
            arguments: HashMap::new(),
            database_id: None,
            company_id,
        }
    }

    pub fn with_execution_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Assign a unique key if the command does not carry one yet
    pub fn ensure_unique_key(&mut self) -> i64 {
        if self.unique_key == 0 {
            self.unique_key = next_unique_key();
        }
        self.unique_key
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UniqueKey[{}] ExecutionType[{:?}] CompanyId[{}] Route[{}] Command[{}] Args[{}]",
            self.unique_key,
            self.execution_type,
            self.company_id,
            self.route,
            self.command,
            self.arguments.len()
        )
    }
}

/// A reply to a [`CommandMessage`], either from a consumer or synthesized
/// locally by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandResponse {
    pub unique_key: i64,
    pub response_code: i32,
    pub response_type: ResponseType,
    pub response: String,
    #[serde(default)]
    pub database_id: Option<i64>,
    pub company_id: i32,
}

impl CommandResponse {
    /// Build a response correlated with `message`
    pub fn for_message(
        message: &CommandMessage,
        response_code: i32,
        response_type: ResponseType,
        response: impl Into<String>,
    ) -> Self {
        Self {
            unique_key: message.unique_key,
            response_code,
            response_type,
            response: response.into(),
            database_id: message.database_id,
            company_id: message.company_id,
        }
    }

    /// Build a response with no originating command, e.g. a broadcast
    pub fn detached(
        company_id: i32,
        response_code: i32,
        response_type: ResponseType,
        response: impl Into<String>,
    ) -> Self {
        Self {
            unique_key: next_unique_key(),
            response_code,
            response_type,
            response: response.into(),
            database_id: None,
            company_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.response_code == crate::codes::SUCCESS
    }
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UniqueKey[{}] CompanyId[{}] ResponseCode[{}] ResponseType[{:?}] Response[{}]",
            self.unique_key,
            self.company_id,
            self.response_code,
            self.response_type,
            self.response.len()
        )
    }
}
