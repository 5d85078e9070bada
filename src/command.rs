//! STRATUM - Storage Commands & Responses
//! The request/response types exchanged with the dispatcher. Both are
//! validated at construction, so an existing value is always well formed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Longest key or value a client command may carry, in bytes.
pub const MAX_ARGUMENT_BYTES: usize = 256;

/// Kind of a storage command, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandType {
    Read,
    Write,
    Delete,
}

impl CommandType {
    /// Number of arguments the command takes.
    pub fn arity(&self) -> usize {
        match self {
            CommandType::Read | CommandType::Delete => 1,
            CommandType::Write => 2,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandType::Read => "READ",
            CommandType::Write => "WRITE",
            CommandType::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A key or value that passed command validation: not blank and at most
/// [`MAX_ARGUMENT_BYTES`] long. Only constructible through validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandArgument(String);

impl CommandArgument {
    fn parse(kind: CommandType, name: &str, arg: String) -> Result<Self> {
        if arg.trim().is_empty() {
            return Err(StratumError::InvalidCommand(format!(
                "{} {} must not be blank",
                kind, name
            )));
        }
        if arg.len() > MAX_ARGUMENT_BYTES {
            return Err(StratumError::InvalidCommand(format!(
                "{} {} is {} bytes, maximum is {}",
                kind,
                name,
                arg.len(),
                MAX_ARGUMENT_BYTES
            )));
        }
        Ok(Self(arg))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCommand {
    Read { key: CommandArgument },
    Write { key: CommandArgument, value: CommandArgument },
    Delete { key: CommandArgument },
}

impl StorageCommand {
    pub fn read(key: impl Into<String>) -> Result<Self> {
        let key = CommandArgument::parse(CommandType::Read, "key", key.into())?;
        Ok(StorageCommand::Read { key })
    }

    pub fn write(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = CommandArgument::parse(CommandType::Write, "key", key.into())?;
        let value = CommandArgument::parse(CommandType::Write, "value", value.into())?;
        Ok(StorageCommand::Write { key, value })
    }

    pub fn delete(key: impl Into<String>) -> Result<Self> {
        let key = CommandArgument::parse(CommandType::Delete, "key", key.into())?;
        Ok(StorageCommand::Delete { key })
    }

    /// Build a command from its type and raw argument list.
    pub fn new(kind: CommandType, arguments: Vec<String>) -> Result<Self> {
        if arguments.len() != kind.arity() {
            return Err(StratumError::InvalidCommand(format!(
                "{} takes {} argument(s), got {}",
                kind,
                kind.arity(),
                arguments.len()
            )));
        }
        let mut args = arguments.into_iter();
        let mut next = || args.next().unwrap_or_default();
        match kind {
            CommandType::Read => Self::read(next()),
            CommandType::Write => {
                let key = next();
                Self::write(key, next())
            }
            CommandType::Delete => Self::delete(next()),
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            StorageCommand::Read { .. } => CommandType::Read,
            StorageCommand::Write { .. } => CommandType::Write,
            StorageCommand::Delete { .. } => CommandType::Delete,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StorageCommand::Read { key }
            | StorageCommand::Write { key, .. }
            | StorageCommand::Delete { key } => key.as_str(),
        }
    }

    pub fn arguments(&self) -> Vec<&str> {
        match self {
            StorageCommand::Write { key, value } => vec![key.as_str(), value.as_str()],
            StorageCommand::Read { key } | StorageCommand::Delete { key } => vec![key.as_str()],
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Ok,
    Failed,
}

/// Reply to a storage command. Exactly one of `response` and
/// `error_message` is set, matching `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResponse {
    status: ResponseStatus,
    response: Option<String>,
    error_message: Option<String>,
}

impl StorageResponse {
    pub fn new(
        status: ResponseStatus,
        response: Option<String>,
        error_message: Option<String>,
    ) -> Result<Self> {
        match (status, &response, &error_message) {
            (ResponseStatus::Ok, Some(_), None) | (ResponseStatus::Failed, None, Some(_)) => Ok(Self {
                status,
                response,
                error_message,
            }),
            (ResponseStatus::Ok, _, _) => Err(StratumError::InvalidResponse(
                "OK response needs a payload and no error message".into(),
            )),
            (ResponseStatus::Failed, _, _) => Err(StratumError::InvalidResponse(
                "FAILED response needs an error message and no payload".into(),
            )),
        }
    }

    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            response: Some(response.into()),
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            response: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }
}
