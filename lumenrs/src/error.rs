use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LumenError>;

/// Driver-level failure reported verbatim to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// 1-based character offset of a syntax error, when the engine reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            position: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_position(mut self, position: Option<u32>) -> Self {
        self.position = position;
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum LumenError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    /// Registry misconfiguration, detected when the registry is built.
    #[error("schema error: {0}")]
    Schema(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("sandbox violation: {0}")]
    Sandbox(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("execution error: {0}")]
    Execution(ExecutionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Serializable error payload handed to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

impl LumenError {
    pub fn execution(message: impl Into<String>) -> Self {
        LumenError::Execution(ExecutionError::new(message))
    }

    /// HTTP status class the CRUD layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            LumenError::Validation(_)
            | LumenError::InvalidField(_)
            | LumenError::Json(_)
            | LumenError::Execution(_) => 400,
            LumenError::Sandbox(_) => 403,
            LumenError::Connection(_) => 502,
            LumenError::Timeout { .. } => 504,
            LumenError::Io(_)
            | LumenError::Yaml(_)
            | LumenError::Config(_)
            | LumenError::Schema(_)
            | LumenError::Other(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            LumenError::Execution(err) => ErrorBody {
                message: err.message.clone(),
                code: err.code.clone(),
                position: err.position,
            },
            other => ErrorBody {
                message: other.to_string(),
                code: None,
                position: None,
            },
        }
    }
}
