//! Workflow identifiers.
//!
//! A `WorkflowId` is an opaque token that names one pipeline run for its
//! entire lifetime. It doubles as a directory name (state dir, workspace
//! dir) and as the hash input for isolation slot derivation, so the
//! accepted alphabet is deliberately narrow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum accepted identifier length.
pub const MAX_ID_LEN: usize = 64;

/// Error returned when a token cannot be used as a workflow id.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("workflow id is empty")]
    Empty,

    #[error("workflow id '{0}' exceeds {MAX_ID_LEN} characters")]
    TooLong(String),

    #[error("workflow id '{id}' contains invalid character '{ch}'")]
    InvalidChar { id: String, ch: char },
}

/// Stable identifier for one workflow run.
///
/// Accepted tokens are 1-64 characters of `[a-z0-9-]`. Generated ids are
/// the first 8 hex characters of a v4 UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Validate and wrap a token.
    pub fn new(token: impl Into<String>) -> Result<Self, IdError> {
        let token = token.into();
        if token.is_empty() {
            return Err(IdError::Empty);
        }
        if token.len() > MAX_ID_LEN {
            return Err(IdError::TooLong(token));
        }
        if let Some(ch) = token
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(IdError::InvalidChar { id: token, ch });
        }
        Ok(Self(token))
    }

    /// Generate a fresh 8-character hex id.
    pub fn generate() -> Self {
        let token: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self(token)
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkflowId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkflowId> for String {
    fn from(id: WorkflowId) -> Self {
        id.0
    }
}

impl AsRef<str> for WorkflowId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
