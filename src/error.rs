//! Error types for Ansirun.
//!
//! Each subsystem has its own error enum; [`Error`] aggregates them for the
//! library's entry points and the binaries.

use thiserror::Error;

use crate::connection::ConnectionError;
use crate::executor::ExecutorError;
use crate::include::IncludeError;
use crate::inventory::InventoryError;
use crate::modules::ModuleError;
use crate::playbook::PlaybookError;
use crate::roles::RoleError;
use crate::template::TemplateError;

/// Result type alias for Ansirun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Ansirun.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Playbook(#[from] PlaybookError),

    #[error(transparent)]
    Include(#[from] IncludeError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Invalid configuration or command-line input.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run finished but some hosts failed or were unreachable.
    #[error("one or more hosts failed: {}", .hosts.join(", "))]
    PlayFailed { hosts: Vec<String> },
}

impl Error {
    /// Process exit code for this error: 2 when hosts failed, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::PlayFailed { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let failed = Error::PlayFailed {
            hosts: vec!["web1".into(), "web2".into()],
        };
        assert_eq!(failed.exit_code(), 2);
        assert_eq!(failed.to_string(), "one or more hosts failed: web1, web2");

        let parse = Error::from(PlaybookError::NoModule("t".into()));
        assert_eq!(parse.exit_code(), 1);
    }
}
