//! Local connection module
//!
//! Runs commands on the control node through `sh -c`, without any network
//! transport. Used for hosts with `ansible_connection=local`.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

use super::{
    wrap_become, CommandResult, Connection, ConnectionParams, ConnectionResult, Connector,
    ConnectionError, ExecuteOptions,
};

/// Local connection for executing commands on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    /// Create a local connection named after the inventory host
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn build_command(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, command: &str, input: Option<&[u8]>) -> ConnectionResult<CommandResult> {
        let mut child = Self::build_command(command).spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(data) = input {
                stdin.write_all(data).await?;
            }
            // dropping stdin closes the pipe
        }

        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        trace!(exit_code = %exit_code, "Local command completed");
        Ok(CommandResult::failure(exit_code, stdout, stderr))
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let command = wrap_become(command, &options.r#become)?;
        trace!(command = %command, "Executing local command");

        match options.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.run(&command, input))
                .await
                .map_err(|_| ConnectionError::Timeout(secs))?,
            None => self.run(&command, input).await,
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

/// Opens [`LocalConnection`]s
#[derive(Debug, Default, Clone)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, params: &ConnectionParams) -> ConnectionResult<Arc<dyn Connection>> {
        Ok(Arc::new(LocalConnection::new(params.host.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BecomeSettings;

    #[tokio::test]
    async fn test_execute() {
        let conn = LocalConnection::new("localhost");
        let result = conn.execute("echo hello", None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_execute_failure() {
        let conn = LocalConnection::new("localhost");
        let result = conn.execute("echo oops >&2; exit 3", None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let conn = LocalConnection::new("localhost");
        let err = conn
            .execute("sleep 5", Some(ExecuteOptions::new().with_timeout(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_put_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let conn = LocalConnection::new("localhost");

        conn.put_content(b"line one\n", path.to_str().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[tokio::test]
    async fn test_unsupported_become() {
        let conn = LocalConnection::new("localhost");
        let options = ExecuteOptions::new().with_become(BecomeSettings {
            enabled: true,
            user: "root".into(),
            method: "pbrun".into(),
        });
        assert!(matches!(
            conn.execute("true", Some(options)).await,
            Err(ConnectionError::UnsupportedBecomeMethod(_))
        ));
    }
}
