//! Ping module - Verify the host can be reached and runs commands

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

/// Module that checks connectivity by echoing a token
pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }


    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let data = params.get_string("data")?.unwrap_or_else(|| "pong".to_string());
        if data == "crash" {
            return Ok(ModuleOutput::failed("boom"));
        }

        let result = context.run(self.name(), "echo pong").await?;
        if !result.success || result.stdout.trim() != "pong" {
            return Ok(ModuleOutput::failed(format!(
                "unexpected ping response (rc={}): {}",
                result.exit_code,
                result.stdout.trim()
            )));
        }

        Ok(ModuleOutput::ok("").with_data("ping", data.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnection;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ping_local() {
        let ctx = ModuleContext::new("localhost")
            .with_connection(Arc::new(LocalConnection::new("localhost")));
        let result = PingModule.execute(&ModuleParams::new(), &ctx).await.unwrap();

        assert!(!result.changed);
        assert!(!result.failed);
        assert_eq!(result.to_data()["ping"], json!("pong"));
    }
}
