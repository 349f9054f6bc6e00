//! Debug module - Print debug messages and variable values
//!
//! This module is used for debugging playbooks. It runs entirely on the
//! control node and never opens a connection. The runner resolves `var`
//! before dispatch and passes the value as `_var_value` (absent when the
//! variable is undefined).

use async_trait::async_trait;

use super::{Module, ModuleClassification, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::vars::{resolve, JsonValue};

/// Module for printing debug messages and variable values
pub struct DebugModule;

/// Key under which the runner passes the resolved `var`
pub const VAR_VALUE_KEY: &str = "_var_value";

#[async_trait]
impl Module for DebugModule {
    fn name(&self) -> &'static str {
        "debug"
    }


    fn classification(&self) -> ModuleClassification {
        ModuleClassification::LocalLogic
    }

    fn free_form_arg(&self) -> Option<&'static str> {
        Some("msg")
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(var) = params.get_string("var")? {
            let output = match params.get(VAR_VALUE_KEY) {
                Some(value) => ModuleOutput::ok(format!("{}: {}", var, resolve::to_string(value)))
                    .with_data(var, value.clone()),
                None => ModuleOutput::ok(format!("{}: VARIABLE IS NOT DEFINED!", var))
                    .with_data(var, JsonValue::String("VARIABLE IS NOT DEFINED!".into())),
            };
            return Ok(output);
        }

        match params.get("msg") {
            None | Some(JsonValue::Null) => Ok(ModuleOutput::ok("Hello world!")),
            Some(JsonValue::String(s)) => Ok(ModuleOutput::ok(s.clone())),
            // structured messages keep their shape in the result data
            Some(other) => Ok(ModuleOutput::ok(resolve::to_string(other)).with_data("msg", other.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_debug_msg() {
        let mut params = ModuleParams::new();
        params.insert("msg".to_string(), json!("hi"));

        let result = DebugModule.execute(&params, &ModuleContext::new("h")).await.unwrap();
        assert!(!result.changed);
        assert!(!result.failed);
        assert_eq!(result.msg, "hi");
    }

    #[tokio::test]
    async fn test_debug_default_and_structured() {
        let result = DebugModule
            .execute(&ModuleParams::new(), &ModuleContext::new("h"))
            .await
            .unwrap();
        assert_eq!(result.msg, "Hello world!");

        let mut params = ModuleParams::new();
        params.insert("msg".to_string(), json!([1, 2]));
        let result = DebugModule.execute(&params, &ModuleContext::new("h")).await.unwrap();
        assert_eq!(result.to_data()["msg"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_debug_var() {
        let mut params = ModuleParams::new();
        params.insert("var".to_string(), json!("port"));
        params.insert(VAR_VALUE_KEY.to_string(), json!(8080));

        let result = DebugModule.execute(&params, &ModuleContext::new("h")).await.unwrap();
        assert_eq!(result.msg, "port: 8080");
        assert_eq!(result.data["port"], json!(8080));

        params.shift_remove(VAR_VALUE_KEY);
        let result = DebugModule.execute(&params, &ModuleContext::new("h")).await.unwrap();
        assert_eq!(result.msg, "port: VARIABLE IS NOT DEFINED!");
    }
}
