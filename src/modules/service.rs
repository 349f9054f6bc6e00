//! Service module - Service management
//!
//! This module manages system services with systemctl, falling back to the
//! SysV `service` command on hosts without systemd. `systemd` is the same
//! module forced onto systemctl.

use async_trait::async_trait;

use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{shell_quote, CommandResult};
use crate::vars::JsonValue;

/// Supported init systems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    Systemd,
    SysV,
}

impl InitSystem {
    /// Detect the init system on the host
    async fn detect(module: &str, context: &ModuleContext) -> ModuleResult<Self> {
        let status = context
            .run(
                module,
                "if [ -d /run/systemd/system ] || command -v systemctl >/dev/null 2>&1; \
                 then echo systemd; else echo sysv; fi",
            )
            .await?;
        Ok(match status.stdout.trim() {
            "systemd" => InitSystem::Systemd,
            _ => InitSystem::SysV,
        })
    }

    fn status_command(self, service: &str) -> String {
        match self {
            InitSystem::Systemd => format!("systemctl is-active --quiet {}", service),
            InitSystem::SysV => format!("service {} status >/dev/null 2>&1", service),
        }
    }

    fn action_command(self, service: &str, action: &str) -> String {
        match self {
            InitSystem::Systemd => format!("systemctl {} {}", action, service),
            InitSystem::SysV => format!("service {} {}", service, action),
        }
    }

    fn is_enabled_command(self, service: &str) -> String {
        match self {
            InitSystem::Systemd => format!("systemctl is-enabled --quiet {}", service),
            InitSystem::SysV => format!("ls /etc/rc[2345].d/S??{} >/dev/null 2>&1", service),
        }
    }

    fn enable_command(self, service: &str, enable: bool) -> String {
        match (self, enable) {
            (InitSystem::Systemd, true) => format!("systemctl enable {}", service),
            (InitSystem::Systemd, false) => format!("systemctl disable {}", service),
            (InitSystem::SysV, true) => format!(
                "if command -v chkconfig >/dev/null 2>&1; then chkconfig {0} on; \
                 else update-rc.d {0} defaults; fi",
                service
            ),
            (InitSystem::SysV, false) => format!(
                "if command -v chkconfig >/dev/null 2>&1; then chkconfig {0} off; \
                 else update-rc.d -f {0} remove; fi",
                service
            ),
        }
    }
}

/// Desired state for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Started,
    Stopped,
    Restarted,
    Reloaded,
}

impl ServiceState {
    fn parse(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "started" | "running" => Ok(ServiceState::Started),
            "stopped" => Ok(ServiceState::Stopped),
            "restarted" => Ok(ServiceState::Restarted),
            "reloaded" => Ok(ServiceState::Reloaded),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: started, stopped, restarted, reloaded",
                s
            ))),
        }
    }
}

async fn manage(
    module: &str,
    params: &ModuleParams,
    context: &ModuleContext,
    forced: Option<InitSystem>,
) -> ModuleResult<ModuleOutput> {
    let name = params.get_string_required("name")?;
    let service = shell_quote(&name);
    let state = params
        .get_string("state")?
        .map(|s| ServiceState::parse(&s))
        .transpose()?;
    let enabled = params.get_bool("enabled")?;
    let daemon_reload = params.get_bool_or("daemon_reload", false);

    let init = match forced {
        Some(init) => init,
        None => InitSystem::detect(module, context).await?,
    };

    let mut changed = false;
    let failed = |what: &str, result: &CommandResult| {
        ModuleOutput::failed(format!(
            "Unable to {} service {}: {}",
            what,
            name,
            result.stderr.trim()
        ))
        .with_command_output(result)
    };

    if daemon_reload && init == InitSystem::Systemd {
        let result = context.run(module, "systemctl daemon-reload").await?;
        if !result.success {
            return Ok(failed("daemon-reload for", &result));
        }
        changed = true;
    }

    if let Some(enable) = enabled {
        let is_enabled = context.run(module, &init.is_enabled_command(&service)).await?.success;
        if is_enabled != enable {
            let result = context.run(module, &init.enable_command(&service, enable)).await?;
            if !result.success {
                return Ok(failed(if enable { "enable" } else { "disable" }, &result));
            }
            changed = true;
        }
    }

    if let Some(state) = state {
        let active = context.run(module, &init.status_command(&service)).await?.success;
        let action = match state {
            ServiceState::Started if !active => Some("start"),
            ServiceState::Stopped if active => Some("stop"),
            ServiceState::Restarted => Some("restart"),
            ServiceState::Reloaded if active => Some("reload"),
            ServiceState::Reloaded => Some("start"),
            _ => None,
        };
        if let Some(action) = action {
            let result = context.run(module, &init.action_command(&service, action)).await?;
            if !result.success {
                return Ok(failed(action, &result));
            }
            changed = true;
        }
    }

    let output = if changed {
        ModuleOutput::changed("")
    } else {
        ModuleOutput::ok("")
    };
    let mut output = output.with_data("name", JsonValue::String(name.clone()));
    if let Some(state) = params.get_string("state")? {
        output = output.with_data("state", JsonValue::String(state));
    }
    if let Some(enable) = enabled {
        output = output.with_data("enabled", JsonValue::Bool(enable));
    }
    Ok(output)
}

/// Module for service management
pub struct ServiceModule;

#[async_trait]
impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }


    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        manage(self.name(), params, context, None).await
    }
}

/// Module for systemd units
pub struct SystemdModule;

#[async_trait]
impl Module for SystemdModule {
    fn name(&self) -> &'static str {
        "systemd"
    }


    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        // daemon_reload alone is a valid invocation
        if !params.contains_key("name") && !params.get_bool_or("daemon_reload", false) {
            return Err(ModuleError::MissingParameter("name".to_string()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if !params.contains_key("name") {
            let result = context.run(self.name(), "systemctl daemon-reload").await?;
            return Ok(if result.success {
                ModuleOutput::changed("")
            } else {
                ModuleOutput::failed(result.stderr.trim().to_string()).with_command_output(&result)
            });
        }
        manage(self.name(), params, context, Some(InitSystem::Systemd)).await
    }
}
