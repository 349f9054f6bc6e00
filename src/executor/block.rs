//! Block execution: `block`, then `rescue` for hosts that failed, then
//! `always` for every host that entered.

use serde_json::json;
use tracing::debug;

use super::task::{FailureKind, TaskResult};
use super::{Failures, Inherited, PlayRunner};
use crate::playbook::{Task, TaskAction};
use crate::vars::JsonValue;

impl PlayRunner {
    pub(crate) async fn run_block(&self, task: &Task, hosts: &[String], outer: &Inherited) -> Failures {
        let mut failures = Failures::new();
        let TaskAction::Block {
            block,
            rescue,
            always,
        } = &task.action
        else {
            return failures;
        };

        let name = task.display_name();
        let ignore_errors = task.ignore_errors || outer.ignore_errors;
        let entering = self.evaluate_entry(task, hosts, ignore_errors, &mut failures).await;
        if entering.is_empty() {
            return failures;
        }

        let inner = Inherited {
            r#become: task.r#become.overlay(&outer.r#become),
            ignore_errors,
            rescuable: !rescue.is_empty() || outer.rescuable,
        };
        let outer_scope = Inherited {
            rescuable: outer.rescuable,
            ..inner.clone()
        };

        debug!(block = %name, hosts = entering.len(), "Entering block");
        let block_failures = self.run_list(block, entering.clone(), &inner, false).await;

        let mut dropped = Failures::new();
        let mut to_rescue = Vec::new();
        for (host, result) in block_failures {
            if result.unreachable || rescue.is_empty() {
                dropped.insert(host, result);
            } else {
                to_rescue.push((host, result));
            }
        }

        if !to_rescue.is_empty() {
            let scope = &self.play.scope;
            for (host, result) in &to_rescue {
                scope.set(host, "ansible_failed_task", json!({ "name": result.task }));
                scope.set(
                    host,
                    "ansible_failed_result",
                    JsonValue::Object(result.data.clone()),
                );
            }

            let rescue_hosts: Vec<String> = to_rescue.iter().map(|(h, _)| h.clone()).collect();
            let mut rescue_failures = self
                .run_list(rescue, rescue_hosts, &outer_scope, false)
                .await;
            for (host, _) in to_rescue {
                match rescue_failures.shift_remove(&host) {
                    Some(result) => {
                        dropped.insert(host, result);
                    }
                    None => {
                        debug!(host = %host, block = %name, "Block rescued");
                        self.play.stats.lock().record_rescued(&host);
                    }
                }
            }
        }

        if !always.is_empty() {
            let always_hosts: Vec<String> = entering
                .into_iter()
                .filter(|h| !dropped.get(h).is_some_and(|r| r.unreachable))
                .collect();
            let always_failures = self
                .run_list(always, always_hosts, &outer_scope, false)
                .await;
            dropped.extend(always_failures);
        }

        failures.extend(dropped);
        failures
    }

    /// Evaluate the block's `when` once per host; returns the hosts that
    /// enter the block.
    async fn evaluate_entry(
        &self,
        task: &Task,
        hosts: &[String],
        ignore_errors: bool,
        failures: &mut Failures,
    ) -> Vec<String> {
        if task.when.is_empty() {
            return hosts.to_vec();
        }

        let name = task.display_name();
        let hostvars = self.play.scope.hostvars();
        let mut entering = Vec::with_capacity(hosts.len());
        for host in hosts {
            let ctx = self.play.scope.context_with(host, &hostvars);
            match self.dispatcher.templates.evaluate_all(&task.when, &ctx) {
                Ok(true) => entering.push(host.clone()),
                Ok(false) => {
                    debug!(host = %host, block = %name, "Block condition false, skipping");
                    let result = TaskResult::skipped(host, &name);
                    self.play.stats.lock().record(&result, false);
                    self.callback.on_task_complete(&result).await;
                }
                Err(e) => {
                    let mut result =
                        TaskResult::failure(host, &name, FailureKind::TemplateError, e.to_string());
                    result.ignored = ignore_errors;
                    self.play.stats.lock().record(&result, false);
                    self.callback.on_task_complete(&result).await;
                    if result.is_fatal() {
                        failures.insert(host.clone(), result);
                    }
                }
            }
        }
        entering
    }
}
