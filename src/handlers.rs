//! Handler notification tracking
//!
//! Handlers are tasks that run only when notified by a task that reported a
//! change. Notifications are recorded per host: a change on `web1` triggers
//! handlers on `web1` only. They are:
//!
//! - **Deduplicated**: a handler notified several times runs once per flush
//! - **Ordered by declaration**: handlers run in the order the play lists
//!   them, not in the order they were notified
//! - **Matched by name or topic**: a notification matches a handler's name
//!   or any of its `listen` topics
//!
//! ```yaml
//! handlers:
//!   - name: restart nginx
//!     listen: restart web services
//!     service:
//!       name: nginx
//!       state: restarted
//! ```

use std::collections::HashMap;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::playbook::Handler;

/// Pending notifications of the current play, per host
#[derive(Debug, Default)]
pub struct NotifiedHandlers {
    pending: Mutex<HashMap<String, IndexSet<String>>>,
}

impl NotifiedHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `host` notified `name`
    pub fn notify(&self, host: &str, name: &str) {
        debug!(host = %host, handler = %name, "Handler notified");
        self.pending
            .lock()
            .entry(host.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Whether anything is pending for any host
    pub fn is_empty(&self) -> bool {
        self.pending.lock().values().all(IndexSet::is_empty)
    }

    /// Take every pending notification, leaving the set empty
    pub fn drain(&self) -> HashMap<String, IndexSet<String>> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Forget everything (end of play)
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// For each handler in declaration order, the hosts it must run on.
///
/// `hosts` fixes the host order inside each entry. Handlers nobody
/// notified are left out. Notifications that match no handler are reported.
pub fn schedule<'h>(
    handlers: &'h [Handler],
    notified: &HashMap<String, IndexSet<String>>,
    hosts: &[String],
) -> Vec<(&'h Handler, Vec<String>)> {
    for (host, names) in notified {
        for name in names {
            if !handlers.iter().any(|h| h.answers(name)) {
                warn!(host = %host, handler = %name, "Notified handler not found");
            }
        }
    }

    handlers
        .iter()
        .filter_map(|handler| {
            let targets: Vec<String> = hosts
                .iter()
                .filter(|host| {
                    notified
                        .get(*host)
                        .map(|names| names.iter().any(|n| handler.answers(n)))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            (!targets.is_empty()).then_some((handler, targets))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::parse_handlers;
    use pretty_assertions::assert_eq;

    fn handlers() -> Vec<Handler> {
        parse_handlers(
            r#"
- name: restart nginx
  listen: restart web
  debug: msg=nginx
- name: restart app
  debug: msg=app
- name: reload firewall
  debug: msg=fw
"#,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn test_notify_dedup_and_drain() {
        let notified = NotifiedHandlers::new();
        assert!(notified.is_empty());
        notified.notify("web1", "restart app");
        notified.notify("web1", "restart app");

        let drained = notified.drain();
        assert_eq!(drained["web1"].iter().collect::<Vec<_>>(), vec!["restart app"]);
        assert!(!drained.contains_key("web2"));
        assert!(notified.is_empty());
    }

    #[test]
    fn test_schedule_follows_declaration_order() {
        let handlers = handlers();
        let notified = NotifiedHandlers::new();
        notified.notify("web2", "reload firewall");
        notified.notify("web1", "restart app");
        notified.notify("web1", "restart web");
        notified.notify("web1", "unknown");

        let hosts = vec!["web1".to_string(), "web2".to_string()];
        let plan = schedule(&handlers, &notified.drain(), &hosts);
        let plan: Vec<(String, Vec<String>)> = plan
            .into_iter()
            .map(|(h, hosts)| (h.task.name.clone(), hosts))
            .collect();

        assert_eq!(
            plan,
            vec![
                ("restart nginx".to_string(), vec!["web1".to_string()]),
                ("restart app".to_string(), vec!["web1".to_string()]),
                ("reload firewall".to_string(), vec!["web2".to_string()]),
            ]
        );
    }

    #[test]
    fn test_schedule_skips_inactive_hosts() {
        let handlers = handlers();
        let notified = NotifiedHandlers::new();
        notified.notify("gone", "restart app");
        let plan = schedule(&handlers, &notified.drain(), &["web1".to_string()]);
        assert!(plan.is_empty());
    }
}
