//! Per-run variable scope.
//!
//! The scope owns every variable layer of a run and rebuilds a host's full
//! context on demand:
//!
//! ```text
//! inventory (all → groups → host)
//!   └── play vars (role defaults filled in, role vars on top)
//!         └── facts (gathered + set_fact)
//!               └── registered results
//!                     └── extra vars (-e)
//! ```
//!
//! Facts and registered results live in per-host fragments. Only the worker
//! running a host writes that host's fragment; other hosts read it through
//! the `hostvars` snapshot taken when a context is built.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

use super::{merge_into, JsonValue, VarMap};
use crate::inventory::Inventory;

/// Facts and registered results of one host
#[derive(Debug, Clone, Default)]
struct HostFragment {
    facts: VarMap,
    registered: VarMap,
}

/// Play-level state shared by every host
#[derive(Debug, Clone, Default)]
struct PlayLayer {
    vars: VarMap,
    active_hosts: Vec<String>,
    playbook_dir: Option<PathBuf>,
}

/// Layered variable storage for a run
#[derive(Debug)]
pub struct VariableScope {
    inventory: Arc<Inventory>,
    extra_vars: VarMap,
    play: RwLock<PlayLayer>,
    hosts: DashMap<String, HostFragment>,
}

impl VariableScope {
    /// Create a scope over an inventory with command-line extra vars
    pub fn new(inventory: Arc<Inventory>, extra_vars: VarMap) -> Self {
        Self {
            inventory,
            extra_vars,
            play: RwLock::new(PlayLayer::default()),
            hosts: DashMap::new(),
        }
    }

    /// The inventory this scope resolves hosts against
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Reset the play layer for a new play.
    ///
    /// Facts and registered results are dropped unless `carry` is set.
    pub fn begin_play(&self, vars: VarMap, playbook_dir: Option<PathBuf>, carry: bool) {
        let mut play = self.play.write();
        play.vars = vars;
        play.playbook_dir = playbook_dir;
        play.active_hosts.clear();
        drop(play);

        if !carry {
            self.hosts.clear();
        }
    }

    /// Replace the list of hosts still active in the play
    pub fn set_active_hosts(&self, hosts: Vec<String>) {
        self.play.write().active_hosts = hosts;
    }

    /// Directory of the playbook being run, if any
    pub fn playbook_dir(&self) -> Option<PathBuf> {
        self.play.read().playbook_dir.clone()
    }

    /// Register a task result under `key` for `host`
    pub fn set(&self, host: &str, key: impl Into<String>, value: JsonValue) {
        self.hosts
            .entry(host.to_string())
            .or_default()
            .registered
            .insert(key.into(), value);
    }

    /// Merge a fact mapping into `host`'s facts
    pub fn set_all(&self, host: &str, facts: &VarMap) {
        let mut fragment = self.hosts.entry(host.to_string()).or_default();
        merge_into(&mut fragment.facts, facts);
    }

    /// Variables of `host` without `hostvars`, used for the snapshot of
    /// every host and as the base of [`context_with`](Self::context_with).
    pub fn host_layers(&self, host: &str) -> VarMap {
        let mut vars = self.inventory.host_vars(host).unwrap_or_default();

        merge_into(&mut vars, &self.play.read().vars);

        let fragment = self.hosts.get(host).map(|f| f.value().clone()).unwrap_or_default();
        merge_into(&mut vars, &fragment.facts);
        merge_into(&mut vars, &fragment.registered);
        merge_into(&mut vars, &self.extra_vars);

        vars.insert(
            "ansible_facts".to_string(),
            JsonValue::Object(collect_ansible_facts(&fragment.facts)),
        );
        self.insert_host_magic(host, &mut vars);
        vars
    }

    /// Layers of every inventory host, keyed by name.
    ///
    /// Built once per task and shared by all of its host workers.
    pub fn hostvars(&self) -> Arc<VarMap> {
        let snapshot = self
            .inventory
            .hosts()
            .map(|h| (h.name.clone(), JsonValue::Object(self.host_layers(&h.name))))
            .collect();
        Arc::new(snapshot)
    }

    /// Full template context for `host`
    pub fn context(&self, host: &str) -> VarMap {
        self.context_with(host, &self.hostvars())
    }

    /// Full template context for `host` over a prebuilt `hostvars` snapshot.
    ///
    /// The host's own entry is refreshed so facts it set since the snapshot
    /// are visible through `hostvars` too.
    pub fn context_with(&self, host: &str, hostvars: &VarMap) -> VarMap {
        let mut vars = self.host_layers(host);

        let mut snapshot = hostvars.clone();
        if let Some(own) = snapshot.get_mut(host) {
            *own = JsonValue::Object(vars.clone());
        }
        vars.insert("hostvars".to_string(), JsonValue::Object(snapshot));

        let groups: VarMap = self
            .inventory
            .group_members()
            .into_iter()
            .map(|(group, members)| (group, JsonValue::from(members)))
            .collect();
        vars.insert("groups".to_string(), JsonValue::Object(groups));

        let play = self.play.read();
        let active = JsonValue::from(play.active_hosts.clone());
        vars.insert("ansible_play_hosts".to_string(), active.clone());
        vars.insert("ansible_play_batch".to_string(), active);
        if let Some(dir) = &play.playbook_dir {
            vars.insert(
                "playbook_dir".to_string(),
                JsonValue::String(dir.display().to_string()),
            );
        }

        vars
    }

    fn insert_host_magic(&self, host: &str, vars: &mut VarMap) {
        vars.insert(
            "inventory_hostname".to_string(),
            JsonValue::String(host.to_string()),
        );
        let short = host.split('.').next().unwrap_or(host);
        vars.insert(
            "inventory_hostname_short".to_string(),
            JsonValue::String(short.to_string()),
        );

        if let Some(entry) = self.inventory.get_host(host) {
            vars.insert(
                "ansible_host".to_string(),
                JsonValue::String(entry.address().to_string()),
            );
            vars.insert(
                "group_names".to_string(),
                JsonValue::from(self.inventory.group_names(entry)),
            );
        } else {
            vars.entry("ansible_host".to_string())
                .or_insert_with(|| JsonValue::String(host.to_string()));
            vars.insert("group_names".to_string(), JsonValue::Array(Vec::new()));
        }
    }
}

/// `ansible_facts` mirrors gathered facts without their `ansible_` prefix,
/// plus any explicit `ansible_facts` mapping a module returned.
fn collect_ansible_facts(facts: &VarMap) -> VarMap {
    let mut out = VarMap::new();
    for (key, value) in facts {
        if key == "ansible_facts" {
            if let JsonValue::Object(map) = value {
                merge_into(&mut out, map);
            }
        } else if let Some(stripped) = key.strip_prefix("ansible_") {
            out.insert(stripped.to_string(), value.clone());
        }
    }
    out
}
