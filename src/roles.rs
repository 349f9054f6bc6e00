//! Role loading for Ansirun
//!
//! A role is a directory holding reusable tasks, handlers and variables:
//!
//! ```text
//! roles/<name>/
//!   defaults/main.yml   # lowest precedence vars (optional)
//!   vars/main.yml       # role vars (optional)
//!   tasks/main.yml      # task list (required)
//!   handlers/main.yml   # handlers (optional)
//!   files/ templates/   # looked up by copy and template
//! ```
//!
//! Roles are searched in `<playbook_dir>/roles/<name>`, then `./roles/<name>`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::playbook::{self, Handler, PlaybookError, RoleOrigin, Task};
use crate::vars::VarMap;

/// Errors raised while loading a role
#[derive(Error, Debug)]
pub enum RoleError {
    #[error("role '{name}' not found (searched: {})", display_paths(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },

    #[error("role '{name}' has no tasks file '{file}' in {}", .path.display())]
    MissingTasks {
        name: String,
        file: String,
        path: PathBuf,
    },

    #[error("role '{name}': {source}")]
    Playbook {
        name: String,
        #[source]
        source: PlaybookError,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for role loading
pub type RoleResult<T> = Result<T, RoleError>;

/// Locate `<dir>/<stem>.yaml`, then `<dir>/<stem>.yml`.
///
/// A stem that already carries an extension is tried as written first.
pub fn find_yaml(dir: &Path, stem: &str) -> Option<PathBuf> {
    let written = dir.join(stem);
    if Path::new(stem).extension().is_some() && written.is_file() {
        return Some(written);
    }
    ["yaml", "yml"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

/// A role loaded from disk
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    /// Resolved role directory
    pub path: PathBuf,
    /// Variables from `defaults/main`
    pub defaults: VarMap,
    /// Variables from `vars/main`
    pub vars: VarMap,
    /// Tasks, each tagged with this role as origin
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
}

impl Role {
    /// Candidate directories for a role name
    pub fn search_paths(name: &str, playbook_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![playbook_dir.join("roles").join(name)];
        let local = PathBuf::from("roles").join(name);
        if !paths.contains(&local) {
            paths.push(local);
        }
        paths
    }

    /// Find the directory of a role
    pub fn find(name: &str, playbook_dir: &Path) -> RoleResult<PathBuf> {
        let searched = Self::search_paths(name, playbook_dir);
        searched
            .iter()
            .find(|p| p.is_dir())
            .cloned()
            .ok_or_else(|| RoleError::NotFound {
                name: name.to_string(),
                searched,
            })
    }

    /// Load a role, reading `tasks_from` instead of `tasks/main` when given
    pub fn load(name: &str, playbook_dir: &Path, tasks_from: Option<&str>) -> RoleResult<Self> {
        let path = Self::find(name, playbook_dir)?;
        debug!(role = %name, path = %path.display(), "Loading role");

        let decode_err = |source| RoleError::Playbook {
            name: name.to_string(),
            source,
        };

        let read_vars = |dir: &str| -> RoleResult<VarMap> {
            match find_yaml(&path.join(dir), "main") {
                Some(file) => Ok(playbook::read_yaml::<Option<VarMap>>(&file)
                    .map_err(decode_err)?
                    .unwrap_or_default()),
                None => Ok(VarMap::new()),
            }
        };
        let defaults = read_vars("defaults")?;
        let vars = read_vars("vars")?;

        let tasks_stem = tasks_from.unwrap_or("main");
        let tasks_file =
            find_yaml(&path.join("tasks"), tasks_stem).ok_or_else(|| RoleError::MissingTasks {
                name: name.to_string(),
                file: tasks_stem.to_string(),
                path: path.clone(),
            })?;

        let origin = RoleOrigin {
            name: name.to_string(),
            path: path.clone(),
        };

        let content = read_file(&tasks_file).map_err(decode_err)?;
        let mut tasks = playbook::parse_tasks(&content, &tasks_file.display().to_string())
            .map_err(decode_err)?;
        for task in &mut tasks {
            task.set_role(&origin);
        }

        let mut handlers = match find_yaml(&path.join("handlers"), "main") {
            Some(file) => {
                let content = read_file(&file).map_err(decode_err)?;
                playbook::parse_handlers(&content, &file.display().to_string())
                    .map_err(decode_err)?
            }
            None => Vec::new(),
        };
        for handler in &mut handlers {
            handler.task.set_role(&origin);
        }

        Ok(Self {
            name: name.to_string(),
            path,
            defaults,
            vars,
            tasks,
            handlers,
        })
    }

    /// Directory task includes inside this role resolve against
    pub fn tasks_dir(&self) -> PathBuf {
        self.path.join("tasks")
    }
}

fn read_file(path: &Path) -> Result<String, PlaybookError> {
    std::fs::read_to_string(path).map_err(|source| PlaybookError::Read {
        path: path.display().to_string(),
        source,
    })
}
