//! Line-in-file module - Manage lines in text files
//!
//! This module ensures a particular line is in a file, or replaces an existing
//! line matched by a regular expression. The file is read through the
//! connection, edited in memory and written back only when it changed.

use async_trait::async_trait;
use regex::Regex;

use super::copy::{read_remote, write_content};
use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams,
    ModuleResult, ParamExt,
};

/// Desired state for a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Present,
    Absent,
}

impl LineState {
    fn parse(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "present" => Ok(LineState::Present),
            "absent" => Ok(LineState::Absent),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: present, absent",
                s
            ))),
        }
    }
}

/// Where to insert a new line
#[derive(Debug, Clone)]
pub enum InsertPosition {
    /// After the last line matching the regex (end of file if none)
    After(Regex),
    /// Before the last line matching the regex (end of file if none)
    Before(Regex),
    /// At the beginning of file
    BeginningOfFile,
    /// At the end of file (default)
    EndOfFile,
}

fn compile(pattern: &str) -> ModuleResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| ModuleError::InvalidParameter(format!("invalid regex '{}': {}", pattern, e)))
}

impl InsertPosition {
    fn from_params(params: &ModuleParams) -> ModuleResult<Self> {
        if let Some(before) = params.get_string("insertbefore")? {
            return Ok(match before.as_str() {
                "BOF" => InsertPosition::BeginningOfFile,
                pattern => InsertPosition::Before(compile(pattern)?),
            });
        }
        Ok(match params.get_string("insertafter")?.as_deref() {
            None | Some("EOF") => InsertPosition::EndOfFile,
            Some(pattern) => InsertPosition::After(compile(pattern)?),
        })
    }

    fn index(&self, lines: &[String]) -> usize {
        let last_match = |re: &Regex| lines.iter().rposition(|l| re.is_match(l));
        match self {
            InsertPosition::BeginningOfFile => 0,
            InsertPosition::EndOfFile => lines.len(),
            InsertPosition::After(re) => last_match(re).map(|i| i + 1).unwrap_or(lines.len()),
            InsertPosition::Before(re) => last_match(re).unwrap_or(lines.len()),
        }
    }
}

/// The in-memory edit: returns the message describing what changed, if anything
pub fn edit_lines(
    lines: &mut Vec<String>,
    state: LineState,
    line: Option<&str>,
    regexp: Option<&Regex>,
    position: &InsertPosition,
) -> Option<String> {
    match state {
        LineState::Absent => {
            let before = lines.len();
            lines.retain(|l| {
                let by_regex = regexp.map(|re| re.is_match(l)).unwrap_or(false);
                let by_line = line.map(|wanted| wanted == l).unwrap_or(false);
                !(by_regex || by_line)
            });
            let removed = before - lines.len();
            (removed > 0).then(|| format!("{} line(s) removed", removed))
        }
        LineState::Present => {
            let line = line?;
            if let Some(re) = regexp {
                if let Some(i) = lines.iter().rposition(|l| re.is_match(l)) {
                    if lines[i] == line {
                        return None;
                    }
                    lines[i] = line.to_string();
                    return Some("line replaced".to_string());
                }
            }
            if lines.iter().any(|l| l == line) {
                return None;
            }
            let index = position.index(lines);
            lines.insert(index, line.to_string());
            Some("line added".to_string())
        }
    }
}

/// Module for line-in-file operations
pub struct LineinfileModule;

#[async_trait]
impl Module for LineinfileModule {
    fn name(&self) -> &'static str {
        "lineinfile"
    }


    fn required_params(&self) -> &[&'static str] {
        &["path"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let state = match params.get_string("state")? {
            Some(s) => LineState::parse(&s)?,
            None => LineState::Present,
        };
        if state == LineState::Present && !params.contains_key("line") {
            return Err(ModuleError::MissingParameter(
                "line is required with state=present".to_string(),
            ));
        }
        if state == LineState::Absent && !params.contains_key("line") && !params.contains_key("regexp") {
            return Err(ModuleError::MissingParameter(
                "one of line or regexp is required with state=absent".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;
        let state = match params.get_string("state")? {
            Some(s) => LineState::parse(&s)?,
            None => LineState::Present,
        };
        let line = params.get_string("line")?;
        let regexp = params.get_string("regexp")?.map(|p| compile(&p)).transpose()?;
        let position = InsertPosition::from_params(params)?;

        let content = match read_remote(self.name(), context, &path).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None if state == LineState::Absent => return Ok(ModuleOutput::ok("file not present")),
            None if params.get_bool_or("create", false) => String::new(),
            None => {
                return Ok(ModuleOutput::failed(format!(
                    "Destination {} does not exist !",
                    path
                )))
            }
        };

        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let msg = edit_lines(&mut lines, state, line.as_deref(), regexp.as_ref(), &position);

        let mut new_content = lines.join("\n");
        if !lines.is_empty() {
            new_content.push('\n');
        }
        let mut output = write_content(self.name(), context, new_content.as_bytes(), &path, params).await?;
        if let Some(msg) = msg {
            output.msg = msg;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnection;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn lines(s: &[&str]) -> Vec<String> {
        s.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_replace_by_regexp() {
        let mut content = lines(&["Port 22", "PermitRootLogin yes"]);
        let re = Regex::new("^PermitRootLogin").unwrap();
        let msg = edit_lines(
            &mut content,
            LineState::Present,
            Some("PermitRootLogin no"),
            Some(&re),
            &InsertPosition::EndOfFile,
        );
        assert_eq!(msg.as_deref(), Some("line replaced"));
        assert_eq!(content, lines(&["Port 22", "PermitRootLogin no"]));

        let again = edit_lines(
            &mut content,
            LineState::Present,
            Some("PermitRootLogin no"),
            Some(&re),
            &InsertPosition::EndOfFile,
        );
        assert!(again.is_none());
    }

    #[test]
    fn test_insert_positions() {
        let mut content = lines(&["[main]", "a=1", "[other]"]);
        let after = InsertPosition::After(Regex::new(r"^\[main\]").unwrap());
        edit_lines(&mut content, LineState::Present, Some("b=2"), None, &after);
        assert_eq!(content, lines(&["[main]", "b=2", "a=1", "[other]"]));

        edit_lines(
            &mut content,
            LineState::Present,
            Some("# header"),
            None,
            &InsertPosition::BeginningOfFile,
        );
        assert_eq!(content[0], "# header");
    }

    #[test]
    fn test_absent() {
        let mut content = lines(&["keep", "drop me", "drop me"]);
        let msg = edit_lines(
            &mut content,
            LineState::Absent,
            Some("drop me"),
            None,
            &InsertPosition::EndOfFile,
        );
        assert_eq!(msg.as_deref(), Some("2 line(s) removed"));
        assert_eq!(content, lines(&["keep"]));
    }

    #[tokio::test]
    async fn test_lineinfile_create() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("hosts");
        let ctx = ModuleContext::new("localhost")
            .with_connection(Arc::new(LocalConnection::new("localhost")));

        let mut params = ModuleParams::new();
        params.insert("path".to_string(), json!(path.to_str().unwrap()));
        params.insert("line".to_string(), json!("10.0.0.1 db"));

        let missing = LineinfileModule.execute(&params, &ctx).await.unwrap();
        assert!(missing.failed);

        params.insert("create".to_string(), json!(true));
        let created = LineinfileModule.execute(&params, &ctx).await.unwrap();
        assert!(created.changed);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.1 db\n");

        let again = LineinfileModule.execute(&params, &ctx).await.unwrap();
        assert!(!again.changed);
    }
}
