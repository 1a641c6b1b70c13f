use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::runner::{self, CommandRunner};

/// How the changes of a run are realized. Chosen once, before the run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Apply effects to the running machine.
    #[default]
    LocalExecution,
    /// Append effects to a script run at first boot of a new machine.
    BootScriptEmission,
    /// Report what would change without rendering anything.
    DryRun,
}

impl TargetKind {
    pub fn name(self) -> &'static str {
        match self {
            TargetKind::LocalExecution => "local-execution",
            TargetKind::BootScriptEmission => "boot-script-emission",
            TargetKind::DryRun => "dry-run",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub enum Target {
    Local(LocalTarget),
    BootScript(BootScriptTarget),
    DryRun,
}

impl Target {
    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Local(_) => TargetKind::LocalExecution,
            Target::BootScript(_) => TargetKind::BootScriptEmission,
            Target::DryRun => TargetKind::DryRun,
        }
    }
}

pub struct LocalTarget {
    runner: Arc<dyn CommandRunner>,
}

impl LocalTarget {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn run(&self, cmd: std::process::Command) -> Result<Vec<String>> {
        runner::run_checked(self.runner.as_ref(), cmd)
    }
}

#[derive(Debug, Clone)]
struct ScriptSection {
    task: String,
    lines: Vec<String>,
}

/// Collects shell sections in the order tasks render them. Tasks only render
/// after their dependencies finished, so that order respects the graph.
#[derive(Default)]
pub struct BootScriptTarget {
    sections: Mutex<Vec<ScriptSection>>,
}

impl BootScriptTarget {
    pub fn add_section(&self, task: &str, lines: Vec<String>) {
        let mut sections = self.sections.lock().unwrap_or_else(|p| p.into_inner());
        sections.push(ScriptSection {
            task: task.to_string(),
            lines,
        });
    }

    pub fn add_command(&self, task: &str, args: &[&str]) {
        let line = args.iter().map(|a| sh_quote(a)).collect::<Vec<_>>().join(" ");
        self.add_section(task, vec![line]);
    }

    pub fn is_empty(&self) -> bool {
        self.sections
            .lock()
            .map(|s| s.is_empty())
            .unwrap_or(true)
    }

    pub fn script(&self) -> String {
        let sections = self.sections.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = String::from("#!/bin/bash\nset -o errexit\nset -o nounset\nset -o pipefail\n");
        for s in sections.iter() {
            out.push('\n');
            out.push_str(&format!("# {}\n", s.task.replace('\n', " ")));
            for line in &s.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::msg(format!("failed to create dir {}: {e}", parent.display()))
            })?;
        }
        fs::write(path, self.script())
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| {
                Error::msg(format!("failed to chmod {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}

pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
