use thiserror::Error;

use crate::target::TargetKind;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Msg(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("{task}: render for target '{target}' is not implemented")]
    UnsupportedTarget { task: String, target: TargetKind },

    #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
    Verification {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("{reason}{}", output_suffix(.output))]
    Render { reason: String, output: Vec<String> },

    #[error("task graph contains a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency { task: String, dep: String },

    #[error("duplicate task id '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' has unknown kind '{kind}'")]
    UnknownKind { task: String, kind: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn unsupported(task: impl Into<String>, target: TargetKind) -> Self {
        Self::UnsupportedTarget {
            task: task.into(),
            target,
        }
    }

    /// Short machine-readable name, used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Msg(_) => "error",
            Self::Discovery(_) => "discovery",
            Self::UnsupportedTarget { .. } => "unsupported_target",
            Self::Verification { .. } => "verification",
            Self::Render { .. } => "render",
            Self::Cycle(_) => "cycle",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::DuplicateTask(_) => "duplicate_task",
            Self::UnknownKind { .. } => "unknown_kind",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// Graph validation failures abort the whole run before anything executes.
    pub fn is_build_time(&self) -> bool {
        matches!(
            self,
            Self::Cycle(_)
                | Self::UnknownDependency { .. }
                | Self::DuplicateTask(_)
                | Self::UnknownKind { .. }
                | Self::Config(_)
        )
    }
}

fn output_suffix(output: &[String]) -> String {
    const TAIL: usize = 20;
    if output.is_empty() {
        return String::new();
    }
    let skip = output.len().saturating_sub(TAIL);
    format!(": {}", output[skip..].join("\n"))
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_error_includes_output_tail() {
        let output: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
        let err = Error::Render {
            reason: "docker load failed".into(),
            output,
        };
        let text = err.to_string();
        assert!(text.starts_with("docker load failed: line 10"), "{text}");
        assert!(text.ends_with("line 29"));
    }

    #[test]
    fn cycle_error_names_members() {
        let err = Error::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "task graph contains a cycle: a -> b -> a");
        assert!(err.is_build_time());
    }
}
