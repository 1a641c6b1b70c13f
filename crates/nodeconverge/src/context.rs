use std::sync::Arc;

use crate::fetch::FetchCache;
use crate::runner::CommandRunner;
use crate::target::{BootScriptTarget, LocalTarget, Target, TargetKind};
use crate::workspace::WorkspacePaths;

/// Everything a task may use during one run. Built before the run starts,
/// shared read-only by all workers, dropped when the run ends.
pub struct Context {
    target: Target,
    cache: FetchCache,
    paths: WorkspacePaths,
    runner: Arc<dyn CommandRunner>,
    strict_discovery: bool,
}

impl Context {
    pub fn new(
        kind: TargetKind,
        cache: FetchCache,
        paths: WorkspacePaths,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let target = match kind {
            TargetKind::LocalExecution => Target::Local(LocalTarget::new(Arc::clone(&runner))),
            TargetKind::BootScriptEmission => Target::BootScript(BootScriptTarget::default()),
            TargetKind::DryRun => Target::DryRun,
        };
        Self {
            target,
            cache,
            paths,
            runner,
            strict_discovery: false,
        }
    }

    pub fn with_strict_discovery(mut self, strict: bool) -> Self {
        self.strict_discovery = strict;
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Runner for read-only commands during discovery. Effects go through the target.
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn strict_discovery(&self) -> bool {
        self.strict_discovery
    }

    pub fn into_target(self) -> Target {
        self.target
    }
}
