use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::{ConfigDoc, RunConfig};
use crate::context::Context;
use crate::error::Result;
use crate::executor::{self, ExecSink, RunReport};
use crate::fetch::{CacheEntry, Downloader, FetchCache, FetchConfig, HttpDownloader};
use crate::nodetasks::builtin_registry;
use crate::planner::{Plan, TaskGraph};
use crate::runner::{CommandRunner, ProcessRunner};
use crate::target::{Target, TargetKind};
use crate::task::TaskRegistry;
use crate::workspace;

/// Command-line overrides for the `[run]` section.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub target: Option<TargetKind>,
    pub max_parallel: Option<usize>,
}

pub struct RunOutput {
    pub report: RunReport,
    /// Set when the boot-script target wrote a script.
    pub boot_script: Option<PathBuf>,
}

/// Everything needed to converge one run file. The defaults talk to the real
/// system; tests swap in fakes.
pub struct Engine {
    registry: TaskRegistry,
    downloader: Option<Arc<dyn Downloader>>,
    runner: Arc<dyn CommandRunner>,
}

impl Engine {
    pub fn new() -> Result<Self> {
        Ok(Self {
            registry: builtin_registry()?,
            downloader: None,
            runner: Arc::new(ProcessRunner),
        })
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    fn downloader(&self, cfg: &FetchConfig) -> Result<Arc<dyn Downloader>> {
        Ok(match &self.downloader {
            Some(d) => Arc::clone(d),
            None => Arc::new(HttpDownloader::new(cfg)?),
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Builds and validates the task graph. Nothing touches the system.
    pub fn plan(&self, cfg: &RunConfig) -> Result<TaskGraph> {
        Plan::from_decls(&cfg.tasks, &self.registry)?.build()
    }

    pub fn converge(
        &self,
        doc: &ConfigDoc,
        opts: &RunOptions,
        sink: &dyn ExecSink,
    ) -> Result<RunOutput> {
        let cfg = doc.run_config()?;
        let graph = self.plan(&cfg)?;

        let base = doc.base_dir();
        let paths = workspace::init_dirs(&cfg.workspace, &base)?;
        let cache = FetchCache::new(paths.cache_dir.clone(), self.downloader(&cfg.fetch)?);
        let boot_script_path = paths.resolve_under_work(&cfg.run.boot_script)?;

        let kind = opts.target.unwrap_or(cfg.run.target);
        let workers = match opts.max_parallel.unwrap_or(cfg.run.max_parallel) {
            0 => num_cpus::get().max(1),
            n => n,
        };
        info!(run_target = %kind, tasks = graph.len(), workers, "starting run");

        let ctx = Context::new(kind, cache, paths, Arc::clone(&self.runner))
            .with_strict_discovery(cfg.run.strict_discovery);
        let report = executor::execute(&graph, &ctx, sink, workers);

        let mut boot_script = None;
        if let Target::BootScript(script) = ctx.into_target() {
            script.write_to(&boot_script_path)?;
            info!(path = %boot_script_path.display(), "wrote boot script");
            boot_script = Some(boot_script_path);
        }
        Ok(RunOutput {
            report,
            boot_script,
        })
    }

    /// Re-hashes the fetch cache of a run file.
    pub fn verify_cache(&self, doc: &ConfigDoc, prune: bool) -> Result<Vec<CacheEntry>> {
        let cfg = doc.run_config()?;
        let paths = workspace::load_paths(&cfg.workspace, &doc.base_dir())?;
        FetchCache::new(paths.cache_dir, self.downloader(&cfg.fetch)?).verify(prune)
    }
}

/// Converges `doc` with the built-in task kinds against the real system.
pub fn converge(doc: &ConfigDoc, opts: &RunOptions, sink: &dyn ExecSink) -> Result<RunOutput> {
    Engine::new()?.converge(doc, opts, sink)
}
