//! The contract every task kind implements, and the registry that turns
//! declarations into tasks.
//!
//! A task describes desired state. The engine never performs effects itself:
//! it asks the task what currently exists ([`Task::find`]), what differs
//! ([`Task::changes`]), and then calls exactly one render entry chosen by the
//! active [`Target`](crate::target::Target). See [`delta_run`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::planner::TaskDecl;
use crate::target::{BootScriptTarget, LocalTarget};

mod changes;
mod delta;

pub use changes::{ChangeSet, FieldChange};
pub use delta::{Outcome, delta_run};

/// Result of state discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered<A> {
    Present(A),
    Absent,
    /// Checking current state is not implemented for this resource kind.
    Unknown,
}

pub trait Task: Send + Sync + 'static {
    type Actual: Send;

    fn describe(&self) -> String;

    /// Inspects the environment. Must not change it.
    fn find(&self, ctx: &Context) -> Result<Discovered<Self::Actual>>;

    /// Pure comparison of `actual` against `self`. Empty means converged.
    fn changes(&self, actual: Option<&Self::Actual>) -> Result<ChangeSet>;

    fn render_local(
        &self,
        ctx: &Context,
        target: &LocalTarget,
        actual: Option<&Self::Actual>,
        changes: &ChangeSet,
    ) -> Result<()>;

    fn render_boot_script(
        &self,
        ctx: &Context,
        target: &BootScriptTarget,
        actual: Option<&Self::Actual>,
        changes: &ChangeSet,
    ) -> Result<()>;
}

/// Object-safe face of [`Task`] used by the graph.
pub trait Reconcile: Send + Sync {
    fn describe(&self) -> String;
    fn reconcile(&self, ctx: &Context) -> Result<Outcome>;
}

impl<T: Task> Reconcile for T {
    fn describe(&self) -> String {
        Task::describe(self)
    }

    fn reconcile(&self, ctx: &Context) -> Result<Outcome> {
        delta_run(self, ctx)
    }
}

pub type TaskCtor = fn(&TaskDecl) -> Result<Arc<dyn Reconcile>>;

#[derive(Default)]
pub struct TaskRegistry {
    ctors: BTreeMap<&'static str, TaskCtor>,
}

impl TaskRegistry {
    pub fn add(&mut self, kind: &'static str, ctor: TaskCtor) -> Result<()> {
        if self.ctors.contains_key(kind) {
            return Err(Error::msg(format!("duplicate task kind '{kind}'")));
        }
        self.ctors.insert(kind, ctor);
        Ok(())
    }

    pub fn register(&mut self, catalog: &dyn Catalog) -> Result<()> {
        catalog.register_tasks(self)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ctors.keys().copied()
    }

    pub fn build(&self, decl: &TaskDecl) -> Result<Arc<dyn Reconcile>> {
        let Some(ctor) = self.ctors.get(decl.kind.as_str()) else {
            return Err(Error::UnknownKind {
                task: decl.id.clone(),
                kind: decl.kind.clone(),
            });
        };
        ctor(decl)
    }
}

/// A named group of task kinds.
pub trait Catalog {
    fn id(&self) -> &'static str;
    fn kinds(&self) -> Vec<&'static str>;
    fn register_tasks(&self, reg: &mut TaskRegistry) -> Result<()>;
}
