use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ChangeSet, Discovered, Task};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::target::Target;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Outcome {
    pub changes: ChangeSet,
    /// False for converged tasks and for dry runs.
    pub applied: bool,
}

impl Outcome {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Discover, diff, and render through the active target.
///
/// Identical for every task kind; only the task-supplied operations vary.
/// Boot-script emission targets a machine that does not exist yet, so
/// discovery is skipped there and every task renders in full.
pub fn delta_run<T: Task + ?Sized>(task: &T, ctx: &Context) -> Result<Outcome> {
    let label = Task::describe(task);

    let discovered = if matches!(ctx.target(), Target::BootScript(_)) {
        debug!(task = %label, "boot-script emission; skipping discovery");
        None
    } else {
        Some(task.find(ctx).map_err(into_discovery)?)
    };
    let (actual, unknown) = match discovered {
        None => (None, true),
        Some(Discovered::Present(a)) => (Some(a), false),
        Some(Discovered::Absent) => (None, false),
        Some(Discovered::Unknown) => {
            if ctx.strict_discovery() {
                return Err(Error::Discovery(format!(
                    "{label}: checking current state is not implemented"
                )));
            }
            warn!(task = %label, "checking current state not implemented; rendering unconditionally");
            (None, true)
        }
    };

    let changes = if unknown {
        ChangeSet::unconditional()
    } else {
        task.changes(actual.as_ref())?
    };
    if changes.is_empty() {
        debug!(task = %label, "already converged");
        return Ok(Outcome {
            changes,
            applied: false,
        });
    }

    match ctx.target() {
        Target::Local(t) => task
            .render_local(ctx, t, actual.as_ref(), &changes)
            .map_err(into_render)?,
        Target::BootScript(t) => task
            .render_boot_script(ctx, t, actual.as_ref(), &changes)
            .map_err(into_render)?,
        Target::DryRun => {
            info!(task = %label, changes = %changes.summary(), "would change");
            return Ok(Outcome {
                changes,
                applied: false,
            });
        }
    }

    info!(task = %label, changes = %changes.summary(), run_target = %ctx.target().kind(), "applied");
    Ok(Outcome {
        changes,
        applied: true,
    })
}

fn into_discovery(e: Error) -> Error {
    match e {
        Error::Discovery(_) => e,
        other => Error::Discovery(other.to_string()),
    }
}

fn into_render(e: Error) -> Error {
    match e {
        Error::Msg(reason) => Error::Render {
            reason,
            output: Vec::new(),
        },
        Error::Io(io) => Error::Render {
            reason: io.to_string(),
            output: Vec::new(),
        },
        other => other,
    }
}
