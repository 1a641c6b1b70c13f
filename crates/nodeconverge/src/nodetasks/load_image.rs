use std::process::Command;

use serde::Deserialize;

use nodeconverge_macros::Task;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::target::{BootScriptTarget, LocalTarget, TargetKind};
use crate::task::{ChangeSet, Discovered};

/// A container image archive loaded into the local docker daemon.
#[Task(kind = "load_image", label = "LoadImage", describe = "source")]
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadImage {
    pub source: String,
    pub hash: String,
    /// Reference the archive provides, e.g. "registry.k8s.io/pause:3.9".
    /// Without it the runtime cannot be asked whether the image is present.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageState {
    pub id: String,
}

impl LoadImage {
    fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::msg("'source' is empty"));
        }
        if matches!(self.image.as_deref(), Some(i) if i.trim().is_empty()) {
            return Err(Error::msg("'image' is empty"));
        }
        self.content_hash().map(|_| ())
    }

    fn content_hash(&self) -> Result<ContentHash> {
        self.hash.parse()
    }
}

impl crate::task::Task for LoadImage {
    type Actual = ImageState;

    fn describe(&self) -> String {
        self.default_description()
    }

    fn find(&self, ctx: &Context) -> Result<Discovered<ImageState>> {
        let Some(image) = self.image.as_deref() else {
            return Ok(Discovered::Unknown);
        };
        let mut cmd = Command::new("docker");
        cmd.args(["image", "inspect", "--format", "{{.Id}}", image]);
        let out = ctx.runner().run(cmd)?;
        if !out.success {
            return Ok(Discovered::Absent);
        }
        let id = out.lines.first().cloned().unwrap_or_default();
        Ok(Discovered::Present(ImageState { id }))
    }

    fn changes(&self, actual: Option<&ImageState>) -> Result<ChangeSet> {
        let mut changes = ChangeSet::new();
        if actual.is_none() {
            let wanted = self.image.clone().unwrap_or_else(|| self.source.clone());
            changes.record("image", None, wanted);
        }
        Ok(changes)
    }

    fn render_local(
        &self,
        ctx: &Context,
        target: &LocalTarget,
        _actual: Option<&ImageState>,
        _changes: &ChangeSet,
    ) -> Result<()> {
        let archive = ctx.cache().fetch(&self.source, &self.content_hash()?)?;
        let mut cmd = Command::new("docker");
        cmd.arg("load").arg("-i").arg(&archive);
        target.run(cmd)?;
        Ok(())
    }

    fn render_boot_script(
        &self,
        _ctx: &Context,
        _target: &BootScriptTarget,
        _actual: Option<&ImageState>,
        _changes: &ChangeSet,
    ) -> Result<()> {
        Err(Error::unsupported(
            self.default_description(),
            TargetKind::BootScriptEmission,
        ))
    }
}
