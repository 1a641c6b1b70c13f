use std::fs;
use std::io::Write;
use std::path::Path;

use base64::Engine as _;
use serde::Deserialize;

use nodeconverge_macros::Task;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::fetch::DEFAULT_ALGORITHM;
use crate::hash::{ContentHash, HashAlgorithm};
use crate::target::{BootScriptTarget, LocalTarget, sh_quote};
use crate::task::{ChangeSet, Discovered};

const DEFAULT_MODE: u32 = 0o644;
const HEREDOC_MARKER: &str = "NODECONVERGE_EOF";

/// A file with fixed content, given inline or fetched from `source`.
#[Task(kind = "file", label = "File", describe = "path")]
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub path: String,
    #[serde(default)]
    pub contents: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    /// Octal string such as "0600".
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub hash: ContentHash,
    pub mode: u32,
}

impl File {
    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::msg(format!("path '{}' must be absolute", self.path)));
        }
        match (&self.contents, &self.source, &self.hash) {
            (Some(_), None, None) => {}
            (None, Some(src), Some(_)) if !src.trim().is_empty() => {}
            (None, Some(_), None) => return Err(Error::msg("'source' requires 'hash'")),
            _ => {
                return Err(Error::msg(
                    "set either 'contents' or 'source' with 'hash'",
                ));
            }
        }
        self.desired_hash()?;
        self.mode_bits()?;
        Ok(())
    }

    fn desired_hash(&self) -> Result<ContentHash> {
        match (&self.contents, &self.hash) {
            (Some(c), _) => Ok(ContentHash::of_bytes(DEFAULT_ALGORITHM, c.as_bytes())),
            (None, Some(h)) => h.parse(),
            (None, None) => Err(Error::msg(format!("{}: no content declared", self.path))),
        }
    }

    fn mode_bits(&self) -> Result<Option<u32>> {
        let Some(raw) = self.mode.as_deref() else {
            return Ok(None);
        };
        let bits = u32::from_str_radix(raw.trim(), 8)
            .map_err(|_| Error::msg(format!("mode '{raw}' is not octal")))?;
        if bits > 0o7777 {
            return Err(Error::msg(format!("mode '{raw}' out of range")));
        }
        Ok(Some(bits))
    }

    fn write_local(&self, ctx: &Context, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| Error::msg(format!("invalid path {}", dest.display())))?;
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", parent.display())))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".converge-")
            .tempfile_in(parent)
            .map_err(|e| Error::msg(format!("failed to create temp file: {e}")))?;
        match (&self.contents, &self.source) {
            (Some(c), _) => tmp.write_all(c.as_bytes())?,
            (None, Some(src)) => {
                let cached = ctx.cache().fetch(src, &self.desired_hash()?)?;
                let mut from = fs::File::open(&cached).map_err(|e| {
                    Error::msg(format!("failed to open {}: {e}", cached.display()))
                })?;
                std::io::copy(&mut from, &mut tmp)?;
            }
            (None, None) => return Err(Error::msg(format!("{}: no content declared", self.path))),
        }
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| {
            Error::msg(format!("failed to move file into {}: {}", dest.display(), e.error))
        })?;
        Ok(())
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> u32 {
    DEFAULT_MODE
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::msg(format!("failed to chmod {}: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn checksum_tool(alg: HashAlgorithm) -> &'static str {
    match alg {
        HashAlgorithm::Sha256 => "sha256sum",
        HashAlgorithm::Sha512 => "sha512sum",
    }
}

impl crate::task::Task for File {
    type Actual = FileState;

    fn describe(&self) -> String {
        self.default_description()
    }

    fn find(&self, ctx: &Context) -> Result<Discovered<FileState>> {
        let path = ctx.paths().system_path(&self.path)?;
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Discovered::Absent),
            Err(e) => {
                return Err(Error::Discovery(format!(
                    "failed to stat {}: {e}",
                    path.display()
                )));
            }
        };
        if !meta.is_file() {
            return Err(Error::Discovery(format!(
                "{} exists but is not a regular file",
                path.display()
            )));
        }
        let desired = self.desired_hash()?;
        Ok(Discovered::Present(FileState {
            hash: ContentHash::of_file(desired.algorithm, &path)?,
            mode: mode_of(&meta),
        }))
    }

    fn changes(&self, actual: Option<&FileState>) -> Result<ChangeSet> {
        let mut changes = ChangeSet::new();
        changes.compare("contents", actual.map(|a| &a.hash), &self.desired_hash()?);
        if let Some(mode) = self.mode_bits()? {
            let current = actual.map(|a| format!("{:04o}", a.mode));
            let wanted = format!("{mode:04o}");
            if current.as_deref() != Some(wanted.as_str()) {
                changes.record("mode", current, wanted);
            }
        }
        Ok(changes)
    }

    fn render_local(
        &self,
        ctx: &Context,
        _target: &LocalTarget,
        _actual: Option<&FileState>,
        changes: &ChangeSet,
    ) -> Result<()> {
        let dest = ctx.paths().system_path(&self.path)?;
        let rewritten = changes.touches("contents");
        if rewritten {
            self.write_local(ctx, &dest)?;
        }
        // Temp files are created 0600; rewritten files without a declared mode get the default.
        match self.mode_bits()? {
            Some(mode) if rewritten || changes.touches("mode") => set_mode(&dest, mode),
            None if rewritten => set_mode(&dest, DEFAULT_MODE),
            _ => Ok(()),
        }
    }

    fn render_boot_script(
        &self,
        _ctx: &Context,
        target: &BootScriptTarget,
        _actual: Option<&FileState>,
        changes: &ChangeSet,
    ) -> Result<()> {
        let path = sh_quote(&self.path);
        let mut lines = Vec::new();
        if changes.touches("contents") {
            if let Some(dir) = Path::new(&self.path).parent() {
                lines.push(format!("install -d -m 0755 {}", sh_quote(&dir.to_string_lossy())));
            }
            match (&self.contents, &self.source) {
                (Some(c), _) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(c.as_bytes());
                    lines.push(format!("base64 -d > {path} <<'{HEREDOC_MARKER}'"));
                    for chunk in encoded.as_bytes().chunks(76) {
                        lines.push(String::from_utf8_lossy(chunk).into_owned());
                    }
                    lines.push(HEREDOC_MARKER.to_string());
                }
                (None, Some(src)) => {
                    let hash = self.desired_hash()?;
                    let tmp = sh_quote(&format!("{}.download", self.path));
                    lines.push(format!(
                        "curl -fsSL --retry 3 -o {tmp} {}",
                        sh_quote(src)
                    ));
                    lines.push(format!(
                        "echo {} | {} -c -",
                        sh_quote(&format!("{}  {}.download", hash.hex, self.path)),
                        checksum_tool(hash.algorithm)
                    ));
                    lines.push(format!("mv {tmp} {path}"));
                }
                (None, None) => {
                    return Err(Error::msg(format!("{}: no content declared", self.path)));
                }
            }
        }
        let mode = self.mode_bits()?.unwrap_or(DEFAULT_MODE);
        lines.push(format!("chmod {mode:04o} {path}"));
        target.add_section(&self.default_description(), lines);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;
    use crate::context::testing::context_for;
    use crate::target::{Target, TargetKind};
    use crate::task::Reconcile;

    fn inline(path: &str, contents: &str, mode: Option<&str>) -> File {
        File {
            path: path.into(),
            contents: Some(contents.into()),
            source: None,
            hash: None,
            mode: mode.map(str::to_string),
        }
    }

    #[test]
    fn local_render_converges_and_then_stays_put() {
        let (_tmp, ctx) = context_for(TargetKind::LocalExecution);
        let task = inline("/etc/node/role", "worker\n", Some("0600"));

        let first = task.reconcile(&ctx).expect("first run");
        assert!(first.applied);
        assert!(first.changes.touches("contents"));

        let on_disk = ctx.paths().system_path("/etc/node/role").expect("path");
        assert_eq!(fs::read_to_string(&on_disk).expect("read"), "worker\n");
        #[cfg(unix)]
        assert_eq!(mode_of(&fs::metadata(&on_disk).expect("meta")), 0o600);

        let second = task.reconcile(&ctx).expect("second run");
        assert!(!second.changed());
        assert!(!second.applied);
    }

    #[cfg(unix)]
    #[test]
    fn mode_drift_only_touches_mode() {
        let (_tmp, ctx) = context_for(TargetKind::LocalExecution);
        let task = inline("/etc/motd", "hi\n", Some("0644"));
        task.reconcile(&ctx).expect("first run");
        let p = ctx.paths().system_path("/etc/motd").expect("path");
        set_mode(&p, 0o600).expect("chmod");

        let out = task.reconcile(&ctx).expect("second run");
        assert!(out.changes.touches("mode"));
        assert!(!out.changes.touches("contents"));
        assert_eq!(mode_of(&fs::metadata(&p).expect("meta")), 0o644);
    }

    #[test]
    fn boot_script_emits_base64_heredoc() {
        let (_tmp, ctx) = context_for(TargetKind::BootScriptEmission);
        let task = inline("/etc/kubernetes/kubelet.conf", "a: 'b'\n", None);
        task.reconcile(&ctx).expect("render");

        let Target::BootScript(t) = ctx.target() else {
            panic!("expected boot script target");
        };
        let script = t.script();
        let encoded = base64::engine::general_purpose::STANDARD.encode("a: 'b'\n");
        assert!(script.contains("install -d -m 0755 /etc/kubernetes\n"), "{script}");
        assert!(script.contains(&format!(
            "base64 -d > /etc/kubernetes/kubelet.conf <<'{HEREDOC_MARKER}'\n{encoded}\n{HEREDOC_MARKER}\n"
        )));
        assert!(script.contains("chmod 0644 /etc/kubernetes/kubelet.conf\n"));
    }

    #[test]
    fn boot_script_writes_files_already_present_on_the_emitting_host() {
        let (tmp, ctx) = context_for(TargetKind::BootScriptEmission);
        let contents = "kind: KubeletConfiguration\n";
        let host_copy = tmp.path().join("sysroot/etc/kubernetes/kubelet.conf");
        fs::create_dir_all(host_copy.parent().expect("parent")).expect("mkdir");
        fs::write(&host_copy, contents).expect("seed");

        let task = inline("/etc/kubernetes/kubelet.conf", contents, None);
        let out = task.reconcile(&ctx).expect("render");
        assert!(out.applied);
        assert!(out.changes.is_unconditional());

        let Target::BootScript(t) = ctx.target() else {
            panic!("expected boot script target");
        };
        let script = t.script();
        let encoded = base64::engine::general_purpose::STANDARD.encode(contents);
        assert!(script.contains("# File: /etc/kubernetes/kubelet.conf\n"), "{script}");
        assert!(script.contains(&encoded), "{script}");
    }

    #[test]
    fn boot_script_verifies_remote_sources() {
        let (_tmp, ctx) = context_for(TargetKind::BootScriptEmission);
        let hash = ContentHash::of_bytes(DEFAULT_ALGORITHM, b"bin");
        let task = File {
            path: "/usr/local/bin/tool".into(),
            contents: None,
            source: Some("https://example.invalid/tool".into()),
            hash: Some(hash.to_string()),
            mode: Some("0755".into()),
        };
        task.reconcile(&ctx).expect("render");
        let Target::BootScript(t) = ctx.target() else {
            panic!("expected boot script target");
        };
        let script = t.script();
        assert!(script.contains(
            "curl -fsSL --retry 3 -o /usr/local/bin/tool.download https://example.invalid/tool\n"
        ));
        assert!(script.contains(&format!(
            "echo '{}  /usr/local/bin/tool.download' | sha256sum -c -\n",
            hash.hex
        )));
        assert!(script.contains("chmod 0755 /usr/local/bin/tool\n"));
        assert_eq!(ctx.cache().verify(false).expect("verify").len(), 0);
    }

    #[test]
    fn validation_rejects_bad_declarations() {
        let mut f = inline("relative/path", "x", None);
        assert!(f.validate().is_err());
        f.path = "/etc/x".into();
        assert!(f.validate().is_ok());
        f.mode = Some("0999".into());
        assert!(f.validate().is_err());
        f.mode = None;
        f.source = Some("https://example.invalid/x".into());
        assert!(f.validate().is_err(), "contents and source together");
        f.contents = None;
        assert!(f.validate().is_err(), "source without hash");
    }

    #[test]
    fn directory_in_the_way_is_a_discovery_error() {
        let (_tmp, ctx) = context_for(TargetKind::LocalExecution);
        let p = ctx.paths().system_path("/etc/conflict").expect("path");
        fs::create_dir_all(&p).expect("mkdir");
        let err = inline("/etc/conflict", "x", None).reconcile(&ctx).unwrap_err();
        assert!(matches!(err, Error::Discovery(_)), "{err}");
    }
}
