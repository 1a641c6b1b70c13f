use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use nodeconverge::config::ConfigDoc;
use nodeconverge::engine::{Engine, RunOptions};
use nodeconverge::executor::{ChannelSink, TaskState};
use nodeconverge::fetch::Downloader;
use nodeconverge::hash::{ContentHash, HashAlgorithm};
use nodeconverge::runner::{CommandOutput, CommandRunner, human};
use nodeconverge::target::TargetKind;
use nodeconverge::{Error, Result};

const ARCHIVE_URL: &str = "https://images.example.invalid/pause-3.9.tar";
const ARCHIVE: &[u8] = b"pretend this is a docker save archive";

#[derive(Default)]
struct CountingDownloader {
    calls: AtomicUsize,
}

impl Downloader for CountingDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url != ARCHIVE_URL {
            return Err(Error::msg(format!("404 {url}")));
        }
        fs::write(dest, ARCHIVE)?;
        Ok(())
    }
}

/// Stands in for the docker CLI: remembers which archives were loaded.
#[derive(Default)]
struct FakeDocker {
    loaded: Mutex<bool>,
    commands: Mutex<Vec<String>>,
}

impl FakeDocker {
    fn loads(&self) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("docker load"))
            .count()
    }
}

impl CommandRunner for FakeDocker {
    fn run(&self, cmd: Command) -> Result<CommandOutput> {
        let line = human(&cmd);
        self.commands.lock().unwrap().push(line.clone());
        let mut loaded = self.loaded.lock().unwrap();
        let (success, lines) = if line.starts_with("docker image inspect") {
            if *loaded {
                (true, vec!["sha256:feedface".to_string()])
            } else {
                (false, vec!["Error: No such image: pause:3.9".to_string()])
            }
        } else if line.starts_with("docker load -i ") {
            let archive = PathBuf::from(line.trim_start_matches("docker load -i "));
            if fs::read(&archive)? != ARCHIVE {
                return Ok(CommandOutput {
                    success: false,
                    status: "exit status: 1".into(),
                    lines: vec!["archive/tar: invalid tar header".into()],
                });
            }
            *loaded = true;
            (true, vec!["Loaded image: pause:3.9".to_string()])
        } else {
            return Err(Error::msg(format!("unexpected command {line}")));
        };
        Ok(CommandOutput {
            success,
            status: (if success { "exit status: 0" } else { "exit status: 1" }).into(),
            lines,
        })
    }
}

struct Node {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    downloader: Arc<CountingDownloader>,
    docker: Arc<FakeDocker>,
}

impl Node {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        Self {
            _tmp: tmp,
            root,
            downloader: Arc::new(CountingDownloader::default()),
            docker: Arc::new(FakeDocker::default()),
        }
    }

    fn engine(&self) -> Engine {
        Engine::new()
            .unwrap()
            .with_downloader(self.downloader.clone())
            .with_runner(self.docker.clone())
    }

    fn doc(&self, body: &str) -> ConfigDoc {
        let path = self.root.join("node.toml");
        fs::write(&path, body).unwrap();
        nodeconverge::config::load(&path).unwrap()
    }

    fn system_file(&self, abs: &str) -> PathBuf {
        self.root.join("sysroot").join(abs.trim_start_matches('/'))
    }

    fn downloads(&self) -> usize {
        self.downloader.calls.load(Ordering::SeqCst)
    }
}

fn archive_hash() -> ContentHash {
    ContentHash::of_bytes(HashAlgorithm::Sha256, ARCHIVE)
}

fn scenario(max_parallel: usize) -> String {
    format!(
        r#"
[run]
max_parallel = {max_parallel}

[workspace]
system_root = "sysroot"

[[tasks]]
id = "pause-archive"
kind = "file"
path = "/var/lib/images/pause.tar"
source = "{ARCHIVE_URL}"
hash = "{hash}"
mode = "0600"

[[tasks]]
id = "pause-image"
kind = "load_image"
after = ["pause-archive"]
source = "{ARCHIVE_URL}"
hash = "{hash}"
image = "pause:3.9"
"#,
        hash = archive_hash()
    )
}

#[test]
fn fetch_then_load_converges_and_repairs_only_what_drifted() {
    let node = Node::new();
    let doc = node.doc(&scenario(2));
    let engine = node.engine();
    let (tx, _rx) = mpsc::channel();
    let sink = ChannelSink::new(tx);

    let first = engine
        .converge(&doc, &RunOptions::default(), &sink)
        .unwrap()
        .report;
    assert!(first.ok, "{first:?}");
    assert_eq!(first.applied(), vec!["pause-archive", "pause-image"]);
    assert_eq!(
        fs::read(node.system_file("/var/lib/images/pause.tar")).unwrap(),
        ARCHIVE
    );
    // Both tasks share one cache entry.
    assert_eq!(node.downloads(), 1);
    assert_eq!(node.docker.loads(), 1);

    let second = engine
        .converge(&doc, &RunOptions::default(), &sink)
        .unwrap()
        .report;
    assert!(second.ok);
    assert!(second.tasks.iter().all(|t| !t.changed), "{second:?}");
    assert_eq!(node.downloads(), 1);
    assert_eq!(node.docker.loads(), 1);

    fs::write(node.system_file("/var/lib/images/pause.tar"), b"bit rot").unwrap();
    let third = engine
        .converge(&doc, &RunOptions::default(), &sink)
        .unwrap()
        .report;
    assert!(third.ok);
    assert_eq!(third.applied(), vec!["pause-archive"]);
    let archive = third.get("pause-archive").unwrap();
    assert!(archive.changes.as_deref().unwrap().starts_with("contents: sha256:"));
    assert_eq!(
        fs::read(node.system_file("/var/lib/images/pause.tar")).unwrap(),
        ARCHIVE
    );
    assert_eq!(node.downloads(), 1, "repair is served from the cache");
    assert_eq!(node.docker.loads(), 1);
}

#[test]
fn tampered_download_fails_the_fetch_and_skips_the_load() {
    let node = Node::new();
    let wrong = ContentHash::of_bytes(HashAlgorithm::Sha256, b"something else");
    let body = scenario(1).replace(&archive_hash().to_string(), &wrong.to_string());
    let doc = node.doc(&body);
    let (tx, _rx) = mpsc::channel();

    let report = node
        .engine()
        .converge(&doc, &RunOptions::default(), &ChannelSink::new(tx))
        .unwrap()
        .report;
    assert!(!report.ok);
    let archive = report.get("pause-archive").unwrap();
    assert_eq!(archive.state, TaskState::Failed);
    assert_eq!(archive.error_kind, Some("verification"));
    assert_eq!(report.skipped(), vec!["pause-image"]);
    assert!(!node.system_file("/var/lib/images/pause.tar").exists());
    assert_eq!(node.docker.loads(), 0);
}

#[test]
fn boot_script_target_writes_script_and_flags_unsupported_tasks() {
    let node = Node::new();
    let body = format!(
        r#"{}
[[tasks]]
id = "kubelet-conf"
kind = "file"
path = "/etc/kubernetes/kubelet.conf"
contents = "kind: KubeletConfiguration\n"

[[tasks]]
id = "after-image"
kind = "file"
after = ["pause-image"]
path = "/etc/node/images-ready"
contents = "yes\n"
"#,
        scenario(1)
    );
    let doc = node.doc(&body);
    // The emitting host already matches; the new machine still needs the file.
    let host_conf = node.system_file("/etc/kubernetes/kubelet.conf");
    fs::create_dir_all(host_conf.parent().unwrap()).unwrap();
    fs::write(&host_conf, "kind: KubeletConfiguration\n").unwrap();
    let opts = RunOptions {
        target: Some(TargetKind::BootScriptEmission),
        max_parallel: None,
    };
    let (tx, _rx) = mpsc::channel();

    let out = node
        .engine()
        .converge(&doc, &opts, &ChannelSink::new(tx))
        .unwrap();
    let report = out.report;
    assert_eq!(report.target, TargetKind::BootScriptEmission);
    assert!(!report.ok);

    let image = report.get("pause-image").unwrap();
    assert_eq!(image.state, TaskState::Failed);
    assert_eq!(image.error_kind, Some("unsupported_target"));
    assert_eq!(report.skipped(), vec!["after-image"]);
    assert!(report.get("kubelet-conf").unwrap().applied);

    let script_path = out.boot_script.unwrap();
    assert_eq!(script_path, node.root.join("./work/boot-script.sh"));
    let script = fs::read_to_string(&script_path).unwrap();
    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains("# File: /etc/kubernetes/kubelet.conf\n"));
    assert!(script.contains("# File: /var/lib/images/pause.tar\n"));
    assert!(!script.contains("images-ready"));
    assert!(script.contains("sha256sum -c -"));

    // Nothing happened to or was asked of the local machine.
    assert!(!node.system_file("/var/lib/images/pause.tar").exists());
    assert_eq!(node.downloads(), 0);
    assert!(node.docker.commands.lock().unwrap().is_empty());
}

#[test]
fn graph_errors_abort_before_anything_runs() {
    let node = Node::new();
    let doc = node.doc(
        r#"
[workspace]
system_root = "sysroot"

[[tasks]]
id = "a"
kind = "file"
after = ["b"]
path = "/etc/a"
contents = "a"

[[tasks]]
id = "b"
kind = "file"
after = ["a"]
path = "/etc/b"
contents = "b"
"#,
    );
    let (tx, rx) = mpsc::channel();
    let err = node
        .engine()
        .converge(&doc, &RunOptions::default(), &ChannelSink::new(tx))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Cycle(_)), "{err}");
    assert!(err.is_build_time());
    assert_eq!(rx.try_iter().count(), 0);
    assert!(!node.system_file("/etc/a").exists());
    assert!(!node.root.join("work").exists());
}

#[test]
fn unknown_dependency_is_rejected() {
    let node = Node::new();
    let doc = node.doc(
        r#"
[[tasks]]
id = "a"
kind = "file"
after = ["nope"]
path = "/etc/a"
contents = "a"
"#,
    );
    let err = node.engine().plan(&doc.run_config().unwrap()).err().unwrap();
    assert!(
        matches!(err, Error::UnknownDependency { ref task, ref dep } if task == "a" && dep == "nope"),
        "{err}"
    );
}
