use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_line;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    /// Interleaved stdout/stderr, sanitized, one entry per line.
    pub lines: Vec<String>,
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: Command) -> Result<CommandOutput>;
}

/// Renders a command the way an operator would type it.
pub fn human(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `cmd` and turns a nonzero exit into a render error carrying the output.
pub fn run_checked(runner: &dyn CommandRunner, cmd: Command) -> Result<Vec<String>> {
    let human = human(&cmd);
    let out = runner.run(cmd)?;
    if !out.success {
        return Err(Error::Render {
            reason: format!("command '{human}' failed: {}", out.status),
            output: out.lines,
        });
    }
    Ok(out.lines)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, mut cmd: Command) -> Result<CommandOutput> {
        let human = human(&cmd);
        debug!(command = %human, "running");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn '{human}': {e}")))?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut lines = Vec::new();
        for line in rx {
            let line = sanitize_line(&line);
            if line.is_empty() {
                continue;
            }
            debug!(command = %human, "{line}");
            lines.push(line);
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for '{human}' failed: {e}")))?;
        Ok(CommandOutput {
            success: status.success(),
            status: status.to_string(),
            lines,
        })
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
                continue;
            }
            pending.push(b);
            if pending.len() >= MAX_PENDING_BYTES {
                let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                pending.clear();
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}
