use std::collections::BTreeSet;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::planner::TaskGraph;
use crate::target::TargetKind;
use crate::task::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        changed: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    TaskSkipped {
        id: String,
        blocked_by: String,
    },
    RunDone {
        ok: bool,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    started: usize,
    ok: usize,
    changed: usize,
    failed: Vec<String>,
    skipped: Vec<String>,
    total_task_ms: u128,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let mut s = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match ev {
            ExecEvent::TaskStarted { id } => {
                s.started += 1;
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                changed,
                error,
                elapsed_ms,
            } => {
                s.total_task_ms = s.total_task_ms.saturating_add(elapsed_ms);
                if ok {
                    s.ok += 1;
                    if changed {
                        s.changed += 1;
                    }
                    let what = if changed { "changed" } else { "unchanged" };
                    println!("DONE: {id} ({elapsed_ms}ms, {what})");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                    s.failed.push(id);
                }
            }
            ExecEvent::TaskSkipped { id, blocked_by } => {
                println!("SKIP: {id} (dependency '{blocked_by}' did not succeed)");
                s.skipped.push(id);
            }
            ExecEvent::RunDone { ok } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  tasks: started={} ok={} changed={} failed={} skipped={}\n",
                    s.started,
                    s.ok,
                    s.changed,
                    s.failed.len(),
                    s.skipped.len()
                ));
                summary.push_str(&format!(
                    "  elapsed: {}\n",
                    format_elapsed_hms(wall.as_secs())
                ));
                summary.push_str(&format!(
                    "  summed_task_time: {}\n",
                    format_elapsed_hms((s.total_task_ms / 1000) as u64)
                ));
                for (label, ids) in [("failed_tasks", &s.failed), ("skipped_tasks", &s.skipped)] {
                    if !ids.is_empty() {
                        let mut ids = ids.clone();
                        ids.sort();
                        summary.push_str(&format!("  {label}: {}\n", ids.join(", ")));
                    }
                }
                print!("{summary}");
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: String,
    pub kind: String,
    pub description: String,
    pub state: TaskState,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    /// Whether the task's state differed from the declaration.
    pub changed: bool,
    /// Whether a render actually ran; false for dry runs.
    pub applied: bool,
    pub changes: Option<String>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub target: TargetKind,
    pub started_at: DateTime<Utc>,
    pub ok: bool,
    /// In task id order.
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn get(&self, id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn ids_in(&self, state: TaskState) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.state == state)
            .map(|t| t.id.as_str())
            .collect()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_in(TaskState::Failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.ids_in(TaskState::Skipped)
    }

    pub fn applied(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.applied)
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Fails with a message listing every failed and skipped task.
    pub fn into_result(self) -> Result<Self> {
        if self.ok {
            return Ok(self);
        }
        Err(Error::msg(format!(
            "run failed; failed: [{}]; skipped: [{}]",
            self.failed().join(", "),
            self.skipped().join(", ")
        )))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let s = serde_json::to_string_pretty(self)
            .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, s)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
    }
}

type Finished = (usize, Result<Outcome>, u128);

/// Per-run state machine over the graph.
struct Bookkeeping<'g> {
    graph: &'g TaskGraph,
    sink: &'g dyn ExecSink,
    states: Vec<TaskState>,
    waiting_on: Vec<usize>,
    ready: BTreeSet<usize>,
    reports: Vec<Option<TaskReport>>,
}

impl<'g> Bookkeeping<'g> {
    fn new(graph: &'g TaskGraph, sink: &'g dyn ExecSink) -> Self {
        let waiting_on: Vec<usize> = (0..graph.len()).map(|i| graph.deps(i).len()).collect();
        let ready = (0..graph.len()).filter(|&i| waiting_on[i] == 0).collect();
        Self {
            graph,
            sink,
            states: vec![TaskState::Pending; graph.len()],
            waiting_on,
            ready,
            reports: vec![None; graph.len()],
        }
    }

    fn next_ready(&mut self) -> Option<usize> {
        let idx = self.ready.pop_first()?;
        self.states[idx] = TaskState::Running;
        let id = self.graph.id(idx).to_string();
        info!(task = %id, "starting");
        self.sink.emit(ExecEvent::TaskStarted { id });
        Some(idx)
    }

    fn report(&self, idx: usize, state: TaskState) -> TaskReport {
        let node = self.graph.node(idx);
        TaskReport {
            id: node.id.clone(),
            kind: node.kind.clone(),
            description: node.task.describe(),
            state,
            error: None,
            error_kind: None,
            changed: false,
            applied: false,
            changes: None,
            elapsed_ms: 0,
        }
    }

    fn finish(&mut self, (idx, res, elapsed_ms): Finished) {
        let id = self.graph.id(idx).to_string();
        match res {
            Ok(outcome) => {
                self.states[idx] = TaskState::Succeeded;
                let mut rep = self.report(idx, TaskState::Succeeded);
                rep.changed = outcome.changed();
                rep.applied = outcome.applied;
                rep.changes = outcome.changed().then(|| outcome.changes.summary());
                rep.elapsed_ms = elapsed_ms;
                self.reports[idx] = Some(rep);
                info!(task = %id, changed = outcome.changed(), elapsed_ms = elapsed_ms as u64, "succeeded");
                self.sink.emit(ExecEvent::TaskFinished {
                    id,
                    ok: true,
                    changed: outcome.changed(),
                    error: None,
                    elapsed_ms,
                });
                for &m in self.graph.dependents(idx) {
                    self.waiting_on[m] -= 1;
                    if self.waiting_on[m] == 0 && self.states[m] == TaskState::Pending {
                        self.ready.insert(m);
                    }
                }
            }
            Err(e) => {
                self.states[idx] = TaskState::Failed;
                let mut rep = self.report(idx, TaskState::Failed);
                rep.error = Some(e.to_string());
                rep.error_kind = Some(e.kind());
                rep.elapsed_ms = elapsed_ms;
                self.reports[idx] = Some(rep);
                error!(task = %id, error = %e, "failed");
                self.sink.emit(ExecEvent::TaskFinished {
                    id,
                    ok: false,
                    changed: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                self.skip_dependents(idx);
            }
        }
    }

    fn skip_dependents(&mut self, failed: usize) {
        let mut stack = vec![failed];
        while let Some(n) = stack.pop() {
            for &m in self.graph.dependents(n) {
                if self.states[m] != TaskState::Pending {
                    continue;
                }
                self.states[m] = TaskState::Skipped;
                self.ready.remove(&m);
                let blocked_by = self.graph.id(n).to_string();
                let mut rep = self.report(m, TaskState::Skipped);
                rep.error = Some(format!("dependency '{blocked_by}' did not succeed"));
                self.reports[m] = Some(rep);
                warn!(task = %self.graph.id(m), blocked_by = %blocked_by, "skipped");
                self.sink.emit(ExecEvent::TaskSkipped {
                    id: self.graph.id(m).to_string(),
                    blocked_by,
                });
                stack.push(m);
            }
        }
    }

    fn into_report(self, target: TargetKind, started_at: DateTime<Utc>) -> RunReport {
        let mut tasks = Vec::with_capacity(self.graph.len());
        for (idx, rep) in self.reports.iter().enumerate() {
            match rep {
                Some(r) => tasks.push(r.clone()),
                // Unreachable for an acyclic graph; kept visible rather than dropped.
                None => {
                    let mut r = self.report(idx, TaskState::Pending);
                    r.error = Some("task never became ready".into());
                    tasks.push(r);
                }
            }
        }
        let ok = tasks.iter().all(|t| t.state == TaskState::Succeeded);
        RunReport {
            target,
            started_at,
            ok,
            tasks,
        }
    }
}

fn run_one(graph: &TaskGraph, ctx: &Context, idx: usize) -> Finished {
    let start = Instant::now();
    let task = &graph.node(idx).task;
    let res = catch_unwind(AssertUnwindSafe(|| task.reconcile(ctx))).unwrap_or_else(|panic| {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        Err(Error::msg(format!("task panicked: {msg}")))
    });
    (idx, res, start.elapsed().as_millis())
}

/// Runs every task of `graph` once, dependencies first.
///
/// Task failures never abort the run: dependents of a failed task are
/// skipped, unrelated tasks keep running, and the report lists every task.
pub fn execute(
    graph: &TaskGraph,
    ctx: &Context,
    sink: &dyn ExecSink,
    max_parallel: usize,
) -> RunReport {
    let started_at = Utc::now();
    let mut book = Bookkeeping::new(graph, sink);

    if max_parallel <= 1 {
        while let Some(idx) = book.next_ready() {
            let done = run_one(graph, ctx, idx);
            book.finish(done);
        }
    } else {
        std::thread::scope(|s| {
            let (tx, rx) = mpsc::channel::<Finished>();
            let mut running = 0usize;
            loop {
                while running < max_parallel {
                    let Some(idx) = book.next_ready() else {
                        break;
                    };
                    let tx = tx.clone();
                    s.spawn(move || {
                        let _ = tx.send(run_one(graph, ctx, idx));
                    });
                    running += 1;
                }
                if running == 0 {
                    break;
                }
                let Ok(done) = rx.recv() else {
                    break;
                };
                running -= 1;
                book.finish(done);
            }
        });
    }

    let report = book.into_report(ctx.target().kind(), started_at);
    sink.emit(ExecEvent::RunDone { ok: report.ok });
    report
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
