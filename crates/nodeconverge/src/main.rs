use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use nodeconverge::Result;
use nodeconverge::engine::{Engine, RunOptions};
use nodeconverge::executor::StdoutSink;
use nodeconverge::target::TargetKind;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log output format (filter with RUST_LOG)
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a run file and print the task order
    Plan {
        /// Path to a run file
        run: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Converge the tasks of a run file
    Run {
        /// Path to a run file
        run: PathBuf,
        /// Override `[run].target`
        #[arg(long, value_enum)]
        target: Option<TargetKind>,
        /// Max number of tasks to execute concurrently (0 = use CPU count)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Write a JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Load a run file and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a run file
        run: PathBuf,
    },
    /// Inspect the fetch cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Re-hash every cached file and report entries that no longer match
    Verify {
        /// Path to a run file
        run: PathBuf,
        /// Remove entries that fail verification
        #[arg(long)]
        prune: bool,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let res = match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(e) = res {
        eprintln!("failed to install log subscriber: {e}");
    }
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_logging(args.log_format);

    let res = match args.cmd {
        Command::Plan { run, dot } => cmd_plan(&run, dot),
        Command::Run {
            run,
            target,
            max_parallel,
            report,
        } => cmd_run(&run, target, max_parallel, report),
        Command::Resolve { run } => cmd_resolve(&run),
        Command::Cache {
            cmd: CacheCommand::Verify { run, prune },
        } => cmd_cache_verify(&run, prune),
    };
    match res {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_plan(path: &PathBuf, dot: bool) -> Result<bool> {
    let doc = nodeconverge::config::load(path.as_path())?;
    let cfg = doc.run_config()?;
    let graph = Engine::new()?.plan(&cfg)?;

    if dot {
        print!("{}", graph.to_dot());
        return Ok(true);
    }

    for (i, idx) in graph.ordered().into_iter().enumerate() {
        let node = graph.node(idx);
        println!(
            "{:>2}. {:<22}  {:<12}  {}",
            i + 1,
            node.id,
            node.kind,
            node.task.describe()
        );
    }
    Ok(true)
}

fn cmd_resolve(path: &PathBuf) -> Result<bool> {
    let doc = nodeconverge::config::load(path.as_path())?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(true)
}

fn cmd_run(
    path: &PathBuf,
    target: Option<TargetKind>,
    max_parallel: Option<usize>,
    report: Option<PathBuf>,
) -> Result<bool> {
    let doc = nodeconverge::config::load(path.as_path())?;
    let opts = RunOptions {
        target,
        max_parallel,
    };
    let sink = StdoutSink::default();
    let out = Engine::new()?.converge(&doc, &opts, &sink)?;

    if let Some(p) = &out.boot_script {
        println!("boot script: {}", p.display());
    }
    if let Some(p) = report {
        out.report.write_json(&p)?;
    }
    Ok(out.report.ok)
}

fn cmd_cache_verify(path: &PathBuf, prune: bool) -> Result<bool> {
    let doc = nodeconverge::config::load(path.as_path())?;
    let entries = Engine::new()?.verify_cache(&doc, prune)?;
    let mut ok = true;
    for e in &entries {
        if e.valid {
            println!("ok       {}", e.hash);
        } else {
            ok = false;
            let action = if prune { "pruned" } else { "corrupt" };
            println!("{action:<8} {} ({})", e.hash, e.path.display());
        }
    }
    println!("{} entries checked", entries.len());
    Ok(ok)
}
