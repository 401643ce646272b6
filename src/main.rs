//! Taskmesh CLI - run, inspect, and serve task workspaces

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::{json, Value};

use taskmesh::error::TaskmeshError;
use taskmesh::meta::Meta;
use taskmesh::remote::{Distributor, UnitClient, UnitServer};
use taskmesh::runner::{
    CooperativeRunner, ProcessRunner, SequentialRunner, TaskRunner, ThreadedRunner,
};
use taskmesh::task_graph::TaskNode;
use taskmesh::task_master::TaskMaster;
use taskmesh::workspace;

#[derive(Parser)]
#[command(name = "taskmesh")]
#[command(about = "Taskmesh - metadata-driven task execution engine")]
#[command(version)]
struct Cli {
    /// Workspace locator: a registered name, or host:port of a remote
    /// unit or distributor
    #[arg(short, long, global = true, default_value = "demo")]
    workspace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the workspace structure
    Structure,

    /// Execute a task and print its result
    Run {
        /// Dotted task path, e.g. sub.taskname
        taskpath: String,

        /// Metadata: inline JSON if it starts with '{', otherwise a file path
        #[arg(short, long)]
        meta: Option<String>,

        /// Execution strategy
        #[arg(short, long, value_enum, default_value_t = RunnerKind::Sequential)]
        runner: RunnerKind,
    },

    /// Query the capability score of a remote unit or distributor
    Powerfullity,

    /// Ask a remote unit or distributor to shut down
    Stop,

    /// Serve the workspace as a unit on a TCP endpoint
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:8888")]
        addr: String,

        /// Capability score reported to distributors
        #[arg(short, long)]
        powerfullity: Option<i64>,
    },

    /// Front a pool of units, forwarding work to the most capable one
    Distribute {
        #[arg(short, long, default_value = "127.0.0.1:8889")]
        addr: String,

        /// Unit address, repeatable
        #[arg(short, long = "unit")]
        units: Vec<String>,
    },

    /// Worker mode for the process runner: evaluate one task and report
    /// JSON on stdout
    #[command(hide = true)]
    Eval {
        #[arg(long)]
        task: String,

        #[arg(long)]
        meta: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RunnerKind {
    Sequential,
    Threaded,
    Cooperative,
    Process,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Structure => structure(&cli.workspace),
        Commands::Run {
            taskpath,
            meta,
            runner,
        } => run(&cli.workspace, &taskpath, meta.as_deref(), runner),
        Commands::Powerfullity => powerfullity(&cli.workspace),
        Commands::Stop => stop(&cli.workspace),
        Commands::Serve { addr, powerfullity } => serve(&cli.workspace, &addr, powerfullity),
        Commands::Distribute { addr, units } => distribute(&addr, units),
        Commands::Eval { task, meta } => eval(&cli.workspace, &task, meta.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// A locator with a colon addresses a remote endpoint; anything else is a
/// registered workspace name.
fn is_remote(locator: &str) -> bool {
    locator.contains(':')
}

fn load_meta(arg: Option<&str>) -> Result<Meta, TaskmeshError> {
    let Some(arg) = arg else {
        return Ok(Meta::new());
    };
    let text = if arg.trim_start().starts_with('{') {
        arg.to_string()
    } else {
        std::fs::read_to_string(arg)?
    };
    let value: Value = serde_json::from_str(&text)?;
    Meta::from_value(value)
        .ok_or_else(|| TaskmeshError::Protocol("metadata is not a JSON object".into()))
}

fn structure(locator: &str) -> Result<(), TaskmeshError> {
    let tree = if is_remote(locator) {
        UnitClient::new(locator).structure()?
    } else {
        workspace::resolve(locator)?.structure()
    };
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}

fn run(
    locator: &str,
    taskpath: &str,
    meta_arg: Option<&str>,
    runner: RunnerKind,
) -> Result<(), TaskmeshError> {
    let meta = load_meta(meta_arg)?;

    let value = if is_remote(locator) {
        UnitClient::new(locator).run(taskpath, meta)?
    } else {
        let ws = workspace::resolve(locator)?;
        let task = ws
            .find_task(taskpath)?
            .ok_or_else(|| TaskmeshError::TaskNotFound {
                path: taskpath.to_string(),
                workspace: ws.name().to_string(),
            })?;
        let runner: Arc<dyn TaskRunner> = match runner {
            RunnerKind::Sequential => Arc::new(SequentialRunner),
            RunnerKind::Threaded => Arc::new(ThreadedRunner::new()),
            RunnerKind::Cooperative => Arc::new(CooperativeRunner::new()),
            RunnerKind::Process => Arc::new(ProcessRunner::new(locator)),
        };
        let master = TaskMaster::new(runner);
        let mut result = master.execute(meta, &task, Some(&ws));
        match result.force() {
            Ok(value) => value.clone(),
            Err(e) => {
                return Err(TaskmeshError::Invocation {
                    task: taskpath.to_string(),
                    details: e.to_string(),
                })
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn powerfullity(locator: &str) -> Result<(), TaskmeshError> {
    if !is_remote(locator) {
        return Err(TaskmeshError::Remote(
            "powerfullity requires a remote locator (host:port)".into(),
        ));
    }
    println!("{}", UnitClient::new(locator).powerfullity()?);
    Ok(())
}

fn stop(locator: &str) -> Result<(), TaskmeshError> {
    if !is_remote(locator) {
        return Err(TaskmeshError::Remote(
            "stop requires a remote locator (host:port)".into(),
        ));
    }
    UnitClient::new(locator).stop()
}

fn serve(locator: &str, addr: &str, powerfullity: Option<i64>) -> Result<(), TaskmeshError> {
    if is_remote(locator) {
        return Err(TaskmeshError::Remote(
            "serve requires a registered workspace name".into(),
        ));
    }
    let ws = workspace::resolve(locator)?;
    let powerfullity = powerfullity.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1)
    });
    let server = UnitServer::bind(ws, addr, powerfullity)?;
    println!(
        "{} unit on {}",
        "Serving".green().bold(),
        server.local_addr()?
    );
    server.serve()
}

fn distribute(addr: &str, units: Vec<String>) -> Result<(), TaskmeshError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    runtime.block_on(async {
        let distributor = Distributor::bind(addr, units).await?;
        println!(
            "{} distributor on {}",
            "Serving".green().bold(),
            distributor.local_addr()?
        );
        distributor.serve().await
    })
}

/// Worker report consumed by the process runner in the parent. Always exits
/// zero with a JSON report; a non-zero exit means the worker itself broke.
fn eval(locator: &str, taskpath: &str, meta_arg: Option<&str>) -> Result<(), TaskmeshError> {
    let report = eval_report(locator, taskpath, meta_arg);
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn eval_report(locator: &str, taskpath: &str, meta_arg: Option<&str>) -> Value {
    let failed = |error: String| json!({"status": "failed", "error": error});

    let meta = match load_meta(meta_arg) {
        Ok(meta) => meta,
        Err(e) => return failed(e.to_string()),
    };
    let ws = match workspace::resolve(locator) {
        Ok(ws) => ws,
        Err(e) => return failed(e.to_string()),
    };
    let task = match ws.find_task(taskpath) {
        Ok(Some(task)) => task,
        Ok(None) => return failed(format!("task '{taskpath}' not found")),
        Err(e) => return failed(e.to_string()),
    };

    // The parent already resolved and validated the whole graph before
    // dispatching this subtree; running it through the runner directly
    // keeps worker semantics identical to the in-process strategies,
    // which never re-validate a dependency's specification.
    let node = TaskNode::resolve(task, ws);
    match SequentialRunner.run(&meta, &node) {
        Ok(value) => json!({"status": "contains_data", "data": value}),
        Err(e) => json!({"status": "invocation_error", "error": e.to_string()}),
    }
}
