//! dfm CLI - dataflow build engine driver

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use dfm::runner::log_listener;
use dfm::{ExtRegistry, PackageLoader, TaskGraphBuilder, TaskSetRunner};

#[derive(Parser)]
#[command(name = "dfm")]
#[command(about = "dfm - dataflow build engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run a task graph
    Run {
        /// Task to run (short or qualified name)
        task: String,

        /// Root package file
        #[arg(short, long, default_value = "flow.yaml")]
        file: PathBuf,

        /// Run directory
        #[arg(long, default_value = "rundir")]
        rundir: PathBuf,

        /// Parallel task limit (defaults to available cores)
        #[arg(short = 'j', long, default_value_t = -1)]
        nproc: i64,

        /// Configuration overlay to apply
        #[arg(short, long)]
        config: Option<String>,

        /// Write per-task execution summaries
        #[arg(long)]
        exec_data: bool,
    },

    /// Show the resolved task graph
    Show {
        /// Task to show
        task: String,

        /// Root package file
        #[arg(short, long, default_value = "flow.yaml")]
        file: PathBuf,

        /// Emit Graphviz dot instead of a task listing
        #[arg(long)]
        dot: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            task,
            file,
            rundir,
            nproc,
            config,
            exec_data,
        } => run_task(&task, &file, &rundir, nproc, config, exec_data).await,
        Commands::Show { task, file, dot } => show_task(&task, &file, dot),
    };

    match result {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn build_graph(
    task: &str,
    file: &PathBuf,
    rundir: &PathBuf,
    config: Option<String>,
) -> Result<(TaskGraphBuilder, dfm::NodeId)> {
    let flow = PackageLoader::new()
        .with_config(config)
        .load(file)
        .with_context(|| format!("loading {}", file.display()))?;

    let mut builder = TaskGraphBuilder::new(
        Arc::new(flow.symtab),
        Arc::new(flow.filters),
        Arc::new(ExtRegistry::new()),
        flow.root_path,
        rundir.clone(),
    );
    let root = builder
        .mk_task_node(task)
        .with_context(|| format!("building task '{}'", task))?;

    for marker in &builder.markers {
        eprintln!("{}", marker);
    }
    if builder
        .markers
        .iter()
        .any(|m| m.severity == dfm::Severity::Error)
    {
        return Err(anyhow!("build errors for task '{}'", task));
    }
    Ok((builder, root))
}

async fn run_task(
    task: &str,
    file: &PathBuf,
    rundir: &PathBuf,
    nproc: i64,
    config: Option<String>,
    exec_data: bool,
) -> Result<i32> {
    let (mut builder, root) = build_graph(task, file, rundir, config)?;

    let mut runner = TaskSetRunner::new(rundir.clone(), nproc);
    runner.set_save_exec_data(exec_data);
    runner.add_listener(log_listener());

    // Ctrl-C cancels cooperatively; in-flight subprocesses get
    // SIGTERM then SIGKILL
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "interrupted, cancelling...".yellow());
            cancel.cancel();
        }
    });

    let status = runner
        .run(&mut builder, root)
        .await
        .with_context(|| format!("running task '{}'", task))?;

    if status == 0 {
        println!("{} {}", "done:".green().bold(), task);
    } else {
        println!("{} {} (status {})", "failed:".red().bold(), task, status);
    }
    Ok(status)
}

fn show_task(task: &str, file: &PathBuf, dot: bool) -> Result<i32> {
    let rundir = PathBuf::from("rundir");
    let (builder, root) = build_graph(task, file, &rundir, None)?;

    if dot {
        let mut out = std::io::stdout();
        dfm::dot::write_dot(&builder, root, &mut out)?;
    } else {
        print_node(&builder, root, 0);
    }
    Ok(0)
}

fn print_node(builder: &TaskGraphBuilder, id: dfm::NodeId, depth: usize) {
    let node = builder.node(id);
    println!("{}{}", "  ".repeat(depth), node.name.bold());
    for (dep, block) in &node.needs {
        let dep = builder.node(*dep);
        let marker = if *block { "waits" } else { "needs" };
        println!("{}  {} {}", "  ".repeat(depth), marker.dimmed(), dep.name);
    }
    if let dfm::node::NodeKind::Compound { children, .. } = &node.kind {
        for child in children {
            print_node(builder, *child, depth + 1);
        }
    }
}
