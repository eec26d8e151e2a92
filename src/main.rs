use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use mapstage::app::{handle_fatal_error, init_logging, initialize_engine, AppConfig};
use mapstage::{Engine, Process, ProcessId, ProcessSpecification, StageRegistry, Worker};

/// MapReduce over a shared work queue and key-value store
#[derive(Parser)]
#[command(name = "mapstage")]
#[command(about = "Run and manage mapstage MapReduce processes", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the engine configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute queued units until interrupted
    Worker {
        /// Number of concurrent polling tasks (overrides the config file)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
    /// List known processes
    List,
    /// Show the state of a process
    Status {
        /// Process id
        pid: String,
    },
    /// Cancel the pending units of a process
    Kill {
        /// Process id
        pid: String,
    },
    /// Cancel the pending units of every known process
    KillAll,
    /// Delete a process and its intermediate data
    Delete {
        /// Process id
        pid: String,
    },
    /// Count the words of a text file with the built-in stages
    WordCount {
        /// File to count
        file: PathBuf,

        /// Run every unit inline instead of queueing it for workers
        #[arg(long)]
        sync: bool,

        /// Output keyname (default: <namespace>:result:<pid>)
        #[arg(long)]
        keyname: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let app = AppConfig::new(cli.verbose).with_config_path(cli.config.clone());
    init_logging(&app);

    if let Err(e) = run(cli.command, &app).await {
        handle_fatal_error(e, app.verbose);
    }
}

async fn run(command: Commands, app: &AppConfig) -> anyhow::Result<()> {
    let engine = initialize_engine(app, StageRegistry::with_builtins()).await?;

    match command {
        Commands::Worker { concurrency } => run_worker(engine, concurrency).await,
        Commands::List => {
            let pids = Process::list(&engine).await?;
            if pids.is_empty() {
                println!("No processes found.");
            }
            for pid in pids {
                let mut process = Process::open(&engine, &pid).await?;
                println!("{}", process.status().await?);
            }
            Ok(())
        }
        Commands::Status { pid } => {
            let mut process = Process::open(&engine, &ProcessId::from(pid)).await?;
            println!("{}", process.status().await?);
            Ok(())
        }
        Commands::Kill { pid } => {
            let cancelled = Process::kill(&engine, &ProcessId::from(pid.as_str())).await?;
            println!("Cancelled {} pending units of {}", cancelled, pid);
            Ok(())
        }
        Commands::KillAll => {
            let cancelled = Process::kill_all(&engine).await?;
            println!("Cancelled {} pending units", cancelled);
            Ok(())
        }
        Commands::Delete { pid } => {
            let process = Process::open(&engine, &ProcessId::from(pid.as_str())).await?;
            process.delete().await?;
            println!("Deleted {}", pid);
            Ok(())
        }
        Commands::WordCount {
            file,
            sync,
            keyname,
        } => run_word_count(engine, file, sync, keyname).await,
    }
}

async fn run_worker(engine: Engine, concurrency: Option<usize>) -> anyhow::Result<()> {
    let mut config = engine.config().worker.clone();
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency.max(1);
    }
    let worker = Worker::with_config(engine, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Interrupted; finishing in-flight units");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;
    Ok(())
}

async fn run_word_count(
    engine: Engine,
    file: PathBuf,
    sync: bool,
    keyname: Option<String>,
) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut builder = ProcessSpecification::builder()
        .inputter("word_stream")
        .mapper("word_counter")
        .reducer("adder")
        .finalizer("to_hash")
        .outputter("hash_outputter");
    if let Some(keyname) = keyname {
        builder = builder.keyname(keyname);
    }
    let mut process = engine.create_process(builder.build()?).await?;

    // Removed with the process by `delete`
    let data_ref = process.stage_input(&text).await?;
    process.run(&data_ref, sync).await?;

    if !sync {
        println!("Queued process {}", process.pid());
        println!("Results will be written under {}", process.keyname());
        return Ok(());
    }

    let mut counts: Vec<(String, u64)> = Vec::new();
    for (word, count) in process.reduced_pairs().await? {
        counts.push((word, count.parse().unwrap_or(0)));
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    engine.store().delete(&[data_ref]).await?;

    println!("Process {} ({} distinct words)", process.pid(), counts.len());
    for (word, count) in counts {
        println!("{:>8} {}", count, word);
    }
    Ok(())
}
