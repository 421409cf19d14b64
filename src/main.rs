use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use runscope::aggregator::Notification;
use runscope::config::RunscopeConfig;
use runscope::ReplayOptions;

#[derive(Parser)]
#[command(
    name = "runscope",
    about = "Live test-run telemetry aggregator",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $RUNSCOPE_CONFIG, then ./runscope.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a recorded event stream to a run snapshot and print the result
    Replay {
        /// Run snapshot file, or a directory of run_{id}.json files
        #[arg(long)]
        snapshot: PathBuf,

        /// Recorded push stream (JSON lines of {topic, payload})
        #[arg(long)]
        events: PathBuf,

        /// Run to replay (read from the snapshot file when omitted)
        #[arg(long)]
        run_id: Option<u64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,

        /// Print every change notification while replaying
        #[arg(long)]
        follow: bool,
    },

    /// Follow a run and serve the read API
    Serve {
        /// Run to follow
        #[arg(long)]
        run_id: u64,

        /// Bind address (default from config)
        #[arg(long)]
        bind: Option<String>,

        /// Load the snapshot from a file or directory instead of the hub
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RunscopeConfig::resolve(cli.config.as_deref())?;
    runscope::logging::init(&config.logging)?;

    match cli.command {
        Commands::Replay {
            snapshot,
            events,
            run_id,
            json,
            follow,
        } => {
            tracing::info!(snapshot = %snapshot.display(), events = %events.display(), "Replaying run");
            let on_change = follow.then(|| {
                Arc::new(|n: &Notification| {
                    if let Ok(line) = serde_json::to_string(n) {
                        eprintln!("{}", line);
                    }
                }) as runscope::aggregator::Listener
            });
            let report = runscope::replay(
                &config,
                ReplayOptions {
                    snapshot,
                    events,
                    run_id,
                    on_change,
                },
            )
            .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let s = &report.statistics;
                println!("\nTest run {} ({})", report.run_id, report.result);
                println!("{:<12} | {:>6}", "State", "Count");
                println!("{:-<12}-|-{:->6}", "", "");
                println!("{:<12} | {:>6}", "open", s.open);
                println!("{:<12} | {:>6}", "success", s.success);
                println!("{:<12} | {:>6}", "failed", s.failed);
                println!("{:<12} | {:>6}", "unstable", s.unstable);
                println!("{:<12} | {:>6}", "total", s.total);
                if !report.settled {
                    println!("{} protocol(s) still running", s.open);
                }
                println!(
                    "\nEvents: {} applied, {} unchanged, {} ignored, {} malformed, {} unreadable lines",
                    report.events.applied,
                    report.events.unchanged,
                    report.events.ignored,
                    report.events.malformed,
                    report.skipped_lines
                );
                for node in &report.forest {
                    print_node(node, 0);
                }
                if !report.orphans.is_empty() {
                    println!("Unattached protocols: {:?}", report.orphans);
                }
            }
        }
        Commands::Serve {
            run_id,
            bind,
            snapshot,
        } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, run_id, "Starting runscope");
            let loader = runscope::snapshot_loader(&config, snapshot.as_deref())?;
            runscope::serve(&config, &bind, run_id, loader).await?;
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn print_node(node: &runscope::tree::ProtocolNode, depth: usize) {
    println!(
        "{:indent$}{} [{}] #{}",
        "",
        node.protocol.display_name(),
        node.protocol.test_result,
        node.id(),
        indent = depth * 2 + 2
    );
    for child in &node.children {
        print_node(child, depth + 1);
    }
}
