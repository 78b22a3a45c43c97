use anyhow::Context;
use clap::{Parser, Subcommand};
use lbcheck::checks::Checks;
use lbcheck::config;
use lbcheck::graph::ServerStates;
use lbcheck::policy::Policy;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Configuration file to read
    #[clap(long, short = 'f', default_value = "/etc/keepalived/keepalived.conf")]
    pub config: PathBuf,

    /// Never create or rewrite init files
    #[clap(long)]
    pub no_init_files: bool,

    /// Log at DEBUG rather than WARN
    #[clap(long, short = 'v')]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Reports configuration errors
    Check,

    /// Reads every tracked file once, and dumps the resulting graph
    Dump {
        /// Print JSON rather than text
        #[clap(long)]
        json: bool,
    },

    /// Polls tracked files, printing real server changes.
    ///
    /// SIGHUP reloads the configuration.
    Watch {
        #[clap(long, short = 'i', default_value_t = 2)]
        update_interval_secs: u8,
    },
}

fn read_config(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn start(args: &Args, text: &str) -> Checks {
    let policy = Policy {
        create_init_files: !args.no_init_files,
        ..Default::default()
    };
    let checks = match Checks::new(text, policy) {
        Ok(checks) => checks,
        Err(err) => {
            eprintln!("warning: {err}");
            err.into_inner()
        }
    };
    for diagnostic in checks.diagnostics() {
        eprintln!("{}: {diagnostic}", args.config.display());
    }
    checks
}

fn print_states(states: &ServerStates) {
    for ((service, server), state) in states {
        println!(
            "{service} {server} weight {} {}",
            state.weight,
            if state.alive { "UP" } else { "DOWN" }
        );
    }
    println!();
}

async fn watch(args: &Args, checks: &Checks, interval: Duration) -> anyhow::Result<()> {
    let mut paths: BTreeSet<PathBuf> = checks
        .dump()
        .await?
        .files
        .into_iter()
        .map(|file| file.path)
        .collect();
    let mut monitor = checks.monitor();
    print_states(&monitor.borrow_and_update());

    let mut hangup = signal(SignalKind::hangup())?;
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for path in &paths {
                    if let Err(err) = checks.file_modified(path).await {
                        eprintln!("{}: {err}", path.display());
                    }
                }
            }
            changed = monitor.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                print_states(&monitor.borrow_and_update());
            }
            _ = hangup.recv() => {
                let text = match read_config(&args.config) {
                    Ok(text) => text,
                    Err(err) => {
                        eprintln!("{err:#}");
                        continue;
                    }
                };
                for diagnostic in checks.reload(text).await? {
                    eprintln!("{}: {diagnostic}", args.config.display());
                }
                paths = checks
                    .dump()
                    .await?
                    .files
                    .into_iter()
                    .map(|file| file.path)
                    .collect();
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let text = read_config(&args.config)?;
    match args.command {
        Command::Check => {
            let (_, diagnostics) = config::parse(&text);
            for diagnostic in &diagnostics {
                eprintln!("{}: {diagnostic}", args.config.display());
            }
            if !diagnostics.is_empty() {
                anyhow::bail!("{} configuration errors", diagnostics.len());
            }
            println!("{}: OK", args.config.display());
        }
        Command::Dump { json } => {
            let checks = start(&args, &text);
            let snapshot = checks.dump().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{snapshot}");
            }
            checks.terminate().await?;
        }
        Command::Watch {
            update_interval_secs,
        } => {
            let checks = start(&args, &text);
            let interval = Duration::from_secs(u64::from(update_interval_secs.max(1)));
            watch(&args, &checks, interval).await?;
            checks.terminate().await?;
        }
    }
    Ok(())
}
