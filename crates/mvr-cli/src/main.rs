//! mvr CLI - move query results into CSV, JSONL, Parquet or Arrow files.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mvr::{MvrError, Orchestrator, StreamSpec};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mvr")]
#[command(about = "mvr is a tool for moving data")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Disable progress output but keep info logging
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable all logging and progress output
    #[arg(short, long, global = true)]
    silent: bool,

    /// Number of concurrent writer workers (default: CPU count)
    #[arg(long, global = true, default_value_t = 0)]
    concurrency: usize,

    /// Human readable log output instead of JSON
    #[arg(long, global = true)]
    console: bool,

    /// Log level (trace, debug, info, warn, error); overrides --debug
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move a single stream
    Mv {
        /// YAML configuration file
        #[arg(short = 'f', long)]
        config: Option<PathBuf>,

        /// Output format: csv, jsonl, parquet or arrow
        #[arg(long)]
        format: Option<String>,

        /// Output filename (templated)
        #[arg(long)]
        filename: Option<String>,

        /// Query to execute
        #[arg(long)]
        sql: Option<String>,

        /// Compression: gzip or snappy
        #[arg(long)]
        compression: Option<String>,

        /// Stream name (used when --sql is not set)
        #[arg(long)]
        name: Option<String>,

        /// Column overrides as JSON or YAML
        #[arg(long)]
        columns: Option<String>,

        /// Rows per batch
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Move multiple streams from one config
    Mvs {
        /// YAML configuration file
        #[arg(long, required = true)]
        config: PathBuf,

        /// Output format override for all tables
        #[arg(long)]
        format: Option<String>,

        /// Filename template override for all tables
        #[arg(long)]
        filename: Option<String>,

        /// Compression override for all tables
        #[arg(long)]
        compression: Option<String>,

        /// Comma separated list of which tables to process
        #[arg(long)]
        select: Option<String>,
    },

    /// Execute a server-side command without streaming rows
    Exec {
        /// SQL command to execute
        #[arg(long, required = true)]
        sql: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

fn setup_logging(cli: &Cli) {
    if cli.silent {
        return;
    }

    let level = match cli.log_level.as_deref() {
        Some(raw) => raw.parse().unwrap_or(Level::INFO),
        None if cli.debug => Level::DEBUG,
        None => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if cli.console {
        subscriber.init();
    } else {
        subscriber.json().init();
    }
}

fn effective_concurrency(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

async fn run(cli: Cli) -> Result<(), MvrError> {
    let cancel = setup_signal_handler()?;
    let concurrency = effective_concurrency(cli.concurrency);
    let show_progress = !cli.quiet && !cli.silent;

    match cli.command {
        Commands::Mv {
            config,
            format,
            filename,
            sql,
            compression,
            name,
            columns,
            batch_size,
        } => {
            let config_text = match &config {
                Some(path) => std::fs::read_to_string(path).map_err(|e| {
                    MvrError::Config(format!("error reading config {:?}: {}", path, e))
                })?,
                None => String::new(),
            };

            let overrides = StreamSpec {
                stream_name: name.unwrap_or_default(),
                format: format.unwrap_or_default(),
                filename: filename.unwrap_or_default(),
                sql: sql.unwrap_or_default(),
                compression: compression.unwrap_or_default(),
                columns: parse_columns(columns.as_deref())?,
                batch_size: batch_size.unwrap_or(0),
                ..Default::default()
            };

            let mut spec = mvr::build_stream_spec(&config_text, &overrides)?;

            let orchestrator = Orchestrator::connect(concurrency).await?;
            let result = orchestrator.run_stream(&mut spec, cancel).await;
            orchestrator.close().await;
            let flow = result?;
            if show_progress {
                eprintln!("Wrote {} rows ({} bytes)", flow.rows, flow.bytes);
            }
        }

        Commands::Mvs {
            config,
            format,
            filename,
            compression,
            select,
        } => {
            let config_text = std::fs::read_to_string(&config).map_err(|e| {
                MvrError::Config(format!("error reading config {:?}: {}", config, e))
            })?;
            let mut multi: mvr::MultiStreamSpec = serde_yaml::from_str(&config_text)?;

            let overrides = StreamSpec {
                format: format.unwrap_or_default(),
                filename: filename.unwrap_or_default(),
                compression: compression.unwrap_or_default(),
                ..Default::default()
            };
            multi.root.override_values(&overrides);

            let orchestrator = Orchestrator::connect(concurrency).await?;
            let result = orchestrator
                .run_multi(&multi, select.as_deref().unwrap_or_default(), cancel)
                .await;
            orchestrator.close().await;
            let results = result?;
            info!("completed {} streams", results.len());
        }

        Commands::Exec { sql } => {
            let status = Orchestrator::exec(&sql).await?;
            println!("{}", status);
        }
    }

    Ok(())
}

fn parse_columns(raw: Option<&str>) -> Result<Vec<mvr::ColumnOverride>, MvrError> {
    match raw {
        // JSON is a subset of YAML, so one parser covers both forms
        Some(text) if !text.trim().is_empty() => Ok(serde_yaml::from_str(text)?),
        _ => Ok(Vec::new()),
    }
}

/// SIGINT and SIGTERM both cancel the run; the pipeline stops at the
/// next row-fetch boundary and teardown still runs.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MvrError> {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to install SIGINT handler: {}", e);
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT, shutting down"),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM, shutting down"),
        }
        token.cancel();
    });

    Ok(cancel)
}

#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MvrError> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C, shutting down");
            token.cancel();
        }
    });
    Ok(cancel)
}
