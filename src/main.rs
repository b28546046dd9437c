use clap::{Parser, Subcommand};
use iperf_watch::command::{CommandLine, IperfArgs};
use iperf_watch::config::{self, WatchConfig, DEFAULT_CONFIG_FILE};
use iperf_watch::monitor::{ProcessStreamMonitor, SessionHandle};
use iperf_watch::render::TerminalObserver;
use std::path::PathBuf;

/// Run iperf3 and watch its throughput live: launch the tool, decode its
/// JSON output as it streams, and print each interval as it arrives.
#[derive(Parser, Debug)]
#[command(name = "iperf-watch", version, about)]
pub struct Cli {
    /// Config file path (default: iperf-watch.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print the resolved command line, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Debug logging (stderr lines, snapshots, termination steps)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a client test against a server
    Client {
        /// Server host (overrides config)
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Reporting interval in seconds
        #[arg(short, long)]
        interval: Option<u32>,

        /// Test duration in seconds
        #[arg(short = 't', long)]
        duration: Option<u32>,

        /// Path to the iperf3 executable
        #[arg(long)]
        binary: Option<PathBuf>,
    },
    /// Serve a single test, then report it
    Server {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the iperf3 executable
        #[arg(long)]
        binary: Option<PathBuf>,
    },
    /// Watch any command that writes JSON to stdout
    Run {
        /// Array field holding progress records
        #[arg(long)]
        progress_field: Option<String>,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprintln!("error: {e}");
            2
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "iperf_watch=debug"
    } else {
        "iperf_watch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether the session produced a successful result.
async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let (path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut config = config::load_config(&path, explicit)?;
    let command = resolve_command(cli.command, &mut config)?;

    if cli.dry_run {
        println!("{command}");
        return Ok(true);
    }

    let (monitor, mut dispatcher) = ProcessStreamMonitor::new(config.monitor.clone());
    let (observer, verdict) =
        TerminalObserver::new(std::io::stdout(), &config.monitor.progress_field);
    let handle = monitor.start(command, observer);

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !interrupt(&ctrl_c) {
                break;
            }
        }
    });

    if !dispatcher.run_until_complete(handle.id()).await {
        tracing::warn!(session = %handle.id(), "session ended without a result");
        return Ok(false);
    }
    Ok(verdict.succeeded())
}

/// Handle one Ctrl-C: the first stops the test gracefully, the next kills
/// it outright. Returns false once there is nothing left to escalate.
fn interrupt(handle: &SessionHandle) -> bool {
    if handle.cancel() {
        eprintln!("stopping test... (Ctrl-C again to kill)");
        true
    } else {
        eprintln!("killing test");
        handle.kill();
        false
    }
}

/// Merge CLI overrides into `config` and build the command to monitor.
fn resolve_command(
    command: Commands,
    config: &mut WatchConfig,
) -> Result<CommandLine, Box<dyn std::error::Error>> {
    let command = match command {
        Commands::Client {
            host,
            port,
            interval,
            duration,
            binary,
        } => {
            let iperf = &mut config.iperf;
            if let Some(host) = host {
                iperf.host = host;
            }
            if let Some(port) = port {
                iperf.port = port;
            }
            if let Some(interval) = interval {
                iperf.interval_secs = interval;
            }
            if let Some(duration) = duration {
                iperf.duration_secs = duration;
            }
            if let Some(binary) = binary {
                iperf.binary = binary;
            }
            config.validate()?;
            IperfArgs::client(&config.iperf).to_command()?
        }
        Commands::Server { port, binary } => {
            if let Some(port) = port {
                config.iperf.port = port;
            }
            if let Some(binary) = binary {
                config.iperf.binary = binary;
            }
            config.validate()?;
            IperfArgs::server(&config.iperf).to_command()?
        }
        Commands::Run {
            progress_field,
            argv,
        } => {
            if let Some(field) = progress_field {
                config.monitor.progress_field = field;
            }
            config.validate()?;
            CommandLine::from_argv(argv)?
        }
    };
    Ok(command)
}
