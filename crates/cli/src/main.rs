//! genstream CLI
//!
//! Watch generation events on a channel, inspect a running watcher's
//! connection store, and show resolved configuration.

mod cmd_debug;
mod cmd_status;
mod cmd_watch;
mod logging;
mod paths;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use genstream_client::{ClientConfig, TransportKind};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "genstream",
    version,
    about = "Watch real-time generation events",
    arg_required_else_help = true
)]
struct Cli {
    /// Data directory (default: $GENSTREAM_DATA_DIR or ~/.genstream).
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data dir>/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to stderr instead of the log file.
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a channel and print its events until Ctrl-C.
    Watch(WatchArgs),

    /// Show the connection store of a running `watch --debug-addr`.
    Debug {
        /// Address of the watcher's debug endpoint.
        #[arg(long, default_value = "127.0.0.1:7979")]
        addr: SocketAddr,

        /// Print raw JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print version, data dir and resolved configuration.
    Status,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args, Debug)]
pub struct WatchArgs {
    /// Channel id, e.g. `file.123` or `project.42`.
    pub channel: String,

    #[arg(long, value_enum, default_value_t = TransportArg::Ws)]
    pub transport: TransportArg,

    /// Tag the transport for log correlation (default: random).
    #[arg(long, value_name = "ID")]
    pub correlation_id: Option<String>,

    /// Serve `/debug` and `/health` on this address while watching.
    #[arg(long, value_name = "ADDR")]
    pub debug_addr: Option<SocketAddr>,

    /// Print each envelope as a JSON line.
    #[arg(long)]
    pub json: bool,

    /// Override the server-push base URL.
    #[arg(long, value_name = "URL")]
    pub sse_url: Option<String>,

    /// Override the socket URL.
    #[arg(long, value_name = "URL")]
    pub ws_url: Option<String>,

    /// Override the socket reconnect budget.
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Sse,
    Ws,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Sse => TransportKind::Sse,
            TransportArg::Ws => TransportKind::WebSocket,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "genstream", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = paths::resolve_data_dir(cli.data_dir.as_deref())?;
    paths::ensure_dirs(&data_dir)?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths::config_path(&data_dir));

    match cli.command {
        Command::Watch(args) => {
            let _logging = logging::init_logging(&paths::log_dir(&data_dir), cli.log_stderr)?;
            let config = load_config(&config_path, Some(&args))?;
            cmd_watch::run(args, config).await
        }
        Command::Debug { addr, json } => cmd_debug::run(addr, json).await,
        Command::Status => {
            let config = load_config(&config_path, None)?;
            cmd_status::run(&data_dir, &config_path, &config)
        }
        Command::Completions { .. } => Ok(()),
    }
}

/// Defaults < config file < `GENSTREAM_*` env < CLI flags.
fn load_config(path: &Path, watch: Option<&WatchArgs>) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::load_or_default(path)?.with_env()?;
    if let Some(args) = watch {
        if let Some(url) = &args.sse_url {
            config.sse_base_url = url.clone();
        }
        if let Some(url) = &args.ws_url {
            config.ws_url = url.clone();
        }
        if let Some(n) = args.max_attempts {
            config.max_reconnect_attempts = n;
        }
    }
    config.validate()?;
    Ok(config)
}
