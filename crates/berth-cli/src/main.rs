mod cmd;
mod output;

use berth_core::{BerthError, ErrorKind};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "berth",
    about = "Converge a single host into a known state running the supervised bot",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Source repository override
    #[arg(long, global = true, env = "BERTH_SOURCE_URL")]
    source: Option<String>,

    /// Branch or tag override
    #[arg(long, global = true, env = "BERTH_REVISION")]
    revision: Option<String>,

    /// Private key path override
    #[arg(long, global = true, env = "BERTH_IDENTITY")]
    identity: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the host from any state into a running, supervised service
    Provision {
        /// Target address (default: BERTH_HOST, then cloud tag lookup)
        host: Option<String>,

        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Sync code and dependencies on a provisioned host, then restart
    Update {
        host: Option<String>,

        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Discover and show the host's current state
    Status { host: Option<String> },

    /// Tail the service journal
    Logs {
        host: Option<String>,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        lines: u32,

        /// Keep following new lines until the connection drops
        #[arg(long, short = 'f')]
        follow: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        json,
        source,
        revision,
        identity,
        command,
    } = cli;

    match command {
        Commands::Provision { host, yes } => {
            let session = cmd::open(host.as_deref(), source, revision, identity)?;
            cmd::provision::run(&session, yes, json)
        }
        Commands::Update { host, yes } => {
            let session = cmd::open(host.as_deref(), source, revision, identity)?;
            cmd::update::run(&session, yes, json)
        }
        Commands::Status { host } => {
            let session = cmd::open(host.as_deref(), source, revision, identity)?;
            cmd::status::run(&session, json)
        }
        Commands::Logs {
            host,
            lines,
            follow,
        } => {
            let session = cmd::open(host.as_deref(), source, revision, identity)?;
            cmd::logs::run(&session, lines, follow)
        }
    }
}

/// Exit codes distinguish the failure classes an operator reacts to
/// differently: 2 precondition, 3 transport, 4 remote command, 5 supervisor.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<BerthError>().map(BerthError::kind) {
        Some(ErrorKind::Precondition) => 2,
        Some(ErrorKind::Transport) => 3,
        Some(ErrorKind::RemoteCommand) => 4,
        Some(ErrorKind::Supervisor) => 5,
        Some(ErrorKind::Other) | None => 1,
    }
}
