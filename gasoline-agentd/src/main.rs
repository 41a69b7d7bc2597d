use clap::Parser;
use gasoline_agentd::adapters::daemon::ProcessDaemonControl;
use gasoline_agentd::app::tools::ToolTimeouts;
use gasoline_agentd::lifecycle::{commands, preflight};
use gasoline_agentd::ports::daemon::{DaemonControl, DaemonError};
use gasoline_agentd::state::StatePaths;
use gasoline_agentd::telemetry::{init_tracing, JsonlLog};
use gasoline_agentd::{
    run, run_bridge, BridgeConfig, Settings, API_KEY_ENV, DEFAULT_PORT, VERSION,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};

const MCP_MODE_ENV: &str = "MCP_MODE";

#[derive(Parser, Debug)]
#[command(
    name = "gasoline",
    author,
    version,
    about = "Browser telemetry for AI coding agents: MCP stdio bridge and local capture daemon",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        env = "GASOLINE_PORT",
        default_value_t = DEFAULT_PORT,
        help = "Loopback port of the capture daemon"
    )]
    port: u16,

    #[arg(long, conflicts_with = "bridge", help = "Run the HTTP capture daemon")]
    daemon: bool,

    #[arg(long, help = "Run the MCP stdio bridge (default when stdin is not a terminal)")]
    bridge: bool,

    #[arg(
        long,
        value_name = "PATH",
        env = "GASOLINE_STATE_DIR",
        help = "Directory for logs, PID files, screenshots and sessions"
    )]
    state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = API_KEY_ENV,
        hide_env_values = true,
        help = "Require this key in X-Gasoline-Key on every daemon request"
    )]
    api_key: Option<String>,

    #[arg(long, help = "Stop the daemon on --port and exit")]
    stop: bool,

    #[arg(long, help = "Report daemon health and bridge fast-path statistics")]
    check: bool,

    #[arg(long, help = "Terminate every gasoline daemon and remove stale PID files")]
    force_cleanup: bool,

    #[arg(long, default_value = "info", help = "Default log filter when RUST_LOG is unset")]
    log_level: String,

    #[arg(long, hide = true, env = "GASOLINE_EXTENSION_ID")]
    extension_id: Option<String>,

    #[arg(long, hide = true, value_name = "PATH")]
    project_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Daemon,
    Bridge,
}

impl Cli {
    fn mode(&self, mcp_mode: bool) -> Mode {
        if self.daemon && !mcp_mode {
            Mode::Daemon
        } else {
            Mode::Bridge
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let paths = StatePaths::resolve(cli.state_dir.clone())?;
    let api_key = cli.api_key.clone().filter(|key| !key.is_empty());

    if cli.stop || cli.check || cli.force_cleanup {
        init_tracing(None, "warn")?;
        let control = ProcessDaemonControl::new(cli.port, paths.clone(), api_key)?;
        return Ok(one_shot(&cli, &control, &paths).await);
    }

    let mcp_mode = std::env::var(MCP_MODE_ENV).is_ok_and(|value| value == "1");
    match cli.mode(mcp_mode) {
        Mode::Daemon => run_daemon(cli, paths, api_key).await,
        Mode::Bridge => run_stdio_bridge(cli.port, paths, api_key, &cli.log_level).await,
    }
}

async fn one_shot(cli: &Cli, control: &dyn DaemonControl, paths: &StatePaths) -> ExitCode {
    let lifecycle = JsonlLog::lifecycle(paths.lifecycle_log());
    if cli.stop {
        let report = commands::stop(control, &lifecycle).await;
        println!("{report}");
        return if report.stopped {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }
    if cli.force_cleanup {
        let report = commands::force_cleanup(control, paths, &lifecycle).await;
        println!("{report}");
        return if report.failed.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }
    let report = commands::check(control, paths, VERSION).await;
    print!("{}", report.render());
    if report.healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run_daemon(
    cli: Cli,
    paths: StatePaths,
    api_key: Option<String>,
) -> anyhow::Result<ExitCode> {
    paths.ensure()?;
    init_tracing(Some(&paths.daemon_log()), &cli.log_level)?;

    let control = ProcessDaemonControl::new(cli.port, paths.clone(), api_key.clone())?;
    if let Some(conflict) = preflight::check_port(&control).await {
        error!(%conflict, "port preflight failed");
        eprintln!("gasoline: {conflict}");
        return Ok(ExitCode::FAILURE);
    }

    let settings = Settings {
        port: cli.port,
        state_dir: paths.root().to_path_buf(),
        api_key,
        project_path: cli.project_dir,
        extension_id: cli.extension_id,
        auto_upgrade: true,
        timeouts: ToolTimeouts::default(),
    };
    run(settings).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_stdio_bridge(
    port: u16,
    paths: StatePaths,
    api_key: Option<String>,
    log_level: &str,
) -> anyhow::Result<ExitCode> {
    paths.ensure()?;
    init_tracing(Some(&paths.bridge_log()), log_level)?;

    let control: Arc<dyn DaemonControl> =
        Arc::new(ProcessDaemonControl::new(port, paths.clone(), api_key.clone())?);
    let mut config = BridgeConfig::new(port, paths);
    config.api_key = api_key;

    let input = BufReader::new(tokio::io::stdin());
    match run_bridge(config, control, input, tokio::io::stdout()).await {
        Ok(stats) => {
            info!(requests = stats.requests, "bridge finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => match err.downcast_ref::<DaemonError>() {
            Some(DaemonError::VersionMismatch { running, expected }) => {
                error!(%running, %expected, "refusing to bridge to a different daemon version");
                eprintln!(
                    "gasoline: daemon on port {port} runs {running}, this binary is {expected}; \
                     stop it with: gasoline --stop --port {port}"
                );
                Ok(ExitCode::from(2))
            }
            Some(DaemonError::ForeignService { service }) => {
                error!(%service, "port held by another service");
                eprintln!("gasoline: port {port} is used by another service ({service})");
                Ok(ExitCode::FAILURE)
            }
            _ => Err(err),
        },
    }
}
