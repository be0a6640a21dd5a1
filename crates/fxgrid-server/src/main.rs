//! Session server binary. Also runs as a sandbox or a one-shot plugin scanner
//! when started by another server process.

use clap::{Args, Parser, Subcommand};
use fxgrid_server::{
    ChildProcessLauncher, GridError, PluginCatalog, PluginFormat, PluginScanner, Result,
    ScanIsolation, ServerConfig, ServerRole, SessionServer, EXIT_MASTER_LOST,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fxgrid-server",
    about = "Remote effect processing server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Args, Clone, Default)]
struct ServeArgs {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port, overrides the config
    #[arg(short, long)]
    port: Option<u16>,

    /// Server id, overrides the config
    #[arg(long)]
    id: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept sessions (default)
    Serve(ServeArgs),
    /// Run as the sandbox of a master server
    Sandbox {
        #[arg(long)]
        control_addr: SocketAddr,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "0.0.0.0")]
        listen_host: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Describe one plugin as JSON on stdout
    Scan {
        #[arg(long)]
        id: String,
        #[arg(long)]
        format: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // stdout carries scan results
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command.unwrap_or(Commands::Serve(cli.serve)) {
        Commands::Serve(args) => exit_code(serve(args)),
        Commands::Sandbox {
            control_addr,
            key,
            listen_host,
            config,
        } => match sandbox(control_addr, key, listen_host, config.as_deref()) {
            Err(GridError::MasterDisconnected) => EXIT_MASTER_LOST,
            result => exit_code(result),
        },
        Commands::Scan { id, format, config } => exit_code(scan(&id, &format, config.as_deref())),
    };
    process::exit(code);
}

fn exit_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::load(path),
        None => Ok(ServerConfig::default()),
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        tracing::error!(
            "Panic in thread '{}': {}",
            thread.name().unwrap_or("<unnamed>"),
            info
        );
        default_hook(info);
    }));
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(id) = args.id {
        config.id = id;
    }
    if config.crash_reporting {
        install_panic_hook();
    }

    let mut launcher = ChildProcessLauncher::current_exe(config.host.clone())?;
    if let Some(path) = &args.config {
        launcher = launcher.config_path(path);
    }
    let isolation = if config.scan_isolated {
        ScanIsolation::ChildProcess {
            exe: std::env::current_exe()?,
        }
    } else {
        ScanIsolation::InProcess
    };

    let server = SessionServer::builder(config)
        .launcher(Arc::new(launcher))
        .scan_isolation(isolation)
        .build()?;
    server.initialize()?;
    let result = server.run();
    server.shutdown();
    result
}

fn sandbox(
    control_addr: SocketAddr,
    key: String,
    listen_host: String,
    config: Option<&Path>,
) -> Result<()> {
    let config = load_config(config)?;
    if config.crash_reporting {
        install_panic_hook();
    }

    let server = SessionServer::builder(config)
        .role(ServerRole::Sandbox {
            control_addr,
            key,
            listen_host,
        })
        .build()?;
    server.initialize()?;
    server.run()
}

fn scan(id: &str, format: &str, config: Option<&Path>) -> Result<()> {
    let format = PluginFormat::parse(format)
        .ok_or_else(|| GridError::ProtocolError(format!("unknown plugin format '{}'", format)))?;
    let config = load_config(config)?;

    let scanner = PluginScanner::new(config, PluginCatalog::new()).with_default_scanners();
    let descs = scanner.describe(id, format)?;
    if descs.is_empty() {
        return Err(GridError::ScanFailed {
            id: id.to_string(),
            reason: "no plugins found".to_string(),
        });
    }
    println!("{}", serde_json::to_string(&descs)?);
    Ok(())
}
