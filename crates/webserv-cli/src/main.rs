use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use webserv_core::{Config, Server, ShutdownToken, logging};

#[derive(Parser)]
#[command(name = "webserv")]
#[command(about = "Single-threaded HTTP/1.1 server with static files, uploads and CGI")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(default_value = "webserv.toml")]
    config: PathBuf,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    /// Emit one JSON object per log line
    #[arg(long)]
    json_logs: bool,

    /// Parse and validate the configuration, then exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    match (cli.json_logs, cli.verbose) {
        (true, _) => logging::init_logging_json(level),
        (false, true) => logging::init_logging_with_level(level),
        (false, false) => logging::init_logging(),
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&cli.config)?;
    if cli.check {
        info!(path = %cli.config.display(), servers = config.servers.len(), "configuration ok");
        return Ok(());
    }

    let shutdown = ShutdownToken::new();
    shutdown.install_signal_handler()?;

    let mut server = Server::bind(config)?.with_shutdown(shutdown);
    for addr in server.local_addrs() {
        info!("webserv ready on http://{addr}");
    }
    server.run()?;
    Ok(())
}
