use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use token_board::{ConfigStore, LocalAcn, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tokenboard-server", about = "Metadata-resistant group messaging relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Write the tofu bundle to <config_dir>/tofubundle after startup
    #[arg(long = "export-tofu-bundle")]
    export_tofu_bundle: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a fresh default config in the current directory and exit
    Gen1,
}

fn config_dir() -> PathBuf {
    std::env::var("CWTCH_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(unix)]
fn write_private(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &std::path::Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(Command::Gen1) = cli.command {
        if let Err(e) = ConfigStore::create(&PathBuf::from("."), None) {
            error!("could not generate config: {}", e);
            exit(1);
        }
        return;
    }

    let dir = config_dir();
    let config = match ConfigStore::load_or_create(&dir, None) {
        Ok(config) => config,
        Err(e) => {
            error!("could not load config: {}", e);
            exit(1);
        }
    };

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("could not set up server: {}", e);
            exit(1);
        }
    };

    info!("starting relay server...");
    let acn = LocalAcn::new();
    if let Err(e) = server.run(&acn).await {
        error!("could not start server: {}", e);
        exit(1);
    }

    match server.tofu_bundle() {
        Ok(bundle) => {
            info!("server tofu bundle (import into a client to use): {}", bundle);
            if cli.export_tofu_bundle {
                if let Err(e) = write_private(&dir.join("tofubundle"), &bundle) {
                    error!("could not export tofu bundle: {}", e);
                }
            }
        }
        Err(e) => error!("could not derive tofu bundle: {}", e),
    }
    info!("server address: {}", server.onion());
    info!("server petname: {}", server.hash_name());

    tokio::signal::ctrl_c().await.expect("signal handler");
    info!("shutting down server");
    server.shutdown().await;
}
