//! Skiff - web console for one-shot FreeBSD jails
//!
//! Every command typed into the console runs in a jail that is created for
//! it, provisioned from a base release, and destroyed afterwards.

mod cli;
mod error;
mod executor;
mod host;
mod jail;
mod manifest;
mod network;
mod provider;
mod release;
mod supply;
mod web;
mod zfs;

use cli::{Cli, Commands};
use error::Result;
use executor::OneShotExecutor;
use host::HostProvider;
use manifest::SkiffConfig;
use release::ReleaseStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Logs go to stderr; `RUST_LOG` wins over the `-v` default
fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let home = cli.home_dir();
    let config_path = cli.config_path();
    let load_config = || manifest::load_or_default(&config_path);

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
        }

        Commands::Run {
            bind,
            port,
            insecure,
        } => {
            let mut config = load_config()?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.server.insecure |= insecure;
            serve(config, home)?;
        }

        Commands::Exec {
            command,
            timeout,
            json,
        } => {
            warn_unless_root();
            let config = load_config()?;
            let executor = OneShotExecutor::new(HostProvider::new(&config), &config)?;
            let command = command.join(" ");
            let outcome = match timeout {
                Some(0) => executor.run_once_with_timeout(&command, None),
                Some(secs) => {
                    executor.run_once_with_timeout(&command, Some(Duration::from_secs(secs)))
                }
                None => executor.run_once(&command),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if outcome.is_success() {
                print!("{}", outcome.text());
            } else {
                eprintln!("{}", web::render::outcome_text(&outcome));
            }

            if !outcome.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Fetch { release, force } => {
            warn_unless_root();
            let store = ReleaseStore::from_config(&load_config()?)?;
            let path = store.fetch(&release, force)?;
            println!("Release '{}' ready at {}", release, path.display());
        }

        Commands::Releases { json } => {
            let store = ReleaseStore::from_config(&load_config()?)?;
            let releases = store.list()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&releases)?);
            } else if releases.is_empty() {
                println!("No releases fetched.");
                println!("Use 'skiff fetch <release>' to fetch one.");
            } else {
                println!("Fetched releases:");
                for release in releases {
                    let status = if release.complete { "" } else { " (incomplete)" };
                    println!("  {} - {}{}", release.name, release.path.display(), status);
                }
            }
        }
    }

    Ok(())
}

/// Start the console and block until Ctrl-C
fn serve(config: SkiffConfig, home: std::path::PathBuf) -> Result<()> {
    warn_unless_root();

    let tls = if config.server.insecure {
        warn!("serving plain HTTP");
        None
    } else {
        let (cert, key) = web::tls::ensure_certificate(&home)?;
        Some(web::tls::acceptor(&cert, &key)?)
    };

    let executor = OneShotExecutor::new(HostProvider::new(&config), &config)?;
    let static_dir = config
        .server
        .static_dir
        .clone()
        .unwrap_or_else(|| home.join("static"));
    let console = Arc::new(web::Console::new(executor, Some(static_dir)));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = web::server::bind(&config.server.bind, config.server.port).await?;
        web::serve(console, listener, tls, shutdown_signal()).await
    })?;

    info!("console stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

fn warn_unless_root() {
    if unsafe { libc::getuid() } != 0 {
        warn!("not running as root, jail operations will fail");
    }
}
