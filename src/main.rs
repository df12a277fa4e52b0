//! Plugdir CLI - inspect a plugin directory and run test plugins.
//!
//! This is the main binary entry point. See the `plugdir` library for the
//! core functionality.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use plugdir::constants::WAIT_TIMEOUT;
use plugdir::discovery::{Change, DirWatcher};
use plugdir::{Config, ConnectionHandler, DirDiscovery, DiscoveryError, PluginServer, ServerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};

/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "plugdir")]
#[command(version)]
#[command(about = "Discover plugins listening on Unix sockets")]
struct Cli {
    /// Discovery directory (defaults to the configured plugins_dir)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List reachable plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Resolve one plugin name to its socket address
    Find {
        /// Plugin name, `lookup[/subtype]`
        name: String,
    },
    /// Serve an echo plugin under NAME until interrupted
    Serve {
        /// Plugin name to publish
        name: String,
    },
    /// Block until a plugin becomes reachable
    Wait {
        /// Plugin name
        name: String,
        /// Give up after this many seconds
        #[arg(long, default_value_t = WAIT_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Print plugins as they appear and vanish
    Watch {
        /// Stop after this many seconds (runs until interrupted if omitted)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show the effective configuration
    Config,
}

/// Echoes whatever a client sends back to it.
struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, mut stream: UnixStream, conn_id: String) {
        log::debug!("Client {conn_id} connected");
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = stream.write_all(&buf[..n]).await {
                        log::debug!("Client {conn_id} write failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("Client {conn_id} read failed: {e}");
                    break;
                }
            }
        }
        log::debug!("Client {conn_id} disconnected");
    }
}

fn init_logging() -> Result<()> {
    let builder_env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(builder_env);
    if let Ok(path) = std::env::var("PLUGDIR_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn discovery(config: &Config) -> Result<DirDiscovery> {
    DirDiscovery::from_config(config)
        .with_context(|| format!("Cannot open plugin directory {}", config.plugins_dir.display()))
}

fn list(config: &Config, json: bool) -> Result<()> {
    let plugins = discovery(config)?.list()?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = plugins
            .iter()
            .map(|(name, endpoint)| (name.clone(), endpoint.address().into()))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    if plugins.is_empty() {
        println!("No plugins in {}", config.plugins_dir.display());
    }
    for (name, endpoint) in &plugins {
        println!("{name:<24} {}", endpoint.address());
    }
    Ok(())
}

fn find(config: &Config, name: &str) -> Result<()> {
    match discovery(config)?.find(name) {
        Ok(endpoint) => {
            println!("{}", endpoint.address());
            Ok(())
        }
        Err(e @ DiscoveryError::NotFound { .. }) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
        Err(e @ DiscoveryError::NotASocket { .. }) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

fn serve(config: &Config, name: &str) -> Result<()> {
    std::fs::create_dir_all(&config.plugins_dir)
        .with_context(|| format!("Failed to create plugin directory {}", config.plugins_dir.display()))?;
    let path = plugdir::plugin::path_for(&config.plugins_dir, name)?;
    let options = ServerOptions {
        probe_timeout: config.probe_timeout(),
        socket_mode: config.socket_mode,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        // Register before binding so a signal sent as soon as the socket
        // appears is not lost.
        let mut term = signal(SignalKind::terminate())?;

        let mut server = PluginServer::start_at_path_with(&path, EchoHandler, options)?;
        println!("Serving {name} at unix://{}", path.display());

        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = term.recv() => {}
        }

        log::info!("Shutting down plugin {name}");
        server.stop()?;
        Ok::<(), anyhow::Error>(())
    })
}

fn wait(config: &Config, name: &str, timeout: Duration) -> Result<()> {
    let endpoint = discovery(config)?
        .wait_for(name, timeout)
        .with_context(|| format!("{name} did not come up within {timeout:?}"))?;
    println!("{}", endpoint.address());
    Ok(())
}

fn watch(config: &Config, timeout: Option<Duration>) -> Result<()> {
    let mut watcher = DirWatcher::new(discovery(config)?, config.poll_interval())?;
    for (name, endpoint) in watcher.current() {
        println!("= {name} {}", endpoint.address());
    }

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                deadline - now
            }
            None => Duration::from_secs(60),
        };

        for change in watcher.next_changes(slice)? {
            match change {
                Change::Appeared(endpoint) => println!("+ {} {}", endpoint.name(), endpoint.address()),
                Change::Vanished(name) => println!("- {name}"),
            }
        }
    }
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(dir) = cli.dir {
        config.plugins_dir = dir;
    }

    match cli.command {
        Commands::List { json } => list(&config, json)?,
        Commands::Find { name } => find(&config, &name)?,
        Commands::Serve { name } => serve(&config, &name)?,
        Commands::Wait { name, timeout } => wait(&config, &name, Duration::from_secs(timeout))?,
        Commands::Watch { timeout } => watch(&config, timeout.map(Duration::from_secs))?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
