//! Loopback IPC demo - host a math service or call it from another process.
//!
//! Run `ipc-demo serve` in one terminal and `ipc-demo add 9 11` in another.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use loopback_ipc::{
    parse_params, ClientDialer, DialerOptions, IpcError, RequestContext, ServerListener,
    ServerOptions, Service, Version,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_NAME: &str = "ipc-demo.math";
const DEFAULT_BASE_PORT: u16 = 30000;

#[derive(Parser, Debug)]
#[command(name = "ipc-demo")]
#[command(about = "Loopback IPC math service")]
struct Args {
    /// Server name shared by host and clients
    #[arg(long, default_value = DEFAULT_NAME, global = true)]
    name: String,

    /// First port of the scan range
    #[arg(long, default_value_t = DEFAULT_BASE_PORT, global = true)]
    base_port: u16,

    /// Lock file directory (defaults to the per-user runtime directory)
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the service until Ctrl-C
    Serve {
        /// Server version; the fourth component is the protocol revision
        #[arg(long, default_value = "1.0.0.0")]
        version: String,
    },
    /// Ask a running host to add two numbers
    Add {
        a: i64,
        b: i64,

        /// Protocol revision to look for
        #[arg(long, default_value_t = 0)]
        revision: u32,
    },
}

/// Adds numbers and counts how many additions it has done.
struct MathService;

#[async_trait]
impl Service for MathService {
    type ServerState = AtomicU64;
    type ClientState = ();

    async fn call(
        &self,
        ctx: &RequestContext<'_, Self>,
        method: &str,
        params: Value,
    ) -> loopback_ipc::Result<Value> {
        match method {
            "add" => {
                let (a, b): (i64, i64) = parse_params(params)?;
                let total = ctx.server_state().fetch_add(1, Ordering::Relaxed) + 1;
                info!(
                    "Client {} asked for {} + {} (request #{})",
                    ctx.connection.id(),
                    a,
                    b,
                    total
                );
                a.checked_add(b)
                    .map(|sum| json!(sum))
                    .ok_or_else(|| IpcError::InvalidParams {
                        message: format!("{} + {} overflows", a, b),
                    })
            }
            _ => Err(IpcError::MethodNotFound(method.to_string())),
        }
    }
}

async fn serve(args: &Args, version: &str) -> Result<()> {
    let version = Version::parse(version)?;
    let mut options = ServerOptions::default();
    if let Some(dir) = &args.lock_dir {
        options = options.with_lock_dir(dir);
    }

    let server = ServerListener::builder(MathService)
        .options(options)
        .on_client_connected(|conn| info!("Client {} joined from {}", conn.id(), conn.peer_addr()))
        .on_client_disconnected(|conn| info!("Client {} left", conn.id()))
        .build();
    let port = server
        .start(&args.name, args.base_port, version.clone())
        .await
        .with_context(|| format!("Failed to start server {}", args.name))?;
    info!("Serving {} version {} on port {}", args.name, version, port);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    server.dispose().await;
    Ok(())
}

async fn add(args: &Args, a: i64, b: i64, revision: u32) -> Result<()> {
    let mut options = DialerOptions::default();
    if let Some(dir) = &args.lock_dir {
        options = options.with_lock_dir(dir);
    }

    let client = ClientDialer::builder().options(options).build();
    let version = client
        .connect(&args.name, args.base_port, revision)
        .await
        .with_context(|| format!("Failed to reach server {}", args.name))?;
    info!("Connected to {} version {}", args.name, version);

    let sum: i64 = client.call("add", &(a, b)).await?;
    println!("{}", sum);

    client.dispose().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match &args.command {
        Command::Serve { version } => serve(&args, version).await,
        Command::Add { a, b, revision } => add(&args, *a, *b, *revision).await,
    }
}
