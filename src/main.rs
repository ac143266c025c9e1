//! janus - one-way workspace synchronisation over a framed binary protocol.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use janus_sync::client::{run_sync, SyncOptions};
use janus_sync::config::{self, Mode, Overrides, Settings};
use janus_sync::conn::WorkspaceLocked;
use janus_sync::server::Server;
use janus_sync::tls;

#[derive(Parser, Debug)]
#[command(
    name = "janus",
    version,
    about = "High-throughput one-way directory synchronisation"
)]
struct Options {
    /// Run as the receiving server
    #[arg(long, conflicts_with = "client")]
    server: bool,

    /// Run as the pushing client
    #[arg(long)]
    client: bool,

    /// Address to bind (server) or connect to (client)
    #[arg(long, alias = "ip")]
    host: Option<String>,

    /// TCP port
    #[arg(long)]
    port: Option<u16>,

    /// JSON configuration file (comments and trailing commas tolerated)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Workspace to serve or sync
    #[arg(long)]
    workspace: Option<String>,

    /// Workspace directory
    #[arg(long)]
    path: Option<PathBuf>,

    /// Shared secret for challenge-response authentication
    #[arg(long)]
    secret: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    ssl_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    ssl_key: Option<PathBuf>,

    /// Policy for remote files absent locally: remove, keep or panic
    #[arg(long, value_name = "POLICY")]
    dangling: Option<String>,

    /// Print usage and exit
    #[arg(long)]
    usage: bool,

    /// Write a self-signed Ed25519 CA and certificate, then exit
    #[arg(long)]
    generate_ssl_keys: bool,
}

fn main() {
    let opts = Options::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if opts.usage {
        use clap::CommandFactory;
        Options::command().print_help().ok();
        println!();
        std::process::exit(0);
    }

    if opts.generate_ssl_keys {
        let code = match tls::generate_keys(opts.ssl_cert.as_deref(), opts.ssl_key.as_deref()) {
            Ok(()) => 0,
            Err(e) => {
                error!("{:#}", e);
                1
            }
        };
        std::process::exit(code);
    }

    let code = match run(opts) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            if e.downcast_ref::<WorkspaceLocked>().is_some() {
                2
            } else {
                1
            }
        }
    };
    std::process::exit(code);
}

fn run(opts: Options) -> Result<()> {
    let raw = opts
        .config
        .as_deref()
        .map(config::load_config_file)
        .transpose()?;
    let overrides = Overrides {
        server: opts.server,
        client: opts.client,
        host: opts.host.clone(),
        port: opts.port,
        workspace: opts.workspace.clone(),
        path: opts.path.clone(),
        secret: opts.secret.clone(),
        ssl_cert: opts.ssl_cert.clone(),
        ssl_key: opts.ssl_key.clone(),
        dangling: opts.dangling.clone(),
    };
    let settings = config::resolve(raw, overrides)?;

    // Network and disk I/O both ride the same runtime; size it for the
    // I/O-heavy workload rather than the CPU count alone.
    let cpus = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads((2 * cpus).max(4))
        .enable_all()
        .build()
        .context("build runtime")?;

    match settings.mode {
        Mode::Server => runtime.block_on(serve(settings)),
        Mode::Client => runtime.block_on(sync(settings, opts.workspace.as_deref())),
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let tls_config = match &settings.tls {
        Some(material) => {
            let key = material
                .key
                .as_deref()
                .context("server TLS requires both --ssl-cert and --ssl-key")?;
            Some(tls::load_server_config(&material.cert, key)?)
        }
        None => None,
    };
    let bind = format!("{}:{}", settings.host, settings.port);
    let workspaces = settings
        .workspaces
        .iter()
        .filter(|w| w.role == config::Role::Server)
        .cloned()
        .collect::<Vec<_>>();
    if workspaces.is_empty() {
        anyhow::bail!("no server workspaces configured");
    }
    Server::new(bind, workspaces, tls_config).run().await
}

async fn sync(settings: Settings, workspace: Option<&str>) -> Result<()> {
    let ws = config::select_workspace(&settings, workspace)?;
    let opts = SyncOptions {
        dangling: settings.dangling,
        ..SyncOptions::default()
    };
    let report = run_sync(ws, &settings.host, settings.port, &opts).await?;
    info!(
        "synced {} file(s) and {} archive(s), {} bytes in {:.2}s ({:.1} MiB/s), {} planned action(s)",
        report.files_uploaded,
        report.archives_uploaded,
        report.bytes_sent,
        report.elapsed.as_secs_f64(),
        report.throughput_mib_s(),
        report.planned_actions,
    );
    Ok(())
}
