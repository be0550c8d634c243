//! # cmsg-sld - Service Listener Daemon
//!
//! The discovery daemon for CMSG deployments. Servers register here as
//! they start; listeners subscribe to a service name and are told when
//! servers come and go. With a local address configured, daemons on peer
//! nodes mirror each other's registries.
//!
//! Signals:
//! - `SIGUSR1` dumps the registry to `/tmp/cmsg_sld_debug.txt`
//! - `SIGTERM`/`SIGINT` shut down cleanly
//!
//! The process exits non-zero if initialisation fails; once running, a
//! runfile given with `-r` is touched to signal readiness to supervisors.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use cmsg::service_listener::{Daemon, DaemonOptions};

const DEBUG_FILE: &str = "/tmp/cmsg_sld_debug.txt";

#[derive(Parser, Debug)]
#[command(name = "cmsg-sld", version, about = "CMSG service listener daemon")]
struct Args {
    /// Path to touch once startup has succeeded
    #[arg(short = 'r', long = "runfile")]
    runfile: Option<PathBuf>,

    /// Address remote peers can reach this node on; enables registry sync
    #[arg(short = 'a', long = "local-addr")]
    local_addr: Option<Ipv4Addr>,

    /// Peer daemons to mirror registries with (repeatable)
    #[arg(long = "peer")]
    peers: Vec<Ipv4Addr>,

    /// Write detailed logs to this file instead of stderr
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Keep the appender guard alive for the life of the process, or file
    // logging silently stops.
    let _log_guard = match &args.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("cmsg-sld.log"));
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(log_level),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(log_level),
                )
                .init();
            None
        }
    };

    // A peer going away mid-write must not kill the daemon.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    };

    info!(version = cmsg::VERSION, "starting cmsg-sld");

    let daemon = Daemon::start(DaemonOptions {
        local_addr: args.local_addr,
    })
    .await
    .context("service listener initialisation failed")?;

    for peer in &args.peers {
        daemon.add_host(*peer).await;
    }

    // Signal readiness to the supervisor.
    if let Some(runfile) = &args.runfile {
        std::fs::File::create(runfile)
            .with_context(|| format!("cannot create runfile {}", runfile.display()))?;
        info!(runfile = %runfile.display(), "runfile created");
    }

    let mut sigterm = signal(SignalKind::terminate()).context("signal handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("signal handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("signal handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigusr1.recv() => {
                let dump = daemon.dump().await;
                if let Err(e) = std::fs::write(DEBUG_FILE, dump) {
                    error!("cannot write {DEBUG_FILE}: {e}");
                } else {
                    info!("registry dumped to {DEBUG_FILE}");
                }
            }
        }
    }

    daemon.shutdown().await;
    if let Some(runfile) = &args.runfile {
        let _ = std::fs::remove_file(runfile);
    }
    info!("cmsg-sld stopped");
    Ok(())
}
