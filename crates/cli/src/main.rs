// SPDX-License-Identifier: MIT

mod config;

use clap::Parser;
use config::Config;
use dsd_adapters::{EchoConnection, FixedThreadPool};
use dsd_core::{bind_all, AddressFamilyPreference, BindOptions};
use dsd_daemon::{Daemon, DaemonConfig, HupBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Network daemon: binds the configured listen URLs and serves connections
/// across a sharded, epoll/kqueue/poll event loop.
#[derive(Debug, Parser)]
#[command(name = "dsd", version, about)]
pub struct Cli {
    /// Listen URL, e.g. `plain-ldap://0.0.0.0:3890`. May be repeated.
    #[arg(long = "listen", value_name = "URL")]
    listen: Vec<String>,

    /// Number of event-loop shards. Rounded up to the next power of two.
    #[arg(long, env = "DSD_SHARDS")]
    shards: Option<usize>,

    /// Idle session timeout in seconds. Omit to disable idle sweeps.
    #[arg(long = "idle-timeout-secs", env = "DSD_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Treat SIGHUP as a gentle shutdown request instead of abrupt.
    #[arg(long, env = "DSD_GENTLE_HUP")]
    gentle_hup: bool,

    /// Listen backlog passed to `listen(2)`.
    #[arg(long, env = "DSD_BACKLOG")]
    backlog: Option<i32>,

    /// Optional TOML config file; CLI flags and env vars take precedence.
    #[arg(long, env = "DSD_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Emit a systemd `READY=1` notification once every listener is armed.
    #[arg(long, env = "DSD_SYSTEMD_NOTIFY")]
    systemd_notify: bool,

    /// Worker-pool size for accept/read/write jobs.
    #[arg(long, default_value_t = 8)]
    workers: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    let bind_opts = BindOptions {
        backlog: config.backlog,
        family_preference: AddressFamilyPreference::Any,
        proxied: false,
    };
    let listeners = bind_all(&config.listen, &bind_opts)?;
    for l in &listeners {
        info!(listener = %l.name, url = %l.url, "listening");
    }

    let pool: Arc<dyn dsd_core::ThreadPool> = Arc::new(FixedThreadPool::new(cli.workers));
    let connection: Arc<dyn dsd_core::Connection> = EchoConnection::new(config.idle_timeout);

    let ready_callback: Option<Arc<dyn Fn() + Send + Sync>> =
        if config.systemd_notify { Some(Arc::new(notify_ready)) } else { None };

    let daemon = Daemon::new(
        listeners,
        pool,
        connection,
        DaemonConfig {
            shards: config.shards,
            idle_timeout: config.idle_timeout,
            hup_behavior: if config.gentle_hup { HupBehavior::Gentle } else { HupBehavior::Abrupt },
            ready_callback,
        },
    )?;

    if let Err(e) = daemon.run() {
        error!(error = %e, "daemon exited with error");
        std::process::exit(1);
    }

    Ok(())
}

/// Emits `READY=1` over the systemd notify socket. Only ever invoked as a
/// `Daemon` readiness callback, once every listener has been armed at least
/// once — not at process start, so systemd does not consider the unit ready
/// before it can actually accept connections.
#[cfg(feature = "systemd")]
fn notify_ready() {
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);
}

#[cfg(not(feature = "systemd"))]
fn notify_ready() {}
