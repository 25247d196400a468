use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use lookout_service::config::{Cli, ConfigError, Settings};
use lookout_service::emitter::Emitter;
use lookout_service::probe::{ProbeExecutor, ResolvedCheck, Scheduler};
use lookout_service::registry::{self, Target};

/// Load and fully validate the inventory, profiles and resolved checks.
/// Either the whole set is runnable or nothing is.
fn load_configuration(settings: &Settings) -> Result<(Vec<Target>, Vec<ResolvedCheck>), ConfigError> {
    let targets = registry::load_inventory(&settings.inventory_path())?;
    let profiles = registry::load_profiles(&settings.profiles_path())?;
    let checks = registry::materialize(&targets, &profiles, settings)?;
    Ok((targets, checks))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logger::init();
    let settings = Settings::resolve(Cli::parse());

    // startup config errors are the only fatal ones
    let (targets, checks) = load_configuration(&settings)
        .with_context(|| format!("failed to load configuration from {}", settings.config_dir.display()))?;
    if checks.is_empty() {
        warn!(inventory = %settings.inventory_path().display(), "no runnable checks configured");
    }
    info!(
        targets = targets.len(),
        checks = checks.len(),
        concurrency = settings.concurrency,
        instance_id = %settings.instance_id,
        "starting probe scheduler"
    );

    let executor =
        Arc::new(ProbeExecutor::new(&settings).context("failed to build probe executors")?);
    let emitter = Emitter::stdout(&settings);
    let mut scheduler =
        Scheduler::new(executor, emitter, settings.concurrency, settings.shutdown_grace);
    scheduler.install(checks);

    let (reload_tx, reload_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // SIGHUP hot reload: validate off the scheduling loop, keep the
    // previous good set when the new one does not validate
    let reload_settings = settings.clone();
    tokio::spawn(async move {
        let Ok(mut hangup) = unix_signal(SignalKind::hangup()) else {
            error!("failed to register SIGHUP handler, hot reload disabled");
            return;
        };
        let mut current = targets;
        while hangup.recv().await.is_some() {
            match load_configuration(&reload_settings) {
                Ok((new_targets, checks)) => {
                    let diff = registry::diff(&current, &new_targets);
                    if diff.is_empty() {
                        info!("reload requested, configuration unchanged");
                        continue;
                    }
                    info!(
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        changed = diff.changed.len(),
                        "reloading configuration"
                    );
                    current = new_targets;
                    if reload_tx.send(checks).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    error!(error = %err, "reload failed, keeping previous configuration")
                }
            }
        }
    });

    let scheduler_task = tokio::spawn(scheduler.run(reload_rx, shutdown_rx));

    let mut terminate = unix_signal(SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = terminate.recv() => info!("termination signal received, shutting down"),
    }

    let _ = shutdown_tx.send(true);
    scheduler_task.await.context("scheduler task panicked")?;
    info!("shutdown complete");
    Ok(())
}
