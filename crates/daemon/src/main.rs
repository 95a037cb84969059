//! The reconciler's process entry point: a single-threaded cooperative
//! loop on a fixed 30-second base period, supervised by systemd, with
//! SIGTERM/SIGINT/SIGHUP all treated as graceful-shutdown signals.

mod config;
mod gc;
mod health;
mod heartbeat;
mod reconcile;
mod refresh;
mod splitbrain;
mod store_health;
mod wg;

use config::DaemonConfig;
use eyre::Context;
use meridian_store::{StoreClient, StoreClientConfig};
use reconcile::Reconciler;
use tokio::signal::unix::{signal, SignalKind};

const MILESTONE_EVERY: u64 = 100;
const SLOW_ITERATION_WARN: std::time::Duration = std::time::Duration::from_secs(15);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    pretty_env_logger::init();
    dotenvy::dotenv().ok();

    let cfg = DaemonConfig::load().context("load daemon configuration")?;
    log::info!("reconciler starting for host {} on interface {}", cfg.self_id, cfg.iface);

    let store = StoreClient::new(StoreClientConfig {
        cli_path: cfg.store_cli.clone(),
        store_config_path: cfg.store_config.clone(),
        api_port: cfg.store_api_port,
    });
    meridian_store::schema::ensure_schema(&store)
        .await
        .context("ensure replicated store schema")?;

    let mut reconciler = Reconciler {
        store,
        cfg,
        iteration: 0,
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let base_period = reconciler.cfg.base_period;
    let mut ticker = tokio::time::interval(base_period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let started = std::time::Instant::now();
                reconciler.run_once().await;
                let elapsed = started.elapsed();
                if elapsed > SLOW_ITERATION_WARN {
                    log::warn!("slow iteration: {elapsed:?} (iteration {})", reconciler.iteration);
                }
                if reconciler.iteration % MILESTONE_EVERY == 0 {
                    log::info!("reconciler milestone: {} iterations completed", reconciler.iteration);
                }
            }
            _ = sigterm.recv() => { shutdown(&mut reconciler, "SIGTERM").await; return Ok(()); }
            _ = sigint.recv() => { shutdown(&mut reconciler, "SIGINT").await; return Ok(()); }
            _ = sighup.recv() => { shutdown(&mut reconciler, "SIGHUP").await; return Ok(()); }
        }
    }
}

async fn shutdown(reconciler: &mut Reconciler, signal_name: &str) {
    log::info!("received {signal_name}, sending final heartbeat and exiting");
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    if let Err(e) = heartbeat::beat(&reconciler.store, &reconciler.cfg.self_id, now_ms).await {
        log::error!("final heartbeat failed: {e}");
    }
}
