use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courthold::config::{self, Config};
use courthold::engine::{Engine, EngineError};
use courthold::model::Court;
use courthold::notify::NotifyHub;
use courthold::pricing::PriceTable;
use courthold::{observability, reaper, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env();
    observability::init(cfg.metrics_port)?;

    let tls_acceptor = courthold::tls::load_tls_acceptor(&cfg)?;

    std::fs::create_dir_all(&cfg.data_dir)?;

    let pricing = match &cfg.prices_file {
        Some(path) => PriceTable::load(path)?,
        None => PriceTable::default(),
    };
    if pricing.is_empty() {
        info!("no price bands configured, all slots are free");
    }

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(cfg.wal_path(), notify, cfg.facility)?
            .with_default_ttl(cfg.hold_ttl_ms)
            .with_pricing(pricing),
    );

    if let Some(path) = &cfg.courts_file {
        let courts = config::load_courts(path)?;
        seed_courts(&engine, courts).await?;
    }

    tokio::spawn(reaper::run_reaper(engine.clone(), cfg.reap_interval));
    tokio::spawn(reaper::run_compactor(engine.clone(), cfg.compact_threshold));

    let max_connections = cfg.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("courthold listening on {addr}");
    info!("  data_dir: {}", cfg.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  hours: {}, slot {} min, hold ttl {}s",
        cfg.facility.hours(),
        cfg.facility.slot_minutes,
        cfg.hold_ttl_ms / 1000
    );
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable ({e}), ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let password = cfg.password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, password, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);
    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    engine.close().await;
    info!("courthold stopped");
    Ok(())
}

/// Register the configured roster. Courts already known from the WAL are left alone.
async fn seed_courts(engine: &Engine, courts: Vec<Court>) -> Result<(), EngineError> {
    let mut added = 0;
    for court in courts {
        match engine.create_court(court).await {
            Ok(()) => added += 1,
            Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    info!("courts file: {added} new courts registered");
    Ok(())
}
