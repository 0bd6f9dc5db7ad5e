use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};

/// One pass of the expiry sweep, plus tombstone and empty-day cleanup.
/// Returns how many holds were expired.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = now_ms();
    let mut reaped = 0;
    for hold_id in engine.collect_expired_holds(now) {
        match engine.expire_hold(hold_id, now).await {
            Ok(true) => {
                info!("reaped expired hold {hold_id}");
                reaped += 1;
            }
            // Renewed, promoted or released since it was collected.
            Ok(false) => debug!("reaper skip {hold_id}: no longer lapsed"),
            Err(e) => warn!("reaper failed to expire {hold_id}: {e}"),
        }
    }
    let pruned = engine.prune_tombstones(now);
    if pruned > 0 {
        debug!("pruned {pruned} expiry tombstones");
    }
    let dropped = engine.prune_empty_days(now);
    if dropped > 0 {
        debug!("dropped {dropped} empty past court days");
    }
    reaped
}

/// Background task that periodically releases lapsed holds.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Facility;
    use crate::engine::HoldRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::Days;
    use std::path::PathBuf;
    use tokio_test::{assert_err, assert_ok};
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courthold_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_court(name: &str) -> (Arc<Engine>, Ulid, chrono::NaiveDate) {
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(test_wal_path(name), notify, Facility::default()).unwrap());
        let court = Ulid::new();
        assert_ok!(
            engine
                .create_court(Court {
                    id: court,
                    name: None,
                    zone: None
                })
                .await
        );
        let date = engine.facility.today(now_ms()) + Days::new(1);
        (engine, court, date)
    }

    #[tokio::test]
    async fn reap_once_expires_only_lapsed_holds() {
        let (engine, court, date) = engine_with_court("reap_once.wal").await;
        let stale = HoldRequest::new(Ulid::new(), court, date, TimeRange::new(480, 540));
        let fresh = HoldRequest::new(Ulid::new(), court, date, TimeRange::new(600, 660));
        assert_ok!(engine.acquire(stale, "alice", Some(1)).await);
        assert_ok!(engine.acquire(fresh, "alice", None).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(reap_once(&engine).await, 1);
        assert!(engine.get_hold(stale.id).await.is_none());
        assert!(engine.get_hold(fresh.id).await.is_some());
        assert_eq!(reap_once(&engine).await, 0);

        // Late promotion of the reaped hold is refused.
        assert_err!(engine.promote(stale.id, Ulid::new()).await);
    }

    #[tokio::test]
    async fn background_reaper_frees_the_slot() {
        let (engine, court, date) = engine_with_court("reap_background.wal").await;
        let mut rx = engine.notify.subscribe("alice");
        let hold = HoldRequest::new(Ulid::new(), court, date, TimeRange::new(480, 540));
        assert_ok!(engine.acquire(hold, "alice", Some(1)).await);
        let _acquired = rx.recv().await.unwrap();

        let task = tokio::spawn(run_reaper(engine.clone(), Duration::from_millis(5)));
        let expired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reaper should expire the hold")
            .unwrap();
        task.abort();

        assert!(matches!(
            expired,
            Event::HoldReleased { reason: ReleaseReason::Expired, .. }
        ));
        assert!(!engine.has_conflict(court, date, TimeRange::new(480, 540)).await);
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let (engine, court, date) = engine_with_court("compactor.wal").await;
        for start in [480, 540, 600] {
            let req = HoldRequest::new(Ulid::new(), court, date, TimeRange::new(start, start + 60));
            assert_ok!(engine.acquire(req, "alice", None).await);
        }
        assert!(engine.wal_appends_since_compact().await >= 4);

        // The first interval tick fires immediately.
        let task = tokio::spawn(run_compactor(engine.clone(), 2));
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
