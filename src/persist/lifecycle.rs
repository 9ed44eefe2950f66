//! Match hooks wired to the store, the snapshot sink and the finalizer

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::finalizer::MatchFinalizer;
use super::sink::SnapshotSink;
use crate::game::{AbortRecord, MatchHooks, MatchRecord};
use crate::store::{ActiveMatchUpdate, MatchSnapshot, MatchStore};

pub const FINALIZE_ATTEMPTS: u32 = 3;
pub const FINALIZE_BACKOFF: Duration = Duration::from_secs(1);

pub struct MatchLifecycle {
    store: Arc<dyn MatchStore>,
    sink: Arc<dyn SnapshotSink>,
    finalizer: Arc<dyn MatchFinalizer>,
}

impl MatchLifecycle {
    pub fn new(
        store: Arc<dyn MatchStore>,
        sink: Arc<dyn SnapshotSink>,
        finalizer: Arc<dyn MatchFinalizer>,
    ) -> Self {
        Self {
            store,
            sink,
            finalizer,
        }
    }
}

#[async_trait]
impl MatchHooks for MatchLifecycle {
    async fn on_start(&self, match_id: &str, started_at: DateTime<Utc>) {
        let update = ActiveMatchUpdate {
            started_at: Some(started_at),
            ..Default::default()
        };
        if let Err(e) = self.store.update_match(match_id, &update).await {
            warn!(match_id = %match_id, error = %e, "Failed to persist match start");
        }
    }

    async fn on_save(&self, snapshot: MatchSnapshot) {
        if let Err(e) = self.sink.publish(&snapshot).await {
            warn!(match_id = %snapshot.match_id, ply = snapshot.ply, error = %e, "Failed to publish snapshot");
        }
    }

    async fn on_end(&self, record: MatchRecord) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.finalizer.end(&record).await {
                Ok(()) => {
                    info!(match_id = %record.match_id, outcome = %record.outcome, "Match finalized");
                    return;
                }
                Err(e) => {
                    warn!(match_id = %record.match_id, attempt, error = %e, "Finalize failed");
                    if attempt < FINALIZE_ATTEMPTS {
                        tokio::time::sleep(FINALIZE_BACKOFF).await;
                    }
                }
            }
        }

        let dump = serde_json::to_string(&record).unwrap_or_default();
        error!(match_id = %record.match_id, record = %dump, "Giving up on match record");
    }

    async fn on_abort(&self, record: AbortRecord) {
        let finalizer = self.finalizer.clone();
        tokio::spawn(async move {
            if let Err(e) = finalizer.abort(&record).await {
                warn!(match_id = %record.match_id, error = %e, "Abort notification failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use uuid::Uuid;

    use crate::persist::FinalizeError;
    use crate::store::{ActiveMatch, MemoryMatchStore};

    /// Fails the first `failures` end calls
    struct FlakyFinalizer {
        failures: u32,
        ends: AtomicU32,
        aborts: AtomicU32,
    }

    impl FlakyFinalizer {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                ends: AtomicU32::new(0),
                aborts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MatchFinalizer for FlakyFinalizer {
        async fn end(&self, _record: &MatchRecord) -> Result<(), FinalizeError> {
            let call = self.ends.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(FinalizeError::Endpoint("unavailable".into()));
            }
            Ok(())
        }

        async fn abort(&self, _record: &AbortRecord) -> Result<(), FinalizeError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record() -> MatchRecord {
        MatchRecord {
            match_id: "m1".into(),
            players: Vec::new(),
            pgn: "*".into(),
            started_at: None,
            ended_at: Utc::now(),
            results: vec![0.5, 0.5],
            outcome: "*".into(),
            method: String::new(),
        }
    }

    fn lifecycle(store: Arc<MemoryMatchStore>, finalizer: Arc<FlakyFinalizer>) -> MatchLifecycle {
        MatchLifecycle::new(store.clone(), store, finalizer)
    }

    #[tokio::test(start_paused = true)]
    async fn end_retries_until_success() {
        let finalizer = FlakyFinalizer::new(1);
        let hooks = lifecycle(Arc::new(MemoryMatchStore::new()), finalizer.clone());

        let started = tokio::time::Instant::now();
        hooks.on_end(record()).await;
        assert_eq!(finalizer.ends.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), FINALIZE_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn end_gives_up_after_bounded_attempts() {
        let finalizer = FlakyFinalizer::new(u32::MAX);
        let hooks = lifecycle(Arc::new(MemoryMatchStore::new()), finalizer.clone());

        hooks.on_end(record()).await;
        assert_eq!(finalizer.ends.load(Ordering::SeqCst), FINALIZE_ATTEMPTS);
    }

    #[tokio::test]
    async fn abort_is_fire_and_forget() {
        let finalizer = FlakyFinalizer::new(0);
        let hooks = lifecycle(Arc::new(MemoryMatchStore::new()), finalizer.clone());

        hooks
            .on_abort(AbortRecord {
                match_id: "m1".into(),
                player_ids: vec!["a".into()],
            })
            .await;
        for _ in 0..100 {
            if finalizer.aborts.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("abort was never delivered");
    }

    #[tokio::test]
    async fn start_and_save_reach_the_store() {
        let store = Arc::new(MemoryMatchStore::new());
        let created = Utc::now();
        store
            .put_match(&ActiveMatch {
                match_id: "m1".into(),
                conversation_id: None,
                players: Vec::new(),
                game_mode: "5+0".into(),
                server: None,
                average_rating: 0.0,
                created_at: created,
                started_at: None,
            })
            .await
            .unwrap();
        let hooks = lifecycle(store.clone(), FlakyFinalizer::new(0));

        let started_at = Utc::now();
        hooks.on_start("m1", started_at).await;
        assert_eq!(store.get_match("m1").await.unwrap().started_at, Some(started_at));

        hooks
            .on_save(MatchSnapshot {
                id: Uuid::new_v4(),
                match_id: "m1".into(),
                player_states: BTreeMap::new(),
                game_state: "e2e4".into(),
                last_move: None,
                ply: 1,
                timestamp: Utc::now(),
            })
            .await;
        let latest = store.fetch_latest_snapshot("m1").await.unwrap().unwrap();
        assert_eq!(latest.game_state, "e2e4");
    }
}
