//! Background reconciliation of the hot store into the durable store. No
//! bid is ever lost here: the hot store keeps the authoritative copy until
//! the batched idempotent upsert has succeeded and its metadata is deleted,
//! and any failure re-marks the session dirty for the next cycle.

use {
    crate::{
        database::Persisting,
        hotstore::HotStoring,
    },
    anyhow::Context as _,
    database::bids::Bid,
    model::{SessionId, UserId},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::time,
};

pub struct BatchPersister {
    hot: Arc<dyn HotStoring>,
    db: Arc<dyn Persisting>,
    interval: Duration,
    max_consecutive_failures: u32,
    failures: Mutex<HashMap<SessionId, u32>>,
}

impl BatchPersister {
    pub fn new(
        hot: Arc<dyn HotStoring>,
        db: Arc<dyn Persisting>,
        interval: Duration,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            hot,
            db,
            interval,
            max_consecutive_failures,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_forever(self: Arc<Self>) -> ! {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.run_once().await {
                Ok(0) => (),
                Ok(persisted) => tracing::debug!(persisted, "batch persisted bids"),
                Err(err) => tracing::warn!(?err, "batch persist cycle failed"),
            }
        }
    }

    /// One full cycle: snapshot-and-clear the dirty set, then persist each
    /// session in it. A session that fails stays dirty and is retried on
    /// the next cycle.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let dirty = self
            .hot
            .snapshot_and_clear_dirty()
            .await
            .context("failed to snapshot dirty sessions")?;

        let mut total = 0;
        for session in dirty {
            match self.persist_session(session).await {
                Ok(persisted) => total += persisted,
                Err(err) => {
                    tracing::warn!(?err, %session, "failed to persist session, will retry")
                }
            }
            // Long dirty lists must not monopolize the scheduler.
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    /// Persists everything currently buffered for one session. Also the
    /// forced flush the session monitor runs right before finalization.
    pub async fn persist_session(&self, session: SessionId) -> anyhow::Result<usize> {
        match self.try_persist(session).await {
            Ok(persisted) => {
                self.failures.lock().unwrap().remove(&session);
                Metrics::get().persisted_bids.inc_by(persisted as u64);
                Ok(persisted)
            }
            Err(err) => {
                Metrics::get().failed_batches.inc();
                // The snapshot already dropped the marker; put it back so
                // the next cycle retries this session.
                if let Err(err) = self.hot.mark_dirty(session).await {
                    tracing::error!(?err, %session, "failed to re-mark dirty session");
                }
                let mut failures = self.failures.lock().unwrap();
                let streak = failures.entry(session).or_insert(0);
                *streak += 1;
                if *streak >= self.max_consecutive_failures {
                    tracing::error!(
                        ?err,
                        %session,
                        failures = *streak,
                        "session keeps failing to persist"
                    );
                }
                Err(err)
            }
        }
    }

    async fn try_persist(&self, session: SessionId) -> anyhow::Result<usize> {
        let metadata = self
            .hot
            .scan_bid_metadata(session)
            .await
            .context("failed to scan bid metadata")?;
        if metadata.is_empty() {
            return Ok(0);
        }

        let records: Vec<Bid> = metadata
            .iter()
            .map(|bid| Bid {
                session_id: session,
                user_id: bid.user_id,
                price: bid.price,
                score: bid.score,
                updated_at: bid.updated_at,
            })
            .collect();
        self.db
            .upsert_bids(&records)
            .await
            .context("batched bid upsert failed")?;

        // Only after the upsert committed may the hot copies go away. If
        // this deletion fails the next cycle redoes the idempotent upsert.
        let users: Vec<UserId> = metadata.iter().map(|bid| bid.user_id).collect();
        self.hot
            .delete_bid_metadata(session, &users)
            .await
            .context("failed to delete persisted bid metadata")?;
        Ok(records.len())
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "persister")]
struct Metrics {
    /// Bids written to the durable store.
    persisted_bids: prometheus::IntCounter,

    /// Per-session persist attempts that failed.
    failed_batches: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
