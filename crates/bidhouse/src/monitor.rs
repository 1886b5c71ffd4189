//! Finalization of ended sessions: force one last persist cycle, freeze
//! the ranking, mark the winners and record the clearing price, then tell
//! the observers. Finalization is idempotent per session.

use {
    crate::{
        broadcast::Broadcaster,
        database::Persisting,
        hotstore::HotStoring,
        persister::BatchPersister,
    },
    anyhow::Context as _,
    chrono::Utc,
    database::{rankings::Ranking, sessions::Session},
    itertools::izip,
    model::UserId,
    std::{sync::Arc, time::Duration},
    tokio::time,
};

#[derive(Debug, PartialEq)]
pub enum FinalizeOutcome {
    Finalized { bidders: usize, final_price: f64 },
    AlreadyFinalized,
}

pub struct SessionMonitor {
    hot: Arc<dyn HotStoring>,
    db: Arc<dyn Persisting>,
    persister: Arc<BatchPersister>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
}

impl SessionMonitor {
    pub fn new(
        hot: Arc<dyn HotStoring>,
        db: Arc<dyn Persisting>,
        persister: Arc<BatchPersister>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
    ) -> Self {
        Self {
            hot,
            db,
            persister,
            broadcaster,
            interval,
        }
    }

    pub async fn run_forever(self: Arc<Self>) -> ! {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.run_once().await {
                tracing::warn!(?err, "session monitor cycle failed");
            }
        }
    }

    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let expired = self
            .db
            .expired_sessions(Utc::now())
            .await
            .context("failed to query expired sessions")?;

        let mut finalized = 0;
        for session in expired {
            match self.finalize(&session).await {
                Ok(FinalizeOutcome::Finalized {
                    bidders,
                    final_price,
                }) => {
                    tracing::info!(
                        session = %session.id,
                        bidders,
                        final_price,
                        "finalized session"
                    );
                    finalized += 1;
                }
                Ok(FinalizeOutcome::AlreadyFinalized) => (),
                Err(err) => {
                    tracing::error!(?err, session = %session.id, "failed to finalize session")
                }
            }
        }
        Ok(finalized)
    }

    pub async fn finalize(&self, session: &Session) -> anyhow::Result<FinalizeOutcome> {
        if !session.is_active || self.db.ranking_exists(session.id).await? {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        // The ranking must freeze over fully persisted state: a session
        // that ends between a bid and the next batch tick would otherwise
        // finalize without that bid in the durable store.
        self.persister
            .persist_session(session.id)
            .await
            .context("forced persist before finalization failed")?;

        let scoreboard = self.hot.full_ranking(session.id).await?;
        let entries: Vec<FinalEntry> = if scoreboard.is_empty() {
            // Hot keys may have hit their TTL; every bid is persisted by
            // now, so the durable store can stand in.
            self.db
                .session_bids(session.id)
                .await?
                .into_iter()
                .map(|bid| FinalEntry {
                    user_id: bid.user_id,
                    score: bid.score,
                    price: bid.price,
                })
                .collect()
        } else {
            let users: Vec<UserId> = scoreboard.iter().map(|(user, _)| *user).collect();
            let records = self.hot.bid_records(session.id, &users).await?;
            izip!(scoreboard, records)
                .map(|((user_id, score), record)| FinalEntry {
                    user_id,
                    score,
                    price: record.map(|record| record.price).unwrap_or_default(),
                })
                .collect()
        };

        let (rankings, final_price) = compute_final_ranking(session, &entries);
        let frozen = self
            .db
            .freeze_ranking(session.id, &rankings, final_price)
            .await?;
        if !frozen {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }

        Metrics::get().finalized_sessions.inc();
        self.broadcaster.notify_leaderboard(session.id);
        self.broadcaster.notify_session_list();
        Ok(FinalizeOutcome::Finalized {
            bidders: rankings.len(),
            final_price,
        })
    }
}

/// One bidder of the final descending scoreboard.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalEntry {
    pub user_id: UserId,
    pub score: f64,
    pub price: f64,
}

/// Ranks 1..N over the descending scoreboard, winners in the first K
/// slots. The clearing price is the K-th winner's bid; with fewer than K
/// bidders the session clears at its reserve.
fn compute_final_ranking(session: &Session, entries: &[FinalEntry]) -> (Vec<Ranking>, f64) {
    let k = session.inventory.max(0) as usize;
    let rankings: Vec<Ranking> = entries
        .iter()
        .enumerate()
        .map(|(position, entry)| Ranking {
            session_id: session.id,
            user_id: entry.user_id,
            rank: position as i64 + 1,
            price: entry.price,
            score: entry.score,
            is_winner: position < k,
        })
        .collect();
    let final_price = if k >= 1 && entries.len() >= k {
        entries[k - 1].price
    } else {
        session.reserve_price
    };
    (rankings, final_price)
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "monitor")]
struct Metrics {
    /// Sessions finalized since boot.
    finalized_sessions: prometheus::IntCounter,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
