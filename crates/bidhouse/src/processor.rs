//! The write path: validate, score, update the hot store in one pipelined
//! unit, mark the session dirty and notify observers. The durable store is
//! never touched here beyond the read-through caches.

use {
    crate::{
        broadcast::Broadcaster,
        hotstore::{self, BidSubmission, HotStoreError, HotStoring},
        session_cache::{SessionCacheError, SessionParamCache},
    },
    chrono::{DateTime, Utc},
    model::{
        auth::Principal,
        bid::BidOutcome,
        scoring::bid_score,
        session::SessionStatus,
        SessionId,
    },
    std::sync::Arc,
};

#[derive(Debug, thiserror::Error)]
pub enum BidError {
    #[error("bidding session not found")]
    SessionNotFound,
    #[error("bidding session has not started yet")]
    SessionNotStarted,
    #[error("bidding session has ended")]
    SessionEnded,
    #[error("bidding session is not active")]
    SessionInactive,
    #[error("bid price {price} is below the reserve price {reserve}")]
    PriceBelowReserve { price: f64, reserve: f64 },
    #[error("hot store unavailable")]
    HotStoreUnavailable(#[source] anyhow::Error),
    #[error("durable store unavailable")]
    DurableStoreUnavailable(#[source] sqlx::Error),
    #[error("upstream deadline exceeded")]
    UpstreamTimeout,
}

impl BidError {
    fn reject_reason(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::SessionNotStarted => "session_not_started",
            Self::SessionEnded => "session_ended",
            Self::SessionInactive => "session_inactive",
            Self::PriceBelowReserve { .. } => "price_below_reserve",
            Self::HotStoreUnavailable(_) => "hot_store_unavailable",
            Self::DurableStoreUnavailable(_) => "durable_store_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
        }
    }
}

impl From<SessionCacheError> for BidError {
    fn from(err: SessionCacheError) -> Self {
        match err {
            SessionCacheError::NotFound => Self::SessionNotFound,
            SessionCacheError::Database(err) => Self::DurableStoreUnavailable(err),
        }
    }
}

impl From<HotStoreError> for BidError {
    fn from(err: HotStoreError) -> Self {
        match err {
            HotStoreError::Unavailable(err) => Self::HotStoreUnavailable(err),
            HotStoreError::Timeout => Self::UpstreamTimeout,
        }
    }
}

pub struct BidProcessor {
    hot: Arc<dyn HotStoring>,
    sessions: Arc<SessionParamCache>,
    broadcaster: Arc<Broadcaster>,
}

impl BidProcessor {
    pub fn new(
        hot: Arc<dyn HotStoring>,
        sessions: Arc<SessionParamCache>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            hot,
            sessions,
            broadcaster,
        }
    }

    pub async fn submit_bid(
        &self,
        principal: &Principal,
        session_id: SessionId,
        price: f64,
    ) -> Result<BidOutcome, BidError> {
        let result = self
            .submit_bid_at(principal, session_id, price, Utc::now())
            .await;
        let metrics = Metrics::get();
        match &result {
            Ok(_) => metrics.bids.with_label_values(&["accepted"]).inc(),
            Err(err) => metrics.bids.with_label_values(&[err.reject_reason()]).inc(),
        }
        result
    }

    async fn submit_bid_at(
        &self,
        principal: &Principal,
        session_id: SessionId,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<BidOutcome, BidError> {
        let params = self.sessions.params(session_id).await?;
        match self.sessions.status(&params, now).await? {
            SessionStatus::NotStarted => return Err(BidError::SessionNotStarted),
            SessionStatus::Ended => return Err(BidError::SessionEnded),
            SessionStatus::Paused => return Err(BidError::SessionInactive),
            SessionStatus::Active => (),
        }
        if price < params.reserve_price {
            return Err(BidError::PriceBelowReserve {
                price,
                reserve: params.reserve_price,
            });
        }

        let response_time = (now - params.start_time)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let score = bid_score(
            price,
            response_time,
            principal.weight,
            params.alpha,
            params.beta,
            params.gamma,
        );

        self.hot
            .apply_bid(&BidSubmission {
                session_id,
                user_id: principal.id,
                price,
                score,
                updated_at: now,
                ttl: hotstore::key_ttl(params.end_time, now),
            })
            .await?;

        let rank = self.hot.rank_of(session_id, principal.id).await?;
        self.broadcaster.notify_leaderboard(session_id);

        tracing::debug!(
            %session_id,
            user = %principal.id,
            price,
            score,
            ?rank,
            "accepted bid"
        );
        Ok(BidOutcome { score, rank })
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "processor")]
struct Metrics {
    /// Processed bids by outcome.
    #[metric(labels("outcome"))]
    bids: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{database::MockPersisting, hotstore::MockHotStoring},
        chrono::TimeZone,
        database::sessions::Session,
        model::{ProductId, UserId},
    };

    fn scenario_session(id: SessionId) -> Session {
        // alpha=0.5, beta=1000, gamma=2, reserve=200, K=5, one minute long.
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Session {
            id,
            product_id: ProductId::new_v4(),
            reserve_price: 200.,
            final_price: None,
            inventory: 5,
            alpha: 0.5,
            beta: 1000.,
            gamma: 2.,
            start_time: start,
            end_time: start + chrono::Duration::seconds(60),
            is_active: true,
        }
    }

    fn bidder(weight: f64) -> Principal {
        Principal {
            id: UserId::new_v4(),
            username: "bidder".to_string(),
            weight,
            is_admin: false,
        }
    }

    fn processor(hot: MockHotStoring, db: MockPersisting) -> BidProcessor {
        let hot = Arc::new(hot);
        let db = Arc::new(db);
        BidProcessor::new(
            hot.clone(),
            Arc::new(SessionParamCache::new(hot, db)),
            Arc::new(Broadcaster::default()),
        )
    }

    fn db_returning(session: Session) -> MockPersisting {
        let mut db = MockPersisting::new();
        db.expect_session()
            .returning(move |_| Ok(Some(session.clone())));
        db
    }

    #[tokio::test]
    async fn accepts_and_scores_a_single_bid() {
        let session_id = SessionId::new_v4();
        let session = scenario_session(session_id);
        let start = session.start_time;

        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        hot.expect_cache_session_params().returning(|_| Ok(()));
        hot.expect_cached_activity().returning(|_| Ok(None));
        hot.expect_cache_activity().returning(|_, _| Ok(()));
        hot.expect_apply_bid()
            .withf(move |bid| {
                bid.session_id == session_id && bid.price == 250. && bid.score == 627.
            })
            .times(1)
            .returning(|_| Ok(()));
        hot.expect_rank_of().times(1).returning(|_, _| Ok(Some(1)));

        let processor = processor(hot, db_returning(session));
        let outcome = processor
            .submit_bid_at(
                &bidder(1.0),
                session_id,
                250.,
                start + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            BidOutcome {
                score: 627.,
                rank: Some(1),
            }
        );
    }

    #[tokio::test]
    async fn rebids_rescore_against_the_new_response_time() {
        let session_id = SessionId::new_v4();
        let session = scenario_session(session_id);
        let start = session.start_time;
        let user = bidder(1.0);

        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        hot.expect_cache_session_params().returning(|_| Ok(()));
        hot.expect_cached_activity().returning(|_| Ok(None));
        hot.expect_cache_activity().returning(|_, _| Ok(()));
        let mut scores = Vec::new();
        hot.expect_apply_bid().times(2).returning({
            let user_id = user.id;
            move |bid| {
                assert_eq!(bid.user_id, user_id);
                scores.push(bid.score);
                if scores.len() == 2 {
                    assert_eq!(scores, vec![627., 402.]);
                }
                Ok(())
            }
        });
        hot.expect_rank_of().returning(|_, _| Ok(Some(1)));

        let processor = processor(hot, db_returning(session));
        let first = processor
            .submit_bid_at(&user, session_id, 250., start + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(first.score, 627.);

        let second = processor
            .submit_bid_at(&user, session_id, 300., start + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(second.score, 402.);
        assert_eq!(second.rank, Some(1));
    }

    #[tokio::test]
    async fn rejects_bids_below_the_reserve_without_touching_the_scoreboard() {
        let session_id = SessionId::new_v4();
        let session = scenario_session(session_id);
        let start = session.start_time;

        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        hot.expect_cache_session_params().returning(|_| Ok(()));
        hot.expect_cached_activity().returning(|_| Ok(None));
        hot.expect_cache_activity().returning(|_, _| Ok(()));
        hot.expect_apply_bid().never();
        hot.expect_mark_dirty().never();

        let processor = processor(hot, db_returning(session));
        let result = processor
            .submit_bid_at(
                &bidder(1.0),
                session_id,
                150.,
                start + chrono::Duration::seconds(1),
            )
            .await;

        assert!(matches!(
            result,
            Err(BidError::PriceBelowReserve {
                price,
                reserve
            }) if price == 150. && reserve == 200.
        ));
    }

    #[tokio::test]
    async fn rejects_bids_outside_the_session_window() {
        let session_id = SessionId::new_v4();
        let session = scenario_session(session_id);
        let start = session.start_time;
        let end = session.end_time;

        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        hot.expect_cache_session_params().returning(|_| Ok(()));
        hot.expect_cache_activity().returning(|_, _| Ok(()));
        hot.expect_apply_bid().never();

        let processor = processor(hot, db_returning(session));

        let early = processor
            .submit_bid_at(
                &bidder(1.0),
                session_id,
                250.,
                start - chrono::Duration::seconds(1),
            )
            .await;
        assert!(matches!(early, Err(BidError::SessionNotStarted)));

        let late = processor.submit_bid_at(&bidder(1.0), session_id, 250., end).await;
        assert!(matches!(late, Err(BidError::SessionEnded)));
    }

    #[tokio::test]
    async fn unknown_session_is_reported_as_such() {
        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        let mut db = MockPersisting::new();
        db.expect_session().returning(|_| Ok(None));

        let processor = processor(hot, db);
        let result = processor
            .submit_bid_at(&bidder(1.0), SessionId::new_v4(), 250., Utc::now())
            .await;
        assert!(matches!(result, Err(BidError::SessionNotFound)));
    }

    #[tokio::test]
    async fn hot_store_failures_surface_and_the_bid_is_not_acknowledged() {
        let session_id = SessionId::new_v4();
        let session = scenario_session(session_id);
        let start = session.start_time;

        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        hot.expect_cache_session_params().returning(|_| Ok(()));
        hot.expect_cached_activity().returning(|_| Ok(None));
        hot.expect_cache_activity().returning(|_, _| Ok(()));
        hot.expect_apply_bid()
            .returning(|_| Err(HotStoreError::Timeout));
        hot.expect_rank_of().never();

        let processor = processor(hot, db_returning(session));
        let result = processor
            .submit_bid_at(
                &bidder(1.0),
                session_id,
                250.,
                start + chrono::Duration::seconds(1),
            )
            .await;
        assert!(matches!(result, Err(BidError::UpstreamTimeout)));
    }
}
