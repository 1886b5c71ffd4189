//! Read-through cache for immutable per-session scoring parameters plus a
//! short-lived activity flag, both living in the hot store so the write
//! path can validate bids without touching the durable store.

use {
    crate::{
        database::Persisting,
        hotstore::{ActivityFlag, HotStoreError, HotStoring},
    },
    chrono::{DateTime, Utc},
    model::{
        session::{SessionParams, SessionStatus},
        SessionId,
    },
    std::sync::Arc,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionCacheError {
    #[error("bidding session not found")]
    NotFound,
    #[error("durable store unavailable")]
    Database(#[source] sqlx::Error),
}

pub struct SessionParamCache {
    hot: Arc<dyn HotStoring>,
    db: Arc<dyn Persisting>,
}

impl SessionParamCache {
    pub fn new(hot: Arc<dyn HotStoring>, db: Arc<dyn Persisting>) -> Self {
        Self { hot, db }
    }

    /// Immutable session parameters, cached for the session's lifetime.
    /// Hot store trouble degrades to a durable store read; the cache is
    /// advisory.
    pub async fn params(&self, session: SessionId) -> Result<SessionParams, SessionCacheError> {
        match self.hot.cached_session_params(session).await {
            Ok(Some(params)) => return Ok(params),
            Ok(None) => (),
            Err(err) => log_cache_miss(session, &err),
        }

        let row = self
            .db
            .session(session)
            .await
            .map_err(SessionCacheError::Database)?
            .ok_or(SessionCacheError::NotFound)?;
        let params = SessionParams {
            id: row.id,
            product_id: row.product_id,
            reserve_price: row.reserve_price,
            inventory: row.inventory,
            alpha: row.alpha,
            beta: row.beta,
            gamma: row.gamma,
            start_time: row.start_time,
            end_time: row.end_time,
        };

        if let Err(err) = self.hot.cache_session_params(&params).await {
            log_cache_miss(session, &err);
        }
        Ok(params)
    }

    /// Where the session stands at `now`. The time window comes from the
    /// immutable parameters; only the administrative pause flag needs the
    /// short-TTL activity cache with its durable store fallback.
    pub async fn status(
        &self,
        params: &SessionParams,
        now: DateTime<Utc>,
    ) -> Result<SessionStatus, SessionCacheError> {
        match params.status_at(now) {
            SessionStatus::NotStarted => return Ok(SessionStatus::NotStarted),
            SessionStatus::Ended => {
                if let Err(err) = self.hot.cache_activity(params.id, ActivityFlag::Ended).await {
                    log_cache_miss(params.id, &err);
                }
                return Ok(SessionStatus::Ended);
            }
            SessionStatus::Active | SessionStatus::Paused => (),
        }

        match self.hot.cached_activity(params.id).await {
            Ok(Some(ActivityFlag::Active)) => return Ok(SessionStatus::Active),
            Ok(Some(ActivityFlag::Paused)) => return Ok(SessionStatus::Paused),
            // A stale "ended" flag cannot override the immutable window.
            Ok(Some(ActivityFlag::Ended)) | Ok(None) => (),
            Err(err) => log_cache_miss(params.id, &err),
        }

        let row = self
            .db
            .session(params.id)
            .await
            .map_err(SessionCacheError::Database)?
            .ok_or(SessionCacheError::NotFound)?;
        let (status, flag) = if row.is_active {
            (SessionStatus::Active, ActivityFlag::Active)
        } else {
            (SessionStatus::Paused, ActivityFlag::Paused)
        };
        if let Err(err) = self.hot.cache_activity(params.id, flag).await {
            log_cache_miss(params.id, &err);
        }
        Ok(status)
    }
}

fn log_cache_miss(session: SessionId, err: &HotStoreError) {
    tracing::warn!(?err, %session, "session cache unavailable, falling through");
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{database::MockPersisting, hotstore::MockHotStoring},
        chrono::TimeZone,
        database::sessions::Session,
        model::ProductId,
    };

    fn session_row(id: SessionId, is_active: bool) -> Session {
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
            is_active,
        }
    }

    #[tokio::test]
    async fn reads_through_and_backfills_cache() {
        let session = SessionId::new_v4();
        let row = session_row(session, true);

        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params()
            .times(1)
            .returning(|_| Ok(None));
        hot.expect_cache_session_params()
            .times(1)
            .returning(|_| Ok(()));
        let mut db = MockPersisting::new();
        let row_ = row.clone();
        db.expect_session()
            .times(1)
            .returning(move |_| Ok(Some(row_.clone())));

        let cache = SessionParamCache::new(Arc::new(hot), Arc::new(db));
        let params = cache.params(session).await.unwrap();
        assert_eq!(params.id, session);
        assert_eq!(params.reserve_price, row.reserve_price);
        assert_eq!(params.start_time, row.start_time);
    }

    #[tokio::test]
    async fn cached_params_skip_the_database() {
        let session = SessionId::new_v4();
        let row = session_row(session, true);
        let params = SessionParams {
            id: row.id,
            product_id: row.product_id,
            reserve_price: row.reserve_price,
            inventory: row.inventory,
            alpha: row.alpha,
            beta: row.beta,
            gamma: row.gamma,
            start_time: row.start_time,
            end_time: row.end_time,
        };

        let mut hot = MockHotStoring::new();
        let params_ = params.clone();
        hot.expect_cached_session_params()
            .times(1)
            .returning(move |_| Ok(Some(params_.clone())));
        let mut db = MockPersisting::new();
        db.expect_session().never();

        let cache = SessionParamCache::new(Arc::new(hot), Arc::new(db));
        assert_eq!(cache.params(session).await.unwrap(), params);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let mut hot = MockHotStoring::new();
        hot.expect_cached_session_params().returning(|_| Ok(None));
        let mut db = MockPersisting::new();
        db.expect_session().returning(|_| Ok(None));

        let cache = SessionParamCache::new(Arc::new(hot), Arc::new(db));
        assert!(matches!(
            cache.params(SessionId::new_v4()).await,
            Err(SessionCacheError::NotFound)
        ));
    }

    #[tokio::test]
    async fn window_checks_do_not_need_the_activity_cache() {
        let session = SessionId::new_v4();
        let row = session_row(session, true);
        let params = SessionParams {
            id: row.id,
            product_id: row.product_id,
            reserve_price: row.reserve_price,
            inventory: row.inventory,
            alpha: row.alpha,
            beta: row.beta,
            gamma: row.gamma,
            start_time: row.start_time,
            end_time: row.end_time,
        };

        let mut hot = MockHotStoring::new();
        hot.expect_cached_activity().never();
        hot.expect_cache_activity()
            .withf(|_, flag| *flag == ActivityFlag::Ended)
            .returning(|_, _| Ok(()));
        let db = MockPersisting::new();
        let cache = SessionParamCache::new(Arc::new(hot), Arc::new(db));

        let before = params.start_time - chrono::Duration::seconds(1);
        assert_eq!(
            cache.status(&params, before).await.unwrap(),
            SessionStatus::NotStarted
        );
        let after = params.end_time;
        assert_eq!(
            cache.status(&params, after).await.unwrap(),
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn pause_flag_reads_through_to_database() {
        let session = SessionId::new_v4();
        let row = session_row(session, false);
        let params = SessionParams {
            id: row.id,
            product_id: row.product_id,
            reserve_price: row.reserve_price,
            inventory: row.inventory,
            alpha: row.alpha,
            beta: row.beta,
            gamma: row.gamma,
            start_time: row.start_time,
            end_time: row.end_time,
        };

        let mut hot = MockHotStoring::new();
        hot.expect_cached_activity().times(1).returning(|_| Ok(None));
        hot.expect_cache_activity()
            .withf(|_, flag| *flag == ActivityFlag::Paused)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut db = MockPersisting::new();
        let row_ = row.clone();
        db.expect_session()
            .times(1)
            .returning(move |_| Ok(Some(row_.clone())));

        let cache = SessionParamCache::new(Arc::new(hot), Arc::new(db));
        let inside = params.start_time + chrono::Duration::seconds(1);
        assert_eq!(
            cache.status(&params, inside).await.unwrap(),
            SessionStatus::Paused
        );
    }
}
