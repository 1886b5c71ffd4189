use {
    chrono::{DateTime, Utc},
    database::{
        bids,
        rankings::{self, Ranking},
        sessions::{self, Session, SessionWithProduct},
        users::{self, User},
    },
    model::{SessionId, UserId},
    sqlx::{
        postgres::{PgConnectOptions, PgPoolOptions},
        PgPool,
    },
    std::{str::FromStr, time::Duration},
};

/// How long a single statement may run before the server cancels it.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub size: u32,
    pub overflow: u32,
    pub timeout: Duration,
    /// Connections go through a pooling proxy: use the large profile and
    /// skip the pre-acquire health check the proxy already performs.
    pub proxied: bool,
}

#[derive(Clone)]
pub struct Postgres(pub PgPool);

impl Postgres {
    pub async fn new(url: &str, config: PoolConfig) -> sqlx::Result<Self> {
        let options = PgConnectOptions::from_str(url)?
            .application_name("bidhouse")
            .options([(
                "statement_timeout",
                STATEMENT_TIMEOUT.as_millis().to_string(),
            )]);
        let pool = PgPoolOptions::new()
            .min_connections(if config.proxied { 0 } else { config.size })
            .max_connections(config.size + config.overflow)
            .acquire_timeout(config.timeout)
            .test_before_acquire(!config.proxied)
            .connect_with(options)
            .await?;
        Ok(Self(pool))
    }
}

/// The durable store operations the pipeline needs. The hot store stays
/// authoritative between persist cycles; everything going through this
/// trait is either read-through caching or reconciliation.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Persisting: Send + Sync {
    async fn user(&self, id: UserId) -> sqlx::Result<Option<User>>;
    async fn session(&self, id: SessionId) -> sqlx::Result<Option<Session>>;
    async fn expired_sessions(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Session>>;
    async fn sessions_with_products(&self) -> sqlx::Result<Vec<SessionWithProduct>>;
    async fn usernames(&self, ids: &[UserId]) -> sqlx::Result<Vec<(UserId, String)>>;
    async fn upsert_bids(&self, bids: &[bids::Bid]) -> sqlx::Result<()>;
    /// Persisted bids of one session in scoreboard order. Fallback source
    /// for finalization when the hot keys are gone.
    async fn session_bids(&self, session: SessionId) -> sqlx::Result<Vec<bids::Bid>>;
    async fn ranking_exists(&self, session: SessionId) -> sqlx::Result<bool>;
    async fn session_rankings(&self, session: SessionId) -> sqlx::Result<Vec<Ranking>>;
    /// Writes the frozen final ranking and flips the session inactive in
    /// one transaction. Returns false when the session was already
    /// finalized.
    async fn freeze_ranking(
        &self,
        session: SessionId,
        rankings: &[Ranking],
        final_price: f64,
    ) -> sqlx::Result<bool>;
}

#[async_trait::async_trait]
impl Persisting for Postgres {
    async fn user(&self, id: UserId) -> sqlx::Result<Option<User>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["user"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        users::fetch(&mut ex, id).await
    }

    async fn session(&self, id: SessionId) -> sqlx::Result<Option<Session>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["session"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        sessions::fetch(&mut ex, id).await
    }

    async fn expired_sessions(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Session>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["expired_sessions"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        sessions::fetch_expired(&mut ex, now).await
    }

    async fn sessions_with_products(&self) -> sqlx::Result<Vec<SessionWithProduct>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["sessions_with_products"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        sessions::fetch_all_with_product(&mut ex).await
    }

    async fn usernames(&self, ids: &[UserId]) -> sqlx::Result<Vec<(UserId, String)>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["usernames"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        users::fetch_usernames(&mut ex, ids).await
    }

    async fn upsert_bids(&self, records: &[bids::Bid]) -> sqlx::Result<()> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["upsert_bids"])
            .start_timer();

        let mut transaction = self.0.begin().await?;
        bids::upsert_batch(&mut transaction, records).await?;
        transaction.commit().await
    }

    async fn session_bids(&self, session: SessionId) -> sqlx::Result<Vec<bids::Bid>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["session_bids"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        bids::fetch_for_session(&mut ex, session).await
    }

    async fn ranking_exists(&self, session: SessionId) -> sqlx::Result<bool> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["ranking_exists"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        rankings::exists(&mut ex, session).await
    }

    async fn session_rankings(&self, session: SessionId) -> sqlx::Result<Vec<Ranking>> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["session_rankings"])
            .start_timer();

        let mut ex = self.0.acquire().await?;
        rankings::fetch(&mut ex, session).await
    }

    async fn freeze_ranking(
        &self,
        session: SessionId,
        rows: &[Ranking],
        final_price: f64,
    ) -> sqlx::Result<bool> {
        let _timer = Metrics::get()
            .database_queries
            .with_label_values(&["freeze_ranking"])
            .start_timer();

        let mut transaction = self.0.begin().await?;
        let finalized = sessions::finalize(&mut transaction, session, final_price).await?;
        if finalized == 0 {
            // Someone else already froze this session; keep their rows.
            return Ok(false);
        }
        rankings::insert(&mut transaction, rows).await?;
        transaction.commit().await?;
        Ok(true)
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Timing of durable store queries.
    #[metric(name = "bidhouse_database_queries", labels("type"))]
    database_queries: prometheus::HistogramVec,
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
        chrono::TimeZone,
        database::products::{self, Product},
        model::ProductId,
    };

    #[tokio::test]
    #[ignore]
    async fn postgres_freeze_ranking_writes_once() {
        let db = Postgres::new(
            "postgresql://",
            PoolConfig {
                size: 2,
                overflow: 2,
                timeout: Duration::from_secs(20),
                proxied: false,
            },
        )
        .await
        .unwrap();

        let product = Product {
            id: ProductId::new_v4(),
            name: "widget".to_string(),
            description: "a widget".to_string(),
        };
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let session = Session {
            id: SessionId::new_v4(),
            product_id: product.id,
            reserve_price: 200.,
            final_price: None,
            inventory: 1,
            alpha: 0.5,
            beta: 1000.,
            gamma: 2.,
            start_time: start,
            end_time: start + chrono::Duration::seconds(60),
            is_active: true,
        };
        {
            let mut ex = db.0.acquire().await.unwrap();
            products::insert(&mut ex, &product).await.unwrap();
            sessions::insert(&mut ex, &session).await.unwrap();
        }

        let rows = vec![Ranking {
            session_id: session.id,
            user_id: UserId::new_v4(),
            rank: 1,
            price: 250.,
            score: 627.,
            is_winner: true,
        }];
        assert!(db.freeze_ranking(session.id, &rows, 250.).await.unwrap());
        // The second freeze must keep the first outcome.
        assert!(!db.freeze_ranking(session.id, &rows, 999.).await.unwrap());

        let stored = db.session(session.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.final_price, Some(250.));
        assert_eq!(db.session_rankings(session.id).await.unwrap(), rows);
    }
}
