use {
    crate::{PgTransaction, SessionId, UserId},
    sqlx::{
        types::chrono::{DateTime, Utc},
        PgConnection,
        QueryBuilder,
    },
    std::ops::DerefMut,
};

/// One row in the `bids` table; unique per `(session_id, user_id)`.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Bid {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub price: f64,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Batched idempotent upsert: repeated processing of the same records
/// yields the same durable state. Conflict resolution is on the
/// `(session_id, user_id)` primary key.
pub async fn upsert_batch(ex: &mut PgTransaction<'_>, bids: &[Bid]) -> Result<(), sqlx::Error> {
    const QUERY: &str = "INSERT INTO bids (session_id, user_id, price, score, updated_at) ";

    if bids.is_empty() {
        return Ok(());
    }

    let mut query_builder = QueryBuilder::new(QUERY);
    query_builder.push_values(bids, |mut builder, bid| {
        builder
            .push_bind(bid.session_id)
            .push_bind(bid.user_id)
            .push_bind(bid.price)
            .push_bind(bid.score)
            .push_bind(bid.updated_at);
    });
    query_builder.push(
        " ON CONFLICT (session_id, user_id) DO UPDATE SET price = EXCLUDED.price, score = \
         EXCLUDED.score, updated_at = EXCLUDED.updated_at",
    );

    query_builder.build().execute(ex.deref_mut()).await?;
    Ok(())
}

pub async fn fetch_for_session(
    ex: &mut PgConnection,
    session_id: SessionId,
) -> Result<Vec<Bid>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM bids
WHERE session_id = $1
ORDER BY score DESC, updated_at, user_id
    ;"#;
    sqlx::query_as(QUERY).bind(session_id).fetch_all(ex).await
}

pub async fn count_for_session(
    ex: &mut PgConnection,
    session_id: SessionId,
) -> Result<i64, sqlx::Error> {
    const QUERY: &str = r#"SELECT COUNT(*) FROM bids WHERE session_id = $1;"#;
    sqlx::query_scalar(QUERY).bind(session_id).fetch_one(ex).await
}
