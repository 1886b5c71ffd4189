use {
    crate::{PgTransaction, SessionId, UserId},
    sqlx::{PgConnection, QueryBuilder},
    std::ops::DerefMut,
};

/// One row of a session's frozen final ranking, written exactly once at
/// finalization. Rows with `rank <= inventory` carry `is_winner = true`.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Ranking {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub rank: i64,
    pub price: f64,
    pub score: f64,
    pub is_winner: bool,
}

pub async fn insert(ex: &mut PgTransaction<'_>, rankings: &[Ranking]) -> Result<(), sqlx::Error> {
    const QUERY: &str =
        "INSERT INTO rankings (session_id, user_id, rank, price, score, is_winner) ";

    if rankings.is_empty() {
        return Ok(());
    }

    let mut query_builder = QueryBuilder::new(QUERY);
    query_builder.push_values(rankings, |mut builder, ranking| {
        builder
            .push_bind(ranking.session_id)
            .push_bind(ranking.user_id)
            .push_bind(ranking.rank)
            .push_bind(ranking.price)
            .push_bind(ranking.score)
            .push_bind(ranking.is_winner);
    });

    query_builder.build().execute(ex.deref_mut()).await?;
    Ok(())
}

pub async fn fetch(
    ex: &mut PgConnection,
    session_id: SessionId,
) -> Result<Vec<Ranking>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM rankings
WHERE session_id = $1
ORDER BY rank
    ;"#;
    sqlx::query_as(QUERY).bind(session_id).fetch_all(ex).await
}

/// Whether a final ranking was already written for this session. Used as
/// the finalization idempotence guard.
pub async fn exists(ex: &mut PgConnection, session_id: SessionId) -> Result<bool, sqlx::Error> {
    const QUERY: &str = r#"SELECT EXISTS(SELECT 1 FROM rankings WHERE session_id = $1);"#;
    sqlx::query_scalar(QUERY).bind(session_id).fetch_one(ex).await
}
