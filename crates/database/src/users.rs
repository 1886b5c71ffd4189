use {
    crate::UserId,
    sqlx::PgConnection,
};

/// One row in the `users` table.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub is_admin: bool,
    /// Reputation weight feeding into bid scoring; always positive.
    pub weight: f64,
}

pub async fn insert(ex: &mut PgConnection, user: &User) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO users (id, username, email, password_hash, is_admin, weight)
VALUES ($1, $2, $3, $4, $5, $6)
    ;"#;
    sqlx::query(QUERY)
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .bind(user.weight)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn fetch(ex: &mut PgConnection, id: UserId) -> Result<Option<User>, sqlx::Error> {
    const QUERY: &str = r#"SELECT * FROM users WHERE id = $1;"#;
    sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

pub async fn fetch_by_username(
    ex: &mut PgConnection,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    const QUERY: &str = r#"SELECT * FROM users WHERE username = $1;"#;
    sqlx::query_as(QUERY)
        .bind(username)
        .fetch_optional(ex)
        .await
}

/// Bulk identity lookup. This is the only query the leaderboard read path
/// is allowed to issue against the durable store.
pub async fn fetch_usernames(
    ex: &mut PgConnection,
    ids: &[UserId],
) -> Result<Vec<(UserId, String)>, sqlx::Error> {
    const QUERY: &str = r#"SELECT id, username FROM users WHERE id = ANY($1);"#;
    sqlx::query_as(QUERY).bind(ids).fetch_all(ex).await
}
