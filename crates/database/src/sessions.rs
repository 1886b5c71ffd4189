use {
    crate::{ProductId, SessionId},
    sqlx::{
        types::chrono::{DateTime, Utc},
        PgConnection,
    },
};

/// One row in the `sessions` table.
///
/// The scoring coefficients and timing are immutable once the session has
/// started; `is_active` and `final_price` are the only mutable columns.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Session {
    pub id: SessionId,
    pub product_id: ProductId,
    pub reserve_price: f64,
    pub final_price: Option<f64>,
    pub inventory: i64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_active: bool,
}

pub async fn insert(ex: &mut PgConnection, session: &Session) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO sessions (
    id,
    product_id,
    reserve_price,
    final_price,
    inventory,
    alpha,
    beta,
    gamma,
    start_time,
    end_time,
    is_active
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ;"#;
    sqlx::query(QUERY)
        .bind(session.id)
        .bind(session.product_id)
        .bind(session.reserve_price)
        .bind(session.final_price)
        .bind(session.inventory)
        .bind(session.alpha)
        .bind(session.beta)
        .bind(session.gamma)
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(session.is_active)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn fetch(ex: &mut PgConnection, id: SessionId) -> Result<Option<Session>, sqlx::Error> {
    const QUERY: &str = r#"SELECT * FROM sessions WHERE id = $1;"#;
    sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}

/// Sessions that are still flagged active although their bidding window is
/// over. These are the finalization candidates of the session monitor.
pub async fn fetch_expired(
    ex: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<Session>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT * FROM sessions
WHERE is_active AND end_time <= $1
ORDER BY end_time
    ;"#;
    sqlx::query_as(QUERY).bind(now).fetch_all(ex).await
}

/// One row of the session list enriched with its product, the shape the
/// session-list push topic broadcasts.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct SessionWithProduct {
    #[sqlx(flatten)]
    pub session: Session,
    pub name: String,
    pub description: String,
}

pub async fn fetch_all_with_product(
    ex: &mut PgConnection,
) -> Result<Vec<SessionWithProduct>, sqlx::Error> {
    const QUERY: &str = r#"
SELECT s.*, p.name, p.description
FROM sessions s
JOIN products p ON p.id = s.product_id
ORDER BY s.start_time
    ;"#;
    sqlx::query_as(QUERY).fetch_all(ex).await
}

/// Flips the session inactive and records the clearing price. Guarded on
/// `is_active` so repeated finalization affects zero rows.
pub async fn finalize(
    ex: &mut PgConnection,
    id: SessionId,
    final_price: f64,
) -> Result<u64, sqlx::Error> {
    const QUERY: &str = r#"
UPDATE sessions
SET is_active = false, final_price = $2
WHERE id = $1 AND is_active
    ;"#;
    let result = sqlx::query(QUERY).bind(id).bind(final_price).execute(ex).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::products::{self, Product},
        chrono::TimeZone,
        sqlx::Connection,
    };

    pub fn session(product_id: ProductId, end_offset_secs: i64) -> Session {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Session {
            id: SessionId::new_v4(),
            product_id,
            reserve_price: 200.,
            final_price: None,
            inventory: 5,
            alpha: 0.5,
            beta: 1000.,
            gamma: 2.,
            start_time: start,
            end_time: start + chrono::Duration::seconds(end_offset_secs),
            is_active: true,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_roundtrip() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let product = Product {
            id: ProductId::new_v4(),
            name: "widget".to_string(),
            description: "a widget".to_string(),
        };
        products::insert(&mut db, &product).await.unwrap();

        let session = session(product.id, 60);
        insert(&mut db, &session).await.unwrap();
        assert_eq!(fetch(&mut db, session.id).await.unwrap(), Some(session.clone()));

        // Not expired before its end time.
        let expired = fetch_expired(&mut db, session.end_time - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(expired.is_empty());
        let expired = fetch_expired(&mut db, session.end_time).await.unwrap();
        assert_eq!(expired, vec![session.clone()]);

        let all = fetch_all_with_product(&mut db).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session, session);
        assert_eq!(all[0].name, "widget");
    }

    #[tokio::test]
    #[ignore]
    async fn postgres_finalize_is_idempotent() {
        let mut db = PgConnection::connect("postgresql://").await.unwrap();
        let mut db = db.begin().await.unwrap();
        crate::clear_DANGER_(&mut db).await.unwrap();

        let product = Product {
            id: ProductId::new_v4(),
            name: "widget".to_string(),
            description: "a widget".to_string(),
        };
        products::insert(&mut db, &product).await.unwrap();
        let session = session(product.id, 60);
        insert(&mut db, &session).await.unwrap();

        assert_eq!(finalize(&mut db, session.id, 250.).await.unwrap(), 1);
        // Second run is a no-op.
        assert_eq!(finalize(&mut db, session.id, 999.).await.unwrap(), 0);

        let stored = fetch(&mut db, session.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.final_price, Some(250.));
    }
}
