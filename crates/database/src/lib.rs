pub mod bids;
pub mod products;
pub mod rankings;
pub mod sessions;
pub mod users;

use {sqlx::Executor, uuid::Uuid};

// Design:
//
// Functions that execute multiple statements take `&mut PgTransaction` to
// indicate this and to ensure that the whole function succeeds or fails
// together. Functions that execute a single statement take `&mut
// PgConnection`. We usually call the parameter `ex` for `Executor` which is
// the trait whose methods we use to run queries.
// This scheme allows callers to decide whether they want to use a function
// as part of a bigger transaction or standalone. Note that PgTransaction
// implements Deref to PgConnection. Callers do need to take care of calling
// `commit` on the transaction.
//
// For tests a useful pattern is to start a transaction at the beginning of
// the test, use it for all queries and never commit it. When the
// uncommitted transaction gets dropped it is rolled back, which allows
// postgres tests to run in parallel without clearing tables up front.

pub type PgTransaction<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

pub type SessionId = Uuid;
pub type UserId = Uuid;
pub type ProductId = Uuid;

/// All tables this crate writes to, in an order that respects foreign keys
/// when truncating.
pub const TABLES: &[&str] = &["rankings", "bids", "sessions", "products", "users"];

/// Delete all data in the database. Only used by tests.
#[allow(non_snake_case)]
pub async fn clear_DANGER_(ex: &mut PgTransaction<'_>) -> sqlx::Result<()> {
    for table in TABLES {
        ex.execute(format!("TRUNCATE {table} CASCADE;").as_str())
            .await?;
    }
    Ok(())
}
