use {crate::ProductId, sqlx::PgConnection};

/// One row in the `products` table.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
}

pub async fn insert(ex: &mut PgConnection, product: &Product) -> Result<(), sqlx::Error> {
    const QUERY: &str = r#"
INSERT INTO products (id, name, description)
VALUES ($1, $2, $3)
    ;"#;
    sqlx::query(QUERY)
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.description)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn fetch(ex: &mut PgConnection, id: ProductId) -> Result<Option<Product>, sqlx::Error> {
    const QUERY: &str = r#"SELECT * FROM products WHERE id = $1;"#;
    sqlx::query_as(QUERY).bind(id).fetch_optional(ex).await
}
