//! Database connection management

pub mod schema;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::StoreSettings;

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(settings: &StoreSettings) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&settings.url())
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Apply the table, history-table, and trigger DDL idempotently.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        schema::apply(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSettings;

    // Note: These tests require a running PostgreSQL instance

    fn test_settings() -> StoreSettings {
        StoreSettings {
            host: "localhost".to_string(),
            port: 5432,
            user: "pulse".to_string(),
            password: "pulse123".to_string(),
            name: "pulse_db".to_string(),
            pool_size: 4,
        }
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_database_connect_success() {
        let db = Database::connect(&test_settings()).await;
        assert!(db.is_ok(), "Should connect to PostgreSQL successfully");
    }

    #[tokio::test]
    #[ignore]
    async fn test_database_health_check() {
        let db = Database::connect(&test_settings())
            .await
            .expect("Failed to connect");

        let health = db.health_check().await;
        assert!(health.is_ok(), "Health check should pass");
    }

    #[tokio::test]
    #[ignore]
    async fn test_ensure_schema_is_idempotent() {
        let db = Database::connect(&test_settings())
            .await
            .expect("Failed to connect");

        db.ensure_schema().await.expect("first apply");
        db.ensure_schema().await.expect("second apply");
    }
}
