use std::time::Duration;

use salesnote_core::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;

pub type DbPool = sqlx::PgPool;

pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_open_conns.max(1))
        .min_connections(config.max_idle_conns.min(config.max_open_conns))
        .max_lifetime(Duration::from_secs(config.conn_max_lifetime_secs.max(1)))
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url())
        .await
}
