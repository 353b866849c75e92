use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::info;

use crate::error::ConsultationError;

fn pool_error(context: &'static str, err: impl std::fmt::Display) -> ConsultationError {
    ConsultationError::RedisError(redis::RedisError::from((
        redis::ErrorKind::IoError,
        context,
        err.to_string(),
    )))
}

/// Builds a pool and checks it with PING before anything else uses it.
pub async fn connect(redis_url: &str) -> Result<Pool, ConsultationError> {
    let pool = Config::from_url(redis_url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| pool_error("Failed to create Redis pool", e))?;

    let mut conn = connection(&pool).await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!("Redis connection pool initialized");

    Ok(pool)
}

pub async fn connection(pool: &Pool) -> Result<Connection, ConsultationError> {
    pool.get()
        .await
        .map_err(|e| pool_error("Failed to get Redis connection", e))
}
