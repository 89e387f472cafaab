use redis::Client;
use redis::aio::ConnectionManager;

use crate::error::AppError;

/// Open a reconnecting Redis connection for publishing delivery events.
pub async fn create_redis_pool(redis_url: &str) -> Result<ConnectionManager, AppError> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis event stream backend");
    Ok(manager)
}
