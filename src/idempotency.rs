use crate::models::DraftResponse;
use redis::AsyncCommands;

// Idempotency replay cache keyed by `Idempotency-Key` header value. Redis
// being down degrades to no replay protection rather than failing requests.

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<DraftResponse> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let cached: Option<String> = conn.get(key).await.ok();
    cached.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(client: &redis::Client, key: &str, value: &DraftResponse, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
