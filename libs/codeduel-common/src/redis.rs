use crate::types::{RunResponse, SubmissionJob};
use redis::{AsyncCommands, RedisResult};

/// Redis queue semantics shared by the API layer, the worker and the CLI.
/// Keys are deterministic so producers and consumers never drift.

pub const QUEUE_KEY: &str = "codeduel:queue:submissions";
pub const RESULT_PREFIX: &str = "codeduel:result";

/// Result key for a submission
pub fn result_key(submission_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, submission_id)
}

fn encode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

fn decode_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string()))
}

/// Push a submission onto the queue (RPUSH, FIFO with `pop_submission`)
pub async fn push_submission(
    conn: &mut redis::aio::ConnectionManager,
    job: &SubmissionJob,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(encode_error)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop the next submission, waiting at most `timeout_seconds`
///
/// Returns `Ok(None)` when the wait expires so the caller can check for shutdown.
pub async fn pop_submission(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<SubmissionJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: SubmissionJob = serde_json::from_str(&payload).map_err(decode_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a run response with a TTL
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    response: &RunResponse,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let key = result_key(&response.submission_id);
    let payload = serde_json::to_string(response).map_err(encode_error)?;
    let _: () = conn.set_ex(&key, payload, ttl_seconds).await?;
    Ok(())
}

/// Fetch a stored run response, if the worker has produced one
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &uuid::Uuid,
) -> RedisResult<Option<RunResponse>> {
    let key = result_key(submission_id);
    let payload: Option<String> = conn.get(&key).await?;

    match payload {
        Some(data) => {
            let response: RunResponse = serde_json::from_str(&data).map_err(decode_error)?;
            Ok(Some(response))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = result_key(&id);
        let key2 = result_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("codeduel:result:"));
        assert!(key1.ends_with(&id.to_string()));
    }

    #[test]
    fn test_queue_key() {
        assert_eq!(QUEUE_KEY, "codeduel:queue:submissions");
    }
}
