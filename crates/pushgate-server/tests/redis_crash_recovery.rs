//! Verifies that a message picked up by `get` but never acknowledged -
//! simulating a worker process crashing mid-push - is handed out again by
//! a fresh `RedisQueue` connecting afterwards. Requires a reachable Redis;
//! set `REDIS_URL` (defaults to `redis://127.0.0.1/`) and run with
//! `cargo test -- --ignored` to exercise it.

use pushgate_queue::redis::RedisQueue;
use pushgate_queue::Queue;
use tokio_util::sync::CancellationToken;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

#[tokio::test]
#[ignore = "requires a reachable redis instance"]
async fn pending_item_is_recovered_after_reconnect() {
    let url = redis_url();
    let service_id = "crash-recovery-test";
    let prefix = "pushgate-integration";

    let queue = RedisQueue::connect(&url, service_id, prefix)
        .await
        .expect("connect to redis");
    queue.enqueue(b"undelivered".to_vec()).await.unwrap();

    let cancel = CancellationToken::new();
    // Simulate a worker pulling the item and then crashing before
    // removing or requeuing it: drop the handle without acting on it.
    let picked_up = queue.get(&cancel).await.unwrap();
    assert_eq!(picked_up.bytes(), b"undelivered");
    drop(picked_up);

    // A fresh connection (standing in for the replacement process)
    // should recover it from the pending list back onto waiting.
    let recovered_queue = RedisQueue::connect(&url, service_id, prefix)
        .await
        .expect("reconnect to redis");
    let recovered = recovered_queue.get(&cancel).await.unwrap();
    assert_eq!(recovered.bytes(), b"undelivered");
    recovered_queue.remove(recovered).await.unwrap();
}
