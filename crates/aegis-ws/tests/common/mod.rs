//! Shared helpers for aegis-ws integration tests.

pub mod mock_ws;

use std::time::Duration;

/// Poll `cond` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
