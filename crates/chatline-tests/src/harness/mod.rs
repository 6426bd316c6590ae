pub mod client;
pub mod relay;

use std::future::Future;
use std::time::Duration;

/// How long a test waits for a frame that should arrive.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a test waits before concluding a frame will not arrive.
pub const SILENCE: Duration = Duration::from_millis(300);

/// Poll `check` until it returns true, or timeout. Returns the final result.
pub async fn poll_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("chatline_relay=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}
