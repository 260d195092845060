//! Deadline helper shared by connect and query paths.

use std::future::Future;
use std::time::Duration;

/// Run `fut` to completion or give up after `limit`. `None` means timed out;
/// the future is dropped at that point.
pub async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    smol::future::or(async { Some(fut.await) }, async {
        smol::Timer::after(limit).await;
        None
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_within_limit() {
        let out = smol::block_on(with_timeout(Duration::from_secs(1), async { 7 }));
        assert_eq!(out, Some(7));
    }

    #[test]
    fn test_times_out() {
        let out = smol::block_on(with_timeout(Duration::from_millis(20), async {
            smol::Timer::after(Duration::from_secs(5)).await;
            7
        }));
        assert_eq!(out, None);
    }
}
