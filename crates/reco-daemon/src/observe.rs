//! Observe-until-match-or-timeout.
//!
//! `check` runs once straight away (with `None`), then once per notification
//! received on `rx` (with `Some(event)`), until it yields a value or the
//! deadline passes.  The receiver is owned by this future, so the
//! subscription ends on every exit path: match, timeout, closed source, or
//! the caller dropping the future.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::debug;

pub async fn observe_until<E, T, F, Fut>(
    mut rx: broadcast::Receiver<E>,
    timeout: Duration,
    mut check: F,
) -> Option<T>
where
    E: Clone,
    F: FnMut(Option<E>) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + timeout;

    if let Some(found) = check(None).await {
        return Some(found);
    }

    loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => return None,
            Ok(Ok(event)) => Some(event),
            // Missed notifications: we only care that something changed.
            Ok(Err(RecvError::Lagged(n))) => {
                debug!("observe: lagged by {} notifications, re-probing", n);
                None
            }
            Ok(Err(RecvError::Closed)) => {
                debug!("observe: notification source closed");
                return None;
            }
        };

        if let Some(found) = check(event).await {
            return Some(found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_matches_immediately_without_notifications() {
        let (_tx, rx) = broadcast::channel::<()>(4);
        let found = observe_until(rx, Duration::from_millis(10), |_| async { Some(7) }).await;
        assert_eq!(found, Some(7));
    }

    #[tokio::test]
    async fn test_matches_after_notification() {
        let (tx, rx) = broadcast::channel::<()>(4);
        let ready = Arc::new(AtomicBool::new(false));

        let flag = ready.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
            // keep the sender alive past the match
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let check_flag = ready.clone();
        let found = observe_until(rx, Duration::from_secs(2), move |_| {
            let ready = check_flag.load(Ordering::SeqCst);
            async move { ready.then_some("present") }
        })
        .await;
        assert_eq!(found, Some("present"));
    }

    #[tokio::test]
    async fn test_times_out_and_releases_subscription() {
        let (tx, rx) = broadcast::channel::<u32>(4);
        let found: Option<u32> =
            observe_until(rx, Duration::from_millis(30), |_| async { None }).await;
        assert_eq!(found, None);
        assert_eq!(tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_check_sees_event_payload() {
        let (tx, rx) = broadcast::channel::<String>(4);
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send("/discover".to_string());
            let _ = tx.send("/search/sounds?q=x".to_string());
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let found = observe_until(rx, Duration::from_secs(2), |event: Option<String>| async move {
            event.filter(|url| url.contains("/search"))
        })
        .await;
        assert_eq!(found.as_deref(), Some("/search/sounds?q=x"));
        sender.abort();
    }
}
