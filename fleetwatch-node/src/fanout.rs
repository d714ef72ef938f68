//! Bounded fan-out shared by the sweep phases

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Runs `task` on every item with at most `limit` tasks in flight and
/// waits for all of them. Outputs come back in completion order.
pub async fn bounded<I, F, Fut>(items: I, limit: usize, task: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    stream::iter(items)
        .map(task)
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_respects_limit() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let outputs = bounded(0..20u32, 3, |n| {
            let (in_flight, peak) = (&in_flight, &peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                n * 2
            }
        })
        .await;

        assert_eq!(outputs.len(), 20);
        assert_eq!(outputs.iter().sum::<u32>(), (0..20).map(|n| n * 2).sum::<u32>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_bounded_zero_limit_still_runs() {
        let outputs = bounded(vec!["a", "b"], 0, |s| async move { s.len() }).await;
        assert_eq!(outputs, vec![1, 1]);
    }
}
