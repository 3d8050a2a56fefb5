use super::*;

#[test]
fn test_metadata_defaults() {
    let backoff = Backoff::metadata();
    assert_eq!(backoff.base_delay, Duration::from_secs(1));
    assert_eq!(backoff.max_jitter, Duration::from_millis(500));
    assert_eq!(backoff.budget, Duration::from_secs(16));
}

#[test]
fn test_exponential_backoff() {
    let backoff = Backoff {
        base_delay: Duration::from_millis(100),
        max_jitter: Duration::ZERO,
        budget: Duration::from_secs(10),
    };

    assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
    assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
    assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
}

#[test]
fn test_jitter_bounds() {
    let backoff = Backoff::metadata();

    for attempt in 0..4 {
        let base = backoff.base_delay_for_attempt(attempt);
        let delay = backoff.delay_for_attempt(attempt);
        assert!(delay >= base, "Delay {:?} below base {:?}", delay, base);
        assert!(
            delay <= base + Duration::from_millis(500),
            "Delay {:?} exceeds jitter bound",
            delay
        );
    }
}

#[test]
fn test_no_overflow_on_large_attempt() {
    let backoff = Backoff::metadata();
    let delay = backoff.delay_for_attempt(50);
    assert!(delay >= Duration::from_secs(1 << 20));
}

fn fixed(base_ms: u64, budget_ms: u64) -> Backoff {
    Backoff {
        base_delay: Duration::from_millis(base_ms),
        max_jitter: Duration::ZERO,
        budget: Duration::from_millis(budget_ms),
    }
}

#[tokio::test(start_paused = true)]
async fn test_schedule_clamps_to_remaining_budget() {
    let delays: Vec<Duration> = fixed(100, 1000).build().take(6).collect();

    // No time passes between calls, so the full budget stays available.
    assert_eq!(
        delays,
        [100, 200, 400, 800, 1000, 1000].map(Duration::from_millis)
    );
}

#[tokio::test(start_paused = true)]
async fn test_schedule_ends_when_budget_spent() {
    let mut schedule = fixed(100, 1000).build();

    assert_eq!(schedule.next(), Some(Duration::from_millis(100)));
    tokio::time::advance(Duration::from_millis(900)).await;
    assert_eq!(schedule.next(), Some(Duration::from_millis(100)));
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(schedule.next(), None);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_schedule_spans_budget() {
    let mut schedule = Backoff::metadata().build();
    let mut total = Duration::ZERO;

    while let Some(delay) = schedule.next() {
        tokio::time::advance(delay).await;
        total += delay;
    }

    assert_eq!(total, Duration::from_secs(16));
}
