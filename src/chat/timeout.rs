// Three-tier stream timeout supervision
//
// Wraps an upstream line stream with first/idle/total deadlines. The idle
// deadline resets on every yielded line; the total deadline is measured from
// subscription. A tier set to 0 is disabled. When a tier expires the wrapped
// stream ends with a typed timeout error and the upstream iterator is
// dropped, which aborts the underlying request.

use crate::error::{AppError, TimeoutTier};
use crate::upstream::LineStream;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;

/// Timeout tiers in seconds; 0 disables a tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTimeouts {
    pub first: u64,
    pub idle: u64,
    pub total: u64,
}

impl StreamTimeouts {
    pub fn disabled(&self) -> bool {
        self.first == 0 && self.idle == 0 && self.total == 0
    }
}

/// Supervise a line stream with the configured deadlines.
pub fn with_stream_timeouts(
    lines: LineStream,
    timeouts: StreamTimeouts,
) -> impl Stream<Item = Result<String, AppError>> + Send {
    async_stream::stream! {
        let mut lines = lines;

        if timeouts.disabled() {
            while let Some(item) = lines.next().await {
                yield item.map_err(AppError::from);
            }
            return;
        }

        let start = Instant::now();
        let mut is_first = true;

        loop {
            let stage = if is_first && timeouts.first > 0 {
                Some((TimeoutTier::First, timeouts.first))
            } else if timeouts.idle > 0 {
                Some((TimeoutTier::Idle, timeouts.idle))
            } else {
                None
            };

            // The total budget shrinks as the stream runs; when it becomes
            // the binding constraint, a timeout is reported as Total.
            let mut effective = stage;
            if timeouts.total > 0 {
                let total_budget = Duration::from_secs(timeouts.total);
                let remaining = total_budget.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    tracing::warn!("stream total timeout after {}s", timeouts.total);
                    yield Err(AppError::StreamTimeout {
                        tier: TimeoutTier::Total,
                        seconds: timeouts.total,
                    });
                    return;
                }
                let remaining_secs = remaining.as_secs_f64();
                match effective {
                    Some((_, stage_secs)) if (stage_secs as f64) <= remaining_secs => {}
                    _ => effective = Some((TimeoutTier::Total, timeouts.total)),
                }
                if let Some((TimeoutTier::Total, _)) = effective {
                    // Wait only for what is left of the total budget
                    match tokio::time::timeout(remaining, lines.next()).await {
                        Ok(Some(item)) => {
                            is_first = false;
                            yield item.map_err(AppError::from);
                            continue;
                        }
                        Ok(None) => return,
                        Err(_) => {
                            tracing::warn!("stream total timeout after {}s", timeouts.total);
                            yield Err(AppError::StreamTimeout {
                                tier: TimeoutTier::Total,
                                seconds: timeouts.total,
                            });
                            return;
                        }
                    }
                }
            }

            match effective {
                Some((tier, seconds)) => {
                    match tokio::time::timeout(Duration::from_secs(seconds), lines.next()).await {
                        Ok(Some(item)) => {
                            is_first = false;
                            yield item.map_err(AppError::from);
                        }
                        Ok(None) => return,
                        Err(_) => {
                            tracing::warn!("stream {tier} timeout after {seconds}s");
                            yield Err(AppError::StreamTimeout { tier, seconds });
                            return;
                        }
                    }
                }
                None => match lines.next().await {
                    Some(item) => {
                        is_first = false;
                        yield item.map_err(AppError::from);
                    }
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;

    /// Canned line stream with per-line delays.
    fn delayed_lines(lines: Vec<(&'static str, Duration)>) -> LineStream {
        Box::pin(async_stream::stream! {
            for (line, delay) in lines {
                tokio::time::sleep(delay).await;
                yield Ok::<String, UpstreamError>(line.to_string());
            }
        })
    }

    async fn drain(
        stream: impl Stream<Item = Result<String, AppError>>,
    ) -> (Vec<String>, Option<AppError>) {
        futures::pin_mut!(stream);
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(line) => lines.push(line),
                Err(e) => return (lines, Some(e)),
            }
        }
        (lines, None)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fires_between_lines() {
        let lines = delayed_lines(vec![
            ("one", Duration::from_millis(10)),
            ("two", Duration::from_secs(5)),
        ]);
        let timeouts = StreamTimeouts {
            first: 0,
            idle: 2,
            total: 0,
        };
        let (received, err) = drain(with_stream_timeouts(lines, timeouts)).await;

        assert_eq!(received, vec!["one"]);
        match err {
            Some(AppError::StreamTimeout { tier, seconds }) => {
                assert_eq!(tier, TimeoutTier::Idle);
                assert_eq!(seconds, 2);
            }
            other => panic!("expected idle timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_timeout_fires_before_any_line() {
        let lines = delayed_lines(vec![("late", Duration::from_secs(60))]);
        let timeouts = StreamTimeouts {
            first: 3,
            idle: 120,
            total: 0,
        };
        let (received, err) = drain(with_stream_timeouts(lines, timeouts)).await;

        assert!(received.is_empty());
        match err {
            Some(AppError::StreamTimeout { tier, .. }) => assert_eq!(tier, TimeoutTier::First),
            other => panic!("expected first timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_caps_a_slow_stream() {
        // Lines keep arriving inside the idle window but the stream as a
        // whole overruns the total budget.
        let lines = delayed_lines(vec![
            ("a", Duration::from_secs(2)),
            ("b", Duration::from_secs(2)),
            ("c", Duration::from_secs(2)),
            ("d", Duration::from_secs(2)),
        ]);
        let timeouts = StreamTimeouts {
            first: 0,
            idle: 10,
            total: 5,
        };
        let (received, err) = drain(with_stream_timeouts(lines, timeouts)).await;

        assert_eq!(received, vec!["a", "b"]);
        match err {
            Some(AppError::StreamTimeout { tier, seconds }) => {
                assert_eq!(tier, TimeoutTier::Total);
                assert_eq!(seconds, 5);
            }
            other => panic!("expected total timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_tiers_pass_everything_through() {
        let lines = delayed_lines(vec![
            ("a", Duration::from_millis(1)),
            ("b", Duration::from_millis(1)),
        ]);
        let (received, err) = drain(with_stream_timeouts(lines, StreamTimeouts::default())).await;
        assert_eq!(received, vec!["a", "b"]);
        assert!(err.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fast_stream_finishes_under_all_tiers() {
        let lines = delayed_lines(vec![
            ("a", Duration::from_millis(100)),
            ("b", Duration::from_millis(100)),
        ]);
        let timeouts = StreamTimeouts {
            first: 30,
            idle: 120,
            total: 600,
        };
        let (received, err) = drain(with_stream_timeouts(lines, timeouts)).await;
        assert_eq!(received, vec!["a", "b"]);
        assert!(err.is_none());
    }
}
