// Debounced persistence - dirty flag, wake channel, single writer task
//
// Mutations mark the entity dirty and nudge the writer; the writer sleeps for
// the save window, then flushes once for however many marks arrived in the
// meantime. A zero window flushes on every wake. Shutdown drains any pending
// dirty state before the task exits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Shared handle between a manager (marking) and its writer task (flushing).
pub struct Debounce {
    dirty: AtomicBool,
    notify: Notify,
    delay_ms: AtomicU64,
}

impl Debounce {
    pub fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
            delay_ms: AtomicU64::new(delay_ms),
        })
    }

    /// Mark the entity dirty and wake the writer.
    pub fn mark(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Clear and return the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::SeqCst))
    }
}

/// Spawn the writer task for one persisted entity.
///
/// `flush` must be cheap to call when nothing changed; it only runs when the
/// dirty flag was set. Errors are logged and the loop keeps running so one
/// failed write never wedges the entity.
pub fn spawn_flusher<F, Fut>(
    name: &'static str,
    debounce: Arc<Debounce>,
    mut shutdown: watch::Receiver<bool>,
    flush: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        'run: loop {
            tokio::select! {
                _ = debounce.notify.notified() => {}
                _ = shutdown.changed() => break 'run,
            }

            // Coalesce: keep flushing windows until one passes clean.
            loop {
                let delay = debounce.delay();
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break 'run,
                    }
                }
                if !debounce.take_dirty() {
                    break;
                }
                if let Err(e) = flush().await {
                    tracing::error!("failed to persist {name}: {e:#}");
                }
            }
        }

        // Drain on shutdown so a dirty entity is never lost.
        if debounce.take_dirty() {
            if let Err(e) = flush().await {
                tracing::error!("failed to persist {name} during shutdown: {e:#}");
            } else {
                tracing::debug!("flushed {name} on shutdown");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn coalesces_marks_within_window() {
        let debounce = Debounce::new(50);
        let (_tx, rx) = watch::channel(false);
        let flushes = Arc::new(AtomicUsize::new(0));

        let counter = flushes.clone();
        let handle = spawn_flusher("test", debounce.clone(), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for _ in 0..20 {
            debounce.mark();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_state() {
        let debounce = Debounce::new(60_000); // window far longer than the test
        let (tx, rx) = watch::channel(false);
        let flushes = Arc::new(AtomicUsize::new(0));

        let counter = flushes.clone();
        let handle = spawn_flusher("test", debounce.clone(), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        debounce.mark();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert!(!debounce.is_dirty());
    }

    #[tokio::test]
    async fn separate_windows_flush_separately() {
        let debounce = Debounce::new(30);
        let (_tx, rx) = watch::channel(false);
        let flushes = Arc::new(AtomicUsize::new(0));

        let counter = flushes.clone();
        let handle = spawn_flusher("test", debounce.clone(), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        debounce.mark();
        tokio::time::sleep(Duration::from_millis(80)).await;
        debounce.mark();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(flushes.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
