//! Cooperative cancellation signals and signal composition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Cancellation signal checked at every suspension point of a call.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Cancel the signal, waking every waiter.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before the re-check so a cancel() racing this call is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Keeps a derived signal wired to its sources; dropping it tears the
/// listeners down.
#[derive(Debug)]
pub struct SignalLink {
    handle: Option<JoinHandle<()>>,
}

impl SignalLink {
    pub fn empty() -> Self {
        Self { handle: None }
    }
}

impl Drop for SignalLink {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Compose cancellation sources into one derived signal.
///
/// The derived signal fires as soon as any source fires. The returned
/// [`SignalLink`] must be kept alive for as long as propagation is wanted.
pub fn linked(
    sources: impl IntoIterator<Item = Arc<CancellationSignal>>,
) -> (Arc<CancellationSignal>, SignalLink) {
    let sources: Vec<_> = sources.into_iter().collect();
    let derived = CancellationSignal::arc();

    if sources.iter().any(|s| s.is_cancelled()) {
        derived.cancel();
        return (derived, SignalLink::empty());
    }
    if sources.is_empty() {
        return (derived, SignalLink::empty());
    }

    let target = derived.clone();
    let handle = tokio::spawn(async move {
        let waits = sources
            .iter()
            .map(|s| {
                let s = s.clone();
                Box::pin(async move { s.cancelled().await })
            })
            .collect::<Vec<_>>();
        futures::future::select_all(waits).await;
        target.cancel();
    });

    (derived, SignalLink { handle: Some(handle) })
}
