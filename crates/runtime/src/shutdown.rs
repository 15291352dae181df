//! Cooperative shutdown flag shared by the long-running loops.
//!
//! SIGINT/SIGTERM set the flag; loops check it at the top of each
//! iteration and every interruptible wait returns promptly once it is
//! set, so the process exits within two seconds of the signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Process-wide shutdown state. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    requested: AtomicBool,
    signal: Mutex<Option<String>>,
    notify: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a shutdown request and wake every waiter.
    pub fn request(&self, signal: &str) {
        {
            let mut guard = self.inner.signal.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                *guard = Some(signal.to_string());
            }
        }
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Name of the signal that triggered shutdown, once requested.
    pub fn signal_name(&self) -> Option<String> {
        self.inner
            .signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration`, returning early if shutdown is requested.
    /// Returns true when shutdown was requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before re-checking the flag so a request
        // landing between the check and the await is never missed.
        notified.as_mut().enable();
        if self.is_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_requested(),
            _ = notified => true,
        }
    }

    /// Install SIGINT/SIGTERM handlers that set this flag. A second
    /// signal during cleanup force-exits; prior store writes are all
    /// committed transactions, so state stays consistent.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let flag = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => flag.request("SIGINT"),
                _ = sigterm.recv() => flag.request("SIGTERM"),
            }
            tracing::info!(signal = ?flag.signal_name(), "shutdown requested");
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            tracing::warn!("second signal received, forcing exit");
            std::process::exit(130);
        });
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.request("SIGINT");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes_when_not_requested() {
        let flag = ShutdownFlag::new();
        let interrupted = flag.sleep(Duration::from_millis(10)).await;
        assert!(!interrupted);
    }

    #[tokio::test]
    async fn test_request_interrupts_sleep() {
        let flag = ShutdownFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        flag.request("SIGTERM");

        let interrupted = handle.await.unwrap();
        assert!(interrupted);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(flag.signal_name().as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn test_request_before_sleep_returns_immediately() {
        let flag = ShutdownFlag::new();
        flag.request("SIGINT");
        let start = Instant::now();
        assert!(flag.sleep(Duration::from_secs(30)).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_first_signal_name_wins() {
        let flag = ShutdownFlag::new();
        flag.request("SIGTERM");
        flag.request("SIGINT");
        assert_eq!(flag.signal_name().as_deref(), Some("SIGTERM"));
    }
}
