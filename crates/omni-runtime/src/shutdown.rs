use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Something that owns an external resource and must release it at exit.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn name(&self) -> String;

    async fn cleanup(&self);
}

#[derive(Default)]
struct Inner {
    cancel: CancellationToken,
    hooks: Mutex<Vec<Weak<dyn CleanupHook>>>,
}

/// Process-wide "should continue" signal plus the cleanup hooks run when
/// the process shuts down.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown begins. Waiting loops select on it.
    pub fn token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn should_continue(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Registers `hook`. Only a weak reference is kept, so a hook whose owner
    /// was already dropped is skipped.
    pub fn register(&self, hook: &Arc<dyn CleanupHook>) {
        let mut hooks = self.inner.hooks.lock();
        hooks.retain(|existing| existing.strong_count() > 0);
        hooks.push(Arc::downgrade(hook));
    }

    /// Cancels the token and runs every live hook once, most recent first.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let hooks: Vec<_> = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks.iter().rev().filter_map(Weak::upgrade) {
            info!(hook = %hook.name(), "running cleanup hook");
            hook.cleanup().await;
        }
    }

    /// Resolves on ctrl-c or SIGTERM.
    pub async fn wait_for_signal() {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("ctrl-c received"),
            _ = terminate => info!("SIGTERM received"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl CleanupHook for Counter {
        fn name(&self) -> String {
            "counter".into()
        }

        async fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_live_hooks_once_and_cancels() {
        let coordinator = ShutdownCoordinator::new();
        let count = Arc::new(AtomicUsize::new(0));
        let live: Arc<dyn CleanupHook> = Arc::new(Counter(count.clone()));
        let dropped: Arc<dyn CleanupHook> = Arc::new(Counter(count.clone()));
        coordinator.register(&live);
        coordinator.register(&dropped);
        drop(dropped);

        let token = coordinator.token();
        assert!(coordinator.should_continue());
        coordinator.shutdown().await;
        coordinator.shutdown().await;

        assert!(token.is_cancelled());
        assert!(!coordinator.should_continue());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
