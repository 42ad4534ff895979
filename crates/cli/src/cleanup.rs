//! Cancellation and ordered teardown.
//!
//! The first SIGINT/SIGTERM/SIGHUP cancels the guard's token; stages watching
//! the token abort and `main` then runs the registered finalizers once, newest
//! first. Signals arriving after cancellation are logged and dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl ShutdownSignal {
    #[cfg(target_family = "unix")]
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            ShutdownSignal::Interrupt => Signal::SIGINT,
            ShutdownSignal::Terminate => Signal::SIGTERM,
            ShutdownSignal::Hangup => Signal::SIGHUP,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Cancelled,
    Ignored,
}

/// A teardown step registered during launch.
#[async_trait]
pub trait Finalizer: Send + Sync {
    fn name(&self) -> &str;
    async fn finalize(&self);
}

pub struct CleanupGuard {
    token: CancellationToken,
    finalizers: Mutex<Vec<Box<dyn Finalizer>>>,
    ran: AtomicBool,
    /// SIGINT belongs to a foreground child while set.
    child_owns_interrupt: AtomicBool,
    signal: Mutex<Option<ShutdownSignal>>,
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            finalizers: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
            child_owns_interrupt: AtomicBool::new(false),
            signal: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal that triggered cancellation, if any.
    pub fn received_signal(&self) -> Option<ShutdownSignal> {
        self.signal.lock().ok().and_then(|s| *s)
    }

    pub fn register(&self, finalizer: Box<dyn Finalizer>) {
        debug!(finalizer = finalizer.name(), "finalizer registered");
        if let Ok(mut finalizers) = self.finalizers.lock() {
            finalizers.push(finalizer);
        }
    }

    pub fn set_child_owns_interrupt(&self, owned: bool) {
        self.child_owns_interrupt.store(owned, Ordering::SeqCst);
    }

    /// Decide what a delivered signal does. Only the first one cancels.
    pub fn on_signal(&self, signal: ShutdownSignal) -> SignalDisposition {
        if signal == ShutdownSignal::Interrupt && self.child_owns_interrupt.load(Ordering::SeqCst) {
            debug!("SIGINT left to the assistant");
            return SignalDisposition::Ignored;
        }
        if self.token.is_cancelled() {
            warn!(%signal, "signal received during shutdown, ignoring");
            return SignalDisposition::Ignored;
        }

        info!(%signal, "shutdown requested");
        if let Ok(mut slot) = self.signal.lock() {
            *slot = Some(signal);
        }
        self.token.cancel();
        SignalDisposition::Cancelled
    }

    /// Run finalizers newest-first. Later calls are no-ops.
    pub async fn run(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            debug!("cleanup already ran");
            return;
        }

        let finalizers = match self.finalizers.lock() {
            Ok(mut finalizers) => std::mem::take(&mut *finalizers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for finalizer in finalizers.iter().rev() {
            debug!(finalizer = finalizer.name(), "running finalizer");
            finalizer.finalize().await;
        }
    }

    /// Route SIGINT, SIGTERM and SIGHUP into [`on_signal`](Self::on_signal).
    #[cfg(target_family = "unix")]
    pub fn spawn_signal_listener(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let guard = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => ShutdownSignal::Interrupt,
                    Some(()) = terminate.recv() => ShutdownSignal::Terminate,
                    Some(()) = hangup.recv() => ShutdownSignal::Hangup,
                    else => break,
                };
                guard.on_signal(received);
            }
        }))
    }

    #[cfg(not(target_family = "unix"))]
    pub fn spawn_signal_listener(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let guard = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                guard.on_signal(ShutdownSignal::Interrupt);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Finalizer for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn finalize(&self) {
            self.log.lock().unwrap().push(self.name.clone());
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Finalizer> {
        Box::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn finalizers_run_newest_first_exactly_once() {
        let guard = CleanupGuard::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        guard.register(recorder("registry", &log));
        guard.register(recorder("proxy", &log));

        guard.run().await;
        guard.run().await;

        assert_eq!(*log.lock().unwrap(), vec!["proxy", "registry"]);
    }

    #[test]
    fn only_first_signal_cancels() {
        let guard = CleanupGuard::new();

        assert_eq!(guard.on_signal(ShutdownSignal::Terminate), SignalDisposition::Cancelled);
        assert_eq!(guard.on_signal(ShutdownSignal::Interrupt), SignalDisposition::Ignored);
        assert_eq!(guard.on_signal(ShutdownSignal::Hangup), SignalDisposition::Ignored);

        assert!(guard.is_cancelled());
        assert_eq!(guard.received_signal(), Some(ShutdownSignal::Terminate));
    }

    #[test]
    fn interrupt_is_left_to_foreground_child() {
        let guard = CleanupGuard::new();
        guard.set_child_owns_interrupt(true);

        assert_eq!(guard.on_signal(ShutdownSignal::Interrupt), SignalDisposition::Ignored);
        assert!(!guard.is_cancelled());

        assert_eq!(guard.on_signal(ShutdownSignal::Hangup), SignalDisposition::Cancelled);
    }
}
