//! Exit hook registry
//!
//! Handles register a hook here so their child is brought down when the
//! owning program exits or is interrupted. Registrations are removed again
//! once the child has closed.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tether_util::HookId;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type HookFn = Arc<dyn Fn() -> HookFuture + Send + Sync>;

/// When a hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// The owning program is about to exit
    Exit,

    /// The owning program received an interrupt request
    Interrupt,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Exit => f.write_str("exit"),
            HookKind::Interrupt => f.write_str("interrupt"),
        }
    }
}

/// Shared table of exit and interrupt hooks
///
/// Cloning shares the table, so one registry can be handed to any number
/// of process handles.
#[derive(Clone, Default)]
pub struct ExitHooks {
    hooks: Arc<Mutex<HashMap<HookId, (HookKind, HookFn)>>>,
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run on `kind`
    pub fn register<F, Fut>(&self, kind: HookKind, hook: F) -> HookId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = HookId::new();
        let hook: HookFn = Arc::new(move || Box::pin(hook()) as HookFuture);
        self.hooks.lock().unwrap().insert(id, (kind, hook));
        debug!(hook_id = %id, kind = %kind, "Registered hook");
        id
    }

    /// Remove a hook. Returns false if it was already gone.
    pub fn deregister(&self, id: HookId) -> bool {
        let removed = self.hooks.lock().unwrap().remove(&id).is_some();
        if removed {
            debug!(hook_id = %id, "Deregistered hook");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every hook of `kind` concurrently and wait for all of them.
    ///
    /// Each hook runs at most once: it is removed from the table before it
    /// is invoked. Returns how many hooks ran.
    pub async fn run(&self, kind: HookKind) -> usize {
        let due: Vec<HookFn> = {
            let mut hooks = self.hooks.lock().unwrap();
            let ids: Vec<HookId> = hooks
                .iter()
                .filter(|(_, (k, _))| *k == kind)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| hooks.remove(id))
                .map(|(_, hook)| hook)
                .collect()
        };

        let count = due.len();
        if count == 0 {
            return 0;
        }
        info!(kind = %kind, count, "Running hooks");

        let handles: Vec<_> = due.into_iter().map(|hook| tokio::spawn(hook())).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(kind = %kind, error = %e, "Hook task failed");
            }
        }
        count
    }

    /// Run the interrupt hooks on the first Ctrl-C
    pub fn listen_for_interrupt(&self) -> JoinHandle<usize> {
        let hooks = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received");
                    hooks.run(HookKind::Interrupt).await
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for interrupt");
                    0
                }
            }
        })
    }
}

impl fmt::Debug for ExitHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHooks")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl Fn() -> HookFuture + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[test]
    fn deregister_is_idempotent() {
        let hooks = ExitHooks::new();
        let id = hooks.register(HookKind::Exit, || async {});
        assert_eq!(hooks.len(), 1);

        assert!(hooks.deregister(id));
        assert!(!hooks.deregister(id));
        assert!(hooks.is_empty());
    }

    #[tokio::test]
    async fn run_only_matching_kind_and_only_once() {
        let hooks = ExitHooks::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let interrupts = Arc::new(AtomicUsize::new(0));

        hooks.register(HookKind::Exit, counting_hook(&exits));
        hooks.register(HookKind::Exit, counting_hook(&exits));
        hooks.register(HookKind::Interrupt, counting_hook(&interrupts));

        assert_eq!(hooks.run(HookKind::Exit).await, 2);
        assert_eq!(exits.load(Ordering::SeqCst), 2);
        assert_eq!(interrupts.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.len(), 1);

        assert_eq!(hooks.run(HookKind::Exit).await, 0);
        assert_eq!(exits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_run_concurrently() {
        let hooks = ExitHooks::new();
        for _ in 0..3 {
            hooks.register(HookKind::Interrupt, || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            });
        }

        let started = tokio::time::Instant::now();
        assert_eq!(hooks.run(HookKind::Interrupt).await, 3);
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
