/// Commit Hook Module
///
/// Ordered one-shot callbacks tied to transaction boundaries, and the set of
/// observers told about full rollbacks.

use crate::core::Result;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A callback run once against the owning context.
pub type Hook<C> = Box<dyn FnOnce(&mut C) -> Result<()> + Send>;

/// Ordered list of one-shot hooks.
pub struct HookRegistry<C> {
    hooks: Vec<Hook<C>>,
}

impl<C> Default for HookRegistry<C> {
    fn default() -> Self {
        HookRegistry { hooks: Vec::new() }
    }
}

impl<C> fmt::Debug for HookRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry").field("pending", &self.hooks.len()).finish()
    }
}

impl<C> HookRegistry<C> {
    /// Appends a hook; hooks run in registration order.
    pub fn register<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut C) -> Result<()> + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Moves every pending hook out, leaving this registry empty.
    pub fn take(&mut self) -> HookRegistry<C> {
        std::mem::take(self)
    }

    /// Drops every pending hook without running it.
    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// Runs the hooks in order. The first failure stops the run; the hooks
    /// after it are dropped unrun.
    pub fn run_all(self, ctx: &mut C) -> Result<()> {
        let total = self.hooks.len();
        for (i, hook) in self.hooks.into_iter().enumerate() {
            debug!(hook = i + 1, total, "running hook");
            hook(ctx)?;
        }
        Ok(())
    }
}

/// Something that must be told when a transaction is thrown away.
pub trait RollbackObserver: Send + Sync {
    fn on_rollback(&self);
}

/// Observers of the current transaction. An observer registered twice is
/// notified once.
#[derive(Default)]
pub struct RollbackObservers {
    observers: Vec<Arc<dyn RollbackObserver>>,
}

impl fmt::Debug for RollbackObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackObservers").field("count", &self.observers.len()).finish()
    }
}

impl RollbackObservers {
    pub fn add(&mut self, observer: Arc<dyn RollbackObserver>) {
        let ptr = Arc::as_ptr(&observer) as *const ();
        if !self.observers.iter().any(|o| Arc::as_ptr(o) as *const () == ptr) {
            self.observers.push(observer);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }

    /// Calls `on_rollback` on every observer, then forgets them all.
    pub fn notify_and_clear(&mut self) {
        for observer in self.observers.drain(..) {
            observer.on_rollback();
        }
    }
}
