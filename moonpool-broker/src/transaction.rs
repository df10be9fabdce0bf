//! Explicit unit-of-work transaction.
//!
//! A [`TransactionContext`] is created by the surrounding framework for each
//! unit of work and passed explicitly to `send` and `receive`. The transport
//! registers hooks on it and caches the session it picked in the item slot,
//! so every operation of the unit of work uses the same channel.
//!
//! # Phases
//!
//! ```text
//!            commit()                      rollback() / dispose()
//!   ┌──────────────────────────┐        ┌─────────────────────────┐
//!   │ on_commit hooks (acks)   │        │ on_rolled_back hooks    │
//!   │ on_committed hooks       │        │ (tx rollback, nacks)    │
//!   │ (channel tx commit)      │        └─────────────────────────┘
//!   └──────────────────────────┘
//!                     dispose(): on_cleanup hooks
//! ```
//!
//! Hooks within a phase run sequentially in registration order.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt};

use crate::error::{TransportError, TransportResult};
use crate::session::WorkerId;

/// Future returned by a transaction hook.
pub type HookFuture = BoxFuture<'static, TransportResult<()>>;

type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

type Item = Arc<dyn Any + Send + Sync>;

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting work.
    Active,
    /// Commit hooks ran successfully.
    Committed,
    /// Rollback hooks ran (possibly after a failed commit).
    RolledBack,
    /// A commit hook failed; the unit of work must be rolled back.
    Failed,
}

#[derive(Default)]
struct Hooks {
    commit: Vec<Hook>,
    committed: Vec<Hook>,
    rolled_back: Vec<Hook>,
    cleanup: Vec<Hook>,
}

struct Inner {
    state: TransactionState,
    disposed: bool,
    hooks: Hooks,
    items: HashMap<String, Item>,
}

/// Per-unit-of-work hook registry and item slot.
pub struct TransactionContext {
    worker: WorkerId,
    inner: Mutex<Inner>,
}

fn boxed<F, Fut>(hook: F) -> Hook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = TransportResult<()>> + Send + 'static,
{
    Box::new(move || hook().boxed())
}

impl TransactionContext {
    /// Start a unit of work on behalf of `worker`.
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            inner: Mutex::new(Inner {
                state: TransactionState::Active,
                disposed: false,
                hooks: Hooks::default(),
                items: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker performing this unit of work.
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    /// Register a hook run first during [`commit`](Self::commit).
    pub fn on_commit<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<()>> + Send + 'static,
    {
        self.lock().hooks.commit.push(boxed(hook));
    }

    /// Register a hook run after every `on_commit` hook succeeded.
    pub fn on_committed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<()>> + Send + 'static,
    {
        self.lock().hooks.committed.push(boxed(hook));
    }

    /// Register a hook run during [`rollback`](Self::rollback).
    pub fn on_rolled_back<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<()>> + Send + 'static,
    {
        self.lock().hooks.rolled_back.push(boxed(hook));
    }

    /// Register a hook run during [`dispose`](Self::dispose).
    pub fn on_cleanup<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TransportResult<()>> + Send + 'static,
    {
        self.lock().hooks.cleanup.push(boxed(hook));
    }

    /// Typed lookup in the item slot.
    pub fn item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.lock()
            .items
            .get(key)
            .cloned()
            .and_then(|item| item.downcast::<T>().ok())
    }

    /// Store a value in the item slot, replacing any previous one.
    pub fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.lock().items.insert(key.into(), value);
    }

    /// Run commit hooks, then committed hooks.
    ///
    /// Stops at the first failing hook and leaves the transaction
    /// [`Failed`](TransactionState::Failed); the caller is expected to roll back.
    pub async fn commit(&self) -> TransportResult<()> {
        let (commit, committed) = {
            let mut inner = self.lock();
            if inner.state != TransactionState::Active {
                return Err(TransportError::Hook(format!(
                    "cannot commit a transaction in state {:?}",
                    inner.state
                )));
            }
            (
                std::mem::take(&mut inner.hooks.commit),
                std::mem::take(&mut inner.hooks.committed),
            )
        };

        for hook in commit.into_iter().chain(committed) {
            if let Err(err) = hook().await {
                self.lock().state = TransactionState::Failed;
                return Err(err);
            }
        }

        self.lock().state = TransactionState::Committed;
        Ok(())
    }

    /// Run every rollback hook, returning the first error.
    ///
    /// Hooks after a failing one still run. Rolling back twice is a no-op.
    pub async fn rollback(&self) -> TransportResult<()> {
        let hooks = {
            let mut inner = self.lock();
            match inner.state {
                TransactionState::Committed => {
                    return Err(TransportError::Hook(
                        "cannot roll back a committed transaction".to_string(),
                    ))
                }
                TransactionState::RolledBack => return Ok(()),
                TransactionState::Active | TransactionState::Failed => {}
            }
            inner.state = TransactionState::RolledBack;
            std::mem::take(&mut inner.hooks.rolled_back)
        };

        let mut first_error = None;
        for hook in hooks {
            if let Err(err) = hook().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Roll back unfinished work, then run cleanup hooks. Idempotent.
    pub async fn dispose(&self) -> TransportResult<()> {
        let unfinished = {
            let mut inner = self.lock();
            if inner.disposed {
                return Ok(());
            }
            inner.disposed = true;
            matches!(
                inner.state,
                TransactionState::Active | TransactionState::Failed
            )
        };

        let rollback = if unfinished {
            self.rollback().await
        } else {
            Ok(())
        };

        let hooks = std::mem::take(&mut self.lock().hooks.cleanup);
        let mut first_error = rollback.err();
        for hook in hooks {
            if let Err(err) = hook().await {
                first_error.get_or_insert(err);
            }
        }

        let mut inner = self.lock();
        inner.items.clear();
        inner.hooks = Hooks::default();
        drop(inner);

        first_error.map_or(Ok(()), Err)
    }
}
