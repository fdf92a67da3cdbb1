//! Ambient Context Cell
//!
//! One slot per `ScopeKey` per unit of concurrency, holding the connection
//! the innermost active scope installed. Two independent instances exist:
//!
//! - `AmbientCell`: thread-local, for blocking call chains. `set` hands out
//!   an `AmbientToken` that restores the previous value when reset or
//!   dropped, so the restore runs on every exit path including unwinding.
//! - `TaskCell`: tokio task-local, for suspending call chains. `scope` runs a
//!   future with the new value installed; the previous value is back in place
//!   as soon as the future completes or is dropped. Spawned tasks start
//!   empty, and sibling futures joined inside one task each see their own
//!   value.
//!
//! The cells only reference handles; they never open, finish or close
//! connections.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SCOPE_KEY: AtomicU64 = AtomicU64::new(1);

/// Identifies one family of scopes (one scoped engine and its clones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey(u64);

impl ScopeKey {
    /// Allocate a fresh key.
    pub fn new() -> Self {
        ScopeKey(NEXT_SCOPE_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ScopeKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// AmbientCell - thread-local
// ---------------------------------------------------------------------------

thread_local! {
    static THREAD_SLOTS: RefCell<HashMap<ScopeKey, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Thread-local ambient slot for handles of type `H`.
pub struct AmbientCell<H> {
    key: ScopeKey,
    _marker: PhantomData<fn() -> H>,
}

impl<H: Clone + 'static> AmbientCell<H> {
    pub fn new(key: ScopeKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// Current value on this thread.
    pub fn get(&self) -> Option<H> {
        THREAD_SLOTS.with(|slots| {
            slots
                .borrow()
                .get(&self.key)
                .and_then(|value| value.downcast_ref::<H>())
                .cloned()
        })
    }

    /// Install `value`, returning a token that puts the previous value back.
    #[must_use = "dropping the token immediately restores the previous value"]
    pub fn set(&self, value: Option<H>) -> AmbientToken<H> {
        let previous = THREAD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            match value {
                Some(value) => slots.insert(self.key, Box::new(value)),
                None => slots.remove(&self.key),
            }
        });
        AmbientToken {
            key: self.key,
            previous,
            _marker: PhantomData,
        }
    }

    /// Restore the value that was current before the matching `set`.
    pub fn reset(&self, token: AmbientToken<H>) {
        debug_assert_eq!(token.key, self.key, "token reset on a foreign cell");
        drop(token);
    }
}

impl<H> fmt::Debug for AmbientCell<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientCell").field("key", &self.key).finish()
    }
}

/// Restores an `AmbientCell` to its prior value when dropped.
///
/// Tied to the thread that created it.
pub struct AmbientToken<H> {
    key: ScopeKey,
    previous: Option<Box<dyn Any>>,
    _marker: PhantomData<(fn() -> H, *const ())>,
}

impl<H> Drop for AmbientToken<H> {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // try_with: the slot map may already be gone during thread teardown
        let _ = THREAD_SLOTS.try_with(|slots| {
            let replaced = {
                let mut slots = slots.borrow_mut();
                match previous {
                    Some(value) => slots.insert(self.key, value),
                    None => slots.remove(&self.key),
                }
            };
            drop(replaced);
        });
    }
}

// ---------------------------------------------------------------------------
// TaskCell - task-local
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TaskSlots(HashMap<ScopeKey, Arc<dyn Any + Send + Sync>>);

tokio::task_local! {
    static TASK_SLOTS: TaskSlots;
}

/// Task-local ambient slot for handles of type `H`.
pub struct TaskCell<H> {
    key: ScopeKey,
    _marker: PhantomData<fn() -> H>,
}

impl<H: Clone + Send + Sync + 'static> TaskCell<H> {
    pub fn new(key: ScopeKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// Current value in this task, `None` outside any scope.
    pub fn get(&self) -> Option<H> {
        TASK_SLOTS
            .try_with(|slots| {
                slots
                    .0
                    .get(&self.key)
                    .and_then(|value| value.downcast_ref::<H>())
                    .cloned()
            })
            .ok()
            .flatten()
    }

    /// Run `fut` with `value` installed; other keys are carried over.
    pub async fn scope<F: Future>(&self, value: Option<H>, fut: F) -> F::Output {
        let mut slots = TASK_SLOTS
            .try_with(|slots| slots.clone())
            .unwrap_or_default();
        match value {
            Some(value) => {
                slots.0.insert(self.key, Arc::new(value));
            }
            None => {
                slots.0.remove(&self.key);
            }
        }
        TASK_SLOTS.scope(slots, fut).await
    }
}

impl<H> fmt::Debug for TaskCell<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCell").field("key", &self.key).finish()
    }
}
