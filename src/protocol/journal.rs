//! Checkpointable state containers.
//!
//! Every mutable piece of state an operation touches lives in a [`Journal`].
//! An operation checkpoints all participants up front and then either
//! commits (discarding the checkpoints) or rolls back (restoring them), which
//! gives all-or-nothing semantics across the core and its collaborators.
//!
//! Checkpoints form a stack, so a participant shared by several components
//! may be checkpointed more than once within one operation as long as commits
//! and rollbacks are issued in reverse order.

use std::sync::{Mutex, MutexGuard};

/// A participant in an all-or-nothing operation.
pub trait Journaled: Send + Sync {
    /// Record the current state.
    fn checkpoint(&self);
    /// Drop the most recent checkpoint, keeping current state.
    fn commit(&self);
    /// Restore the most recent checkpoint.
    fn rollback(&self);
}

struct Inner<T> {
    current: T,
    checkpoints: Vec<T>,
}

/// State cell with a checkpoint stack.
pub struct Journal<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone + Send> Journal<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: value,
                checkpoints: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A poisoned journal still holds the last written state; rollback
        // decides what survives.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().current)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock().current)
    }

    /// Clone of the current value.
    pub fn get(&self) -> T {
        self.lock().current.clone()
    }

    /// Number of open checkpoints.
    pub fn depth(&self) -> usize {
        self.lock().checkpoints.len()
    }
}

impl<T: Clone + Send> Journaled for Journal<T> {
    fn checkpoint(&self) {
        let mut inner = self.lock();
        let snapshot = inner.current.clone();
        inner.checkpoints.push(snapshot);
    }

    fn commit(&self) {
        self.lock().checkpoints.pop();
    }

    fn rollback(&self) {
        let mut inner = self.lock();
        if let Some(snapshot) = inner.checkpoints.pop() {
            inner.current = snapshot;
        }
    }
}
