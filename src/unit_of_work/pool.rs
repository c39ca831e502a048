//! Pool of unit-of-work slots
//!
//! Slots are reused across operations. Every activation bumps the slot's
//! generation; handles remember the generation they were issued with, so a
//! handle kept past `release` fails with `InvalidState` instead of touching
//! the next operation's state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Slot, UnitOfWorkStatus};
use crate::types::{ActorId, DomainEvent};

/// Idle slots kept when no limit is given
pub const DEFAULT_MAX_IDLE: usize = 64;

pub struct UnitOfWorkPool<E: DomainEvent> {
    idle: Mutex<Vec<Arc<Slot<E>>>>,
    max_idle: usize,
    created: AtomicUsize,
}

impl<E: DomainEvent> Default for UnitOfWorkPool<E> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}

impl<E: DomainEvent> UnitOfWorkPool<E> {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            created: AtomicUsize::new(0),
        }
    }

    /// Slots waiting for reuse
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Slots allocated over the pool's lifetime
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Take a slot and activate it, returning it with its new generation
    pub(crate) fn acquire(&self, actor: Option<ActorId>) -> (Arc<Slot<E>>, u64) {
        let slot = self.idle.lock().pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(Slot::new())
        });

        let generation = {
            let mut state = slot.state.lock();
            state.generation += 1;
            state.status = UnitOfWorkStatus::Active;
            state.actor = actor;
            state.generation
        };
        (slot, generation)
    }

    /// Clear the slot and put it back, if `generation` still owns it
    pub(crate) fn release(&self, slot: &Arc<Slot<E>>, generation: u64) {
        {
            let mut state = slot.state.lock();
            if state.generation != generation || state.status == UnitOfWorkStatus::Returned {
                return;
            }
            state.reset();
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(slot.clone());
        }
    }
}
