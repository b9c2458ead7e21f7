//! Fixed-capacity pool of idle rendering contexts
//!
//! The pool itself never blocks and never spawns: `acquire` either hands out
//! an idle context or reports that none is free, and `release` either
//! re-pools a context or discards it when it is no longer live. Waiting for a
//! context is the admission queue's job.

use crate::RenderContext;
use std::collections::VecDeque;

pub type PooledContext = Box<dyn RenderContext>;

/// What happened to a context handed back to the pool.
pub enum Released {
    /// The context is idle again.
    Pooled,
    /// The context was dead and its slot is now vacant.
    Discarded(PooledContext),
}

pub struct ContextPool {
    idle: VecDeque<PooledContext>,
    capacity: usize,
    /// Contexts that belong to the pool, idle or checked out.
    live: usize,
    acquisitions: u64,
    releases: u64,
    discarded: u64,
    restocked: u64,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: VecDeque::with_capacity(capacity),
            capacity,
            live: 0,
            acquisitions: 0,
            releases: 0,
            discarded: 0,
            restocked: 0,
        }
    }

    /// Builds a pool from contexts created up front.
    pub fn with_contexts(contexts: Vec<PooledContext>) -> Self {
        let mut pool = Self::new(contexts.len());
        pool.live = contexts.len();
        pool.idle.extend(contexts);
        pool
    }

    pub fn acquire(&mut self) -> Option<PooledContext> {
        let context = self.idle.pop_front()?;
        self.acquisitions += 1;
        Some(context)
    }

    pub fn release(&mut self, context: PooledContext) -> Released {
        self.releases += 1;

        if context.is_live() {
            self.idle.push_back(context);
            Released::Pooled
        } else {
            self.live = self.live.saturating_sub(1);
            self.discarded += 1;
            Released::Discarded(context)
        }
    }

    /// Takes an in-use context out of the pool for good, for shutdown.
    pub fn retire(&mut self, context: PooledContext) -> PooledContext {
        self.releases += 1;
        self.live = self.live.saturating_sub(1);
        context
    }

    /// Fills a vacant slot with a fresh context. Hands the context back when
    /// the pool is already at capacity.
    pub fn restock(&mut self, context: PooledContext) -> Result<(), PooledContext> {
        if self.live >= self.capacity {
            return Err(context);
        }
        self.live += 1;
        self.restocked += 1;
        self.idle.push_back(context);
        Ok(())
    }

    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn vacant_slots(&self) -> usize {
        self.capacity - self.live
    }

    /// Empties the idle set, for shutdown.
    pub fn take_idle(&mut self) -> Vec<PooledContext> {
        self.live -= self.idle.len();
        self.idle.drain(..).collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            live: self.live,
            idle: self.idle.len(),
            in_use: self.live - self.idle.len(),
            acquisitions: self.acquisitions,
            releases: self.releases,
            discarded: self.discarded,
            restocked: self.restocked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub acquisitions: u64,
    pub releases: u64,
    pub discarded: u64,
    pub restocked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeContext;

    fn pool_of(n: usize) -> (ContextPool, Vec<std::sync::Arc<crate::testing::ContextState>>) {
        let mut states = Vec::new();
        let contexts = (0..n)
            .map(|id| {
                let (context, state) = FakeContext::detached(id);
                states.push(state);
                Box::new(context) as PooledContext
            })
            .collect();
        (ContextPool::with_contexts(contexts), states)
    }

    #[test]
    fn test_acquire_until_empty() {
        let (mut pool, _) = pool_of(2);
        assert_eq!(pool.capacity(), 2);

        let a = pool.acquire().expect("first context");
        let b = pool.acquire().expect("second context");
        assert_ne!(a.id(), b.id());
        assert!(pool.acquire().is_none());
        assert!(!pool.has_idle());

        let stats = pool.stats();
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.acquisitions, 2);
    }

    #[test]
    fn test_release_makes_context_reusable() {
        let (mut pool, _) = pool_of(1);
        let context = pool.acquire().unwrap();
        let id = context.id();

        assert!(matches!(pool.release(context), Released::Pooled));
        assert_eq!(pool.acquire().map(|c| c.id()), Some(id));
    }

    #[test]
    fn test_dead_context_is_discarded() {
        let (mut pool, states) = pool_of(2);
        let context = pool.acquire().unwrap();
        states[context.id()].kill();

        match pool.release(context) {
            Released::Discarded(dead) => assert!(!dead.is_live()),
            Released::Pooled => panic!("dead context was re-pooled"),
        }

        let stats = pool.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.acquisitions, stats.releases);
        assert_eq!(pool.vacant_slots(), 1);
    }

    #[test]
    fn test_restock_never_exceeds_capacity() {
        let (mut pool, states) = pool_of(1);
        let (spare, _) = FakeContext::detached(10);
        assert!(pool.restock(Box::new(spare)).is_err());

        let context = pool.acquire().unwrap();
        states[0].kill();
        let _ = pool.release(context);
        assert_eq!(pool.vacant_slots(), 1);

        let (fresh, _) = FakeContext::detached(11);
        assert!(pool.restock(Box::new(fresh)).is_ok());
        assert_eq!(pool.vacant_slots(), 0);
        assert_eq!(pool.stats().restocked, 1);
        assert_eq!(pool.acquire().map(|c| c.id()), Some(11));
    }

    #[test]
    fn test_take_idle_drains_pool() {
        let (mut pool, _) = pool_of(3);
        let held = pool.acquire().unwrap();

        let drained = pool.take_idle();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.stats().live, 1);

        let _ = pool.release(held);
        assert_eq!(pool.idle_count(), 1);
    }
}
