//! Named memory arenas with explicit lifetimes.
//!
//! Transition values are owned Rust values, so an arena here does not hand
//! out allocations; it tracks the bytes charged against it and owns the
//! shutdown hooks registered by aggregate implementations. Resetting an
//! arena models freeing everything allocated in it: accounting returns to
//! zero and the generation advances, so stale references can be detected in
//! debug assertions by holders that recorded the generation.

use std::fmt;

/// Shutdown hook registered by an aggregate against the arena its state
/// lives in. Runs once, at the next rescan.
pub type ResetHook = Box<dyn FnOnce() + Send>;

pub struct Arena {
    name: String,
    used: usize,
    generation: u64,
    hooks: Vec<ResetHook>,
}

impl Arena {
    pub fn new(name: impl Into<String>) -> Self {
        Arena {
            name: name.into(),
            used: 0,
            generation: 0,
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record `bytes` as living in this arena until the next reset.
    pub fn charge(&mut self, bytes: usize) {
        self.used += bytes;
    }

    pub fn register_reset_hook(&mut self, hook: ResetHook) {
        self.hooks.push(hook);
    }

    /// Drop everything in the arena without running shutdown hooks.
    pub fn reset(&mut self) {
        self.hooks.clear();
        self.used = 0;
        self.generation += 1;
    }

    /// Run registered shutdown hooks, then reset. Used at group boundaries
    /// so aggregates can release non-memory resources.
    pub fn rescan(&mut self) {
        for hook in self.hooks.drain(..) {
            hook();
        }
        self.used = 0;
        self.generation += 1;
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("used", &self.used)
            .field("generation", &self.generation)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
