//! String interning for recurring task and tool IDs
//!
//! Ensures each unique id string is stored only once in memory.
//! Uses DashMap for lock-free concurrent access.
//!
//! Performance benefits:
//! - Memory: single allocation per unique string
//! - Cloning: Arc::clone is O(1), no string copy

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Global string interner (thread-safe, lock-free)
static INTERNER: Lazy<Interner> = Lazy::new(Interner::new);

/// Intern a string via the global interner.
pub fn intern(s: &str) -> Arc<str> {
    INTERNER.intern(s)
}

/// Thread-safe string interner using DashMap
pub struct Interner {
    /// Map from string content to interned Arc<str>
    strings: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
        }
    }

    /// Intern a string, returning a shared Arc<str>
    ///
    /// If the string was already interned, returns the existing Arc.
    /// Otherwise, creates a new Arc and stores it.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let key: Arc<str> = Arc::from(s);

        if let Some(existing) = self.strings.get(&key) {
            return Arc::clone(existing.key());
        }

        self.strings.insert(Arc::clone(&key), ());
        key
    }

    /// Number of interned strings
    #[allow(dead_code)] // Used in tests
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Check if empty
    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_deduplicates() {
        let interner = Interner::new();
        let a = interner.intern("task_0");
        let b = interner.intern("task_0");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn intern_distinct_strings() {
        let interner = Interner::new();
        let a = interner.intern("task_0");
        let b = interner.intern("task_1");

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn global_intern_is_shared() {
        let a = intern("shared-id");
        let b = intern("shared-id");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
