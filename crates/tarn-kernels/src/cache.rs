//! LRU cache of compiled fragments.
//!
//! Programs are keyed by their full source text and operand ranks, so two
//! fragments only share a program when they are byte-for-byte identical.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::KernelError;
use crate::ir::{Program, Signature};
use crate::parser::parse;

/// Programs kept by the process-wide cache.
pub const MAX_PROGRAMS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source: Arc<str>,
    signature: Signature,
}

struct CacheEntry {
    program: Arc<Program>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    capacity: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_programs: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded cache of compiled programs. When full, the least recently used
/// program is evicted.
pub struct ProgramCache {
    inner: Mutex<CacheInner>,
}

impl ProgramCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                capacity: capacity.max(1),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Compiled program for `source`, compiling on a miss. Failed
    /// compilations are not cached.
    pub fn compile(&self, name: &str, source: &str, signature: &Signature) -> Result<Arc<Program>, KernelError> {
        let key = CacheKey {
            source: Arc::from(source),
            signature: signature.clone(),
        };
        {
            let mut inner = self.inner.lock();
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.last_used = tick;
                let program = Arc::clone(&entry.program);
                inner.hits += 1;
                return Ok(program);
            }
            inner.misses += 1;
        }

        // parse outside the lock; a racing compile of the same key keeps the first insert
        let program = Arc::new(parse(source, signature)?);
        tracing::debug!(kernel = name, inputs = signature.input_ranks.len(), "compiled kernel fragment");

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_used = tick;
            return Ok(Arc::clone(&entry.program));
        }
        while inner.entries.len() >= inner.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                    tracing::trace!(kernel = name, "evicted cached program");
                }
                None => break,
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                program: Arc::clone(&program),
                last_used: tick,
            },
        );
        Ok(program)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            cached_programs: inner.entries.len(),
            capacity: inner.capacity,
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

impl std::fmt::Debug for ProgramCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ProgramCache")
            .field("cached_programs", &stats.cached_programs)
            .field("capacity", &stats.capacity)
            .finish()
    }
}

static PROGRAM_CACHE: OnceLock<ProgramCache> = OnceLock::new();

/// The process-wide cache used by [`compile`].
pub fn program_cache() -> &'static ProgramCache {
    PROGRAM_CACHE.get_or_init(|| ProgramCache::new(MAX_PROGRAMS))
}

/// Compile `source` for the given operand ranks through the process-wide
/// cache.
pub fn compile(name: &str, source: &str, signature: &Signature) -> Result<Arc<Program>, KernelError> {
    program_cache().compile(name, source, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_reuses_program() {
        let sig = Signature::new(vec![1], 1);
        let src = "/* cache_reuse */ @out(0) = @in0(0);";
        let a = compile("copy", src, &sig).unwrap();
        let b = compile("copy", src, &sig).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // same source, different ranks compiles separately
        let c = compile("copy", "/* cache_reuse */ @out(0) = 1;", &Signature::new(vec![2], 1)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_errors_not_cached() {
        let cache = ProgramCache::new(4);
        let sig = Signature::new(vec![], 1);
        assert!(cache.compile("bad", "@out(0) = ;", &sig).is_err());
        assert!(cache.compile("bad", "@out(0) = ;", &sig).is_err());
        assert_eq!(cache.stats().cached_programs, 0);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn test_distinct_sources_never_share() {
        let cache = ProgramCache::new(8);
        let sig = Signature::new(vec![], 1);
        let one = cache.compile("k", "@out(0) = 1;", &sig).unwrap();
        let two = cache.compile("k", "@out(0) = 2;", &sig).unwrap();
        assert!(!Arc::ptr_eq(&one, &two));
        assert_eq!(cache.stats().cached_programs, 2);

        cache.clear();
        assert_eq!(cache.stats().cached_programs, 0);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = ProgramCache::new(2);
        let sig = Signature::new(vec![], 1);
        let a = cache.compile("a", "@out(0) = 1;", &sig).unwrap();
        cache.compile("b", "@out(0) = 2;", &sig).unwrap();
        // touch a so b is the oldest
        assert!(Arc::ptr_eq(&a, &cache.compile("a", "@out(0) = 1;", &sig).unwrap()));
        cache.compile("c", "@out(0) = 3;", &sig).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.cached_programs, 2);
        assert_eq!(stats.hits, 1);
        assert!(Arc::ptr_eq(&a, &cache.compile("a", "@out(0) = 1;", &sig).unwrap()));
        let misses = cache.stats().misses;
        cache.compile("b", "@out(0) = 2;", &sig).unwrap();
        assert_eq!(cache.stats().misses, misses + 1);
    }
}
