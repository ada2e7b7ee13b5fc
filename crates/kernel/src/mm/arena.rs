//! Resource arenas
//!
//! A boundary-tag allocator over an integer resource space, used for
//! kernel virtual bytes. An arena owns a set of spans; allocated and free
//! spans always tile exactly the space the arena holds, and adjacent free
//! spans are coalesced eagerly. An arena may import spans on demand from a
//! source arena, and may keep per-quantum caches of recently freed small
//! spans to short-circuit the general path.

use crate::status::{Result, Status};
use crate::sync::spinlock::SpinLock;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Largest span (in quanta) served from the quantum caches.
const QCACHE_SPANS: usize = 4;
/// Bound on cached spans per size class.
const QCACHE_DEPTH: usize = 16;
/// Minimum import from a source arena, in quanta.
const IMPORT_QUANTA: usize = 16;

struct ArenaInner {
    /// Free spans, keyed by base. Never adjacent: coalescing is eager.
    free: BTreeMap<usize, usize>,
    /// Outstanding allocations, keyed by base.
    allocated: BTreeMap<usize, usize>,
    /// Spans imported from the source, for reclaim.
    imported: BTreeMap<usize, usize>,
    /// Cached small spans per quantum count (index = quanta - 1).
    qcache: [Vec<usize>; QCACHE_SPANS],
    total: usize,
    used: usize,
}

pub struct Arena {
    name: &'static str,
    quantum: usize,
    use_qcache: bool,
    source: Option<&'static Arena>,
    inner: SpinLock<ArenaInner>,
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaStats {
    pub total: usize,
    pub used: usize,
}

impl Arena {
    /// Create an arena. `span` is an optional initial `(base, size)`;
    /// further spans arrive via `add_span` or the source arena.
    pub fn new(
        name: &'static str,
        span: Option<(usize, usize)>,
        quantum: usize,
        source: Option<&'static Arena>,
        use_qcache: bool,
    ) -> Self {
        assert!(quantum.is_power_of_two());
        const EMPTY: Vec<usize> = Vec::new();
        let arena = Self {
            name,
            quantum,
            use_qcache,
            source,
            inner: SpinLock::new(ArenaInner {
                free: BTreeMap::new(),
                allocated: BTreeMap::new(),
                imported: BTreeMap::new(),
                qcache: [EMPTY; QCACHE_SPANS],
                total: 0,
                used: 0,
            }),
        };
        if let Some((base, size)) = span {
            arena.add_span(base, size);
        }
        arena
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Donate a span of resource to the arena.
    pub fn add_span(&self, base: usize, size: usize) {
        assert!(base % self.quantum == 0 && size % self.quantum == 0 && size > 0);
        let mut inner = self.inner.lock();
        inner.total += size;
        Self::insert_free(&mut inner, base, size);
    }

    fn round(&self, size: usize) -> usize {
        (size + self.quantum - 1) & !(self.quantum - 1)
    }

    /// Insert a free span, coalescing with adjacent neighbours.
    fn insert_free(inner: &mut ArenaInner, mut base: usize, mut size: usize) {
        // Merge with the previous span if it ends at `base`.
        let prev = inner
            .free
            .range(..base)
            .next_back()
            .map(|(&b, &s)| (b, s));
        if let Some((pb, ps)) = prev {
            if pb + ps == base {
                inner.free.remove(&pb);
                base = pb;
                size += ps;
            }
        }
        // Merge with the next span if it starts at `base + size`.
        let next = inner.free.get(&(base + size)).copied();
        if let Some(ns) = next {
            inner.free.remove(&(base + size));
            size += ns;
        }
        inner.free.insert(base, size);
    }

    /// First (lowest-base) free span that can hold `size`.
    fn take_fit(inner: &mut ArenaInner, size: usize) -> Option<usize> {
        let (&base, &span) = inner.free.iter().find(|&(_, &s)| s >= size)?;
        inner.free.remove(&base);
        if span > size {
            inner.free.insert(base + size, span - size);
        }
        Some(base)
    }

    /// Allocate a span of at least `size` resource.
    pub fn alloc(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Status::InvalidArg);
        }
        let size = self.round(size);
        let quanta = size / self.quantum;

        let mut inner = self.inner.lock();
        if self.use_qcache && quanta <= QCACHE_SPANS {
            if let Some(base) = inner.qcache[quanta - 1].pop() {
                inner.allocated.insert(base, size);
                inner.used += size;
                return Ok(base);
            }
        }

        if let Some(base) = Self::take_fit(&mut inner, size) {
            inner.allocated.insert(base, size);
            inner.used += size;
            return Ok(base);
        }

        // Import a span from the source, then retry the fit.
        let Some(source) = self.source else {
            return Err(Status::NoMemory);
        };
        let import = size.max(IMPORT_QUANTA * self.quantum);
        drop(inner);
        let span_base = source.alloc(import)?;
        let mut inner = self.inner.lock();
        inner.total += import;
        inner.imported.insert(span_base, import);
        Self::insert_free(&mut inner, span_base, import);
        match Self::take_fit(&mut inner, size) {
            Some(base) => {
                inner.allocated.insert(base, size);
                inner.used += size;
                Ok(base)
            }
            // Another CPU raced us to the imported span.
            None => Err(Status::NoMemory),
        }
    }

    /// Free a span previously returned by [`alloc`] of the same `size`.
    pub fn free(&self, base: usize, size: usize) {
        let size = self.round(size);
        let quanta = size / self.quantum;
        let mut inner = self.inner.lock();
        match inner.allocated.remove(&base) {
            Some(recorded) if recorded == size => {}
            Some(recorded) => {
                crate::fatal!(
                    "arena {}: free of {:#x} with size {:#x}, allocated {:#x}",
                    self.name,
                    base,
                    size,
                    recorded
                );
            }
            None => {
                crate::fatal!("arena {}: free of unallocated span {:#x}", self.name, base);
            }
        }
        inner.used -= size;
        if self.use_qcache
            && quanta <= QCACHE_SPANS
            && inner.qcache[quanta - 1].len() < QCACHE_DEPTH
        {
            inner.qcache[quanta - 1].push(base);
            return;
        }
        Self::insert_free(&mut inner, base, size);
    }

    /// Return fully-free imported spans to the source arena. Called under
    /// memory pressure. Returns the resource amount handed back.
    pub fn reclaim(&self) -> usize {
        let Some(source) = self.source else {
            return 0;
        };
        let mut reclaimed = 0;

        // Flush the quantum caches first so cached spans can coalesce.
        // `used` was already adjusted when they were freed.
        {
            let mut inner = self.inner.lock();
            for i in 0..QCACHE_SPANS {
                let spans: Vec<usize> = core::mem::take(&mut inner.qcache[i]);
                let size = (i + 1) * self.quantum;
                for base in spans {
                    Self::insert_free(&mut inner, base, size);
                }
            }
        }

        loop {
            let (span_base, span_size) = {
                let mut inner = self.inner.lock();
                let candidate = inner.imported.iter().find_map(|(&ib, &is)| {
                    inner
                        .free
                        .range(..=ib)
                        .next_back()
                        .filter(|&(&fb, &fs)| fb <= ib && fb + fs >= ib + is)
                        .map(|(&fb, &fs)| (ib, is, fb, fs))
                });
                let Some((ib, is, fb, fs)) = candidate else {
                    return reclaimed;
                };
                // Carve the imported span back out of the free map.
                inner.free.remove(&fb);
                if fb < ib {
                    inner.free.insert(fb, ib - fb);
                }
                if fb + fs > ib + is {
                    inner.free.insert(ib + is, (fb + fs) - (ib + is));
                }
                inner.imported.remove(&ib);
                inner.total -= is;
                (ib, is)
            };
            source.free(span_base, span_size);
            reclaimed += span_size;
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        ArenaStats {
            total: inner.total,
            used: inner.used,
        }
    }

    /// Verify that allocated, cached and free spans exactly tile the
    /// arena's spans. Test support.
    #[cfg(test)]
    pub fn check_tiling(&self) -> bool {
        let inner = self.inner.lock();
        let mut covered: usize = inner.free.values().sum();
        covered += inner.allocated.values().sum::<usize>();
        for (i, cache) in inner.qcache.iter().enumerate() {
            covered += cache.len() * (i + 1) * self.quantum;
        }
        covered == inner.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_arena() -> Arena {
        Arena::new("test", Some((0x1000, 0x10000)), 0x1000, None, false)
    }

    #[test]
    fn alloc_free_alloc_reuses_base() {
        let arena = plain_arena();
        let a = arena.alloc(0x3000).unwrap();
        arena.free(a, 0x3000);
        let b = arena.alloc(0x3000).unwrap();
        assert_eq!(a, b);
        arena.free(b, 0x3000);
        assert!(arena.check_tiling());
    }

    #[test]
    fn spans_tile_the_range() {
        let arena = plain_arena();
        let a = arena.alloc(0x2000).unwrap();
        let b = arena.alloc(0x5000).unwrap();
        let c = arena.alloc(0x1000).unwrap();
        assert!(arena.check_tiling());
        arena.free(b, 0x5000);
        assert!(arena.check_tiling());
        arena.free(a, 0x2000);
        arena.free(c, 0x1000);
        assert!(arena.check_tiling());
        assert_eq!(arena.stats().used, 0);
    }

    #[test]
    fn coalescing_allows_full_size_alloc() {
        let arena = plain_arena();
        let total = arena.stats().total;
        let mut spans = Vec::new();
        for _ in 0..16 {
            spans.push(arena.alloc(0x1000).unwrap());
        }
        for span in spans {
            arena.free(span, 0x1000);
        }
        let whole = arena.alloc(total).unwrap();
        assert_eq!(whole, 0x1000);
        arena.free(whole, total);
    }

    #[test]
    fn exhaustion_without_source() {
        let arena = plain_arena();
        assert_eq!(arena.alloc(0x20000), Err(Status::NoMemory));
    }

    #[test]
    fn rounds_to_quantum() {
        let arena = plain_arena();
        let a = arena.alloc(0x800).unwrap();
        let b = arena.alloc(0x800).unwrap();
        assert!(b >= a + 0x1000);
        arena.free(a, 0x800);
        arena.free(b, 0x800);
        assert!(arena.check_tiling());
    }

    #[test]
    fn imports_from_source() {
        static SOURCE: spin::Once<Arena> = spin::Once::new();
        let source =
            SOURCE.call_once(|| Arena::new("source", Some((0x100000, 0x40000)), 0x1000, None, false));
        let child = Arena::new("child", None, 0x1000, Some(source), true);
        let a = child.alloc(0x1000).unwrap();
        assert!(a >= 0x100000);
        assert!(source.stats().used >= 0x1000);
        child.free(a, 0x1000);
        // Reclaim flushes the qcache and hands imported spans back.
        child.reclaim();
        assert_eq!(source.stats().used, 0);
        assert_eq!(child.stats().total, 0);
    }
}
