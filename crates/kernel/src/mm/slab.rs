//! Slab allocator
//!
//! Typed object caches over the kernel virtual-memory layer, with the
//! magazine scheme for CPU locality: each CPU keeps a loaded and a
//! previous magazine of constructed objects and allocation only drops to
//! the mutex-guarded depot (lists of full and empty magazines) when both
//! run dry; the depot refills from slabs as a last resort.
//!
//! Constructors run once when a slab is populated and destructors only
//! when a slab is torn down; objects circulating through magazines stay
//! constructed, which is the point of the scheme.

use super::page::PAGE_SIZE;
use super::phys::AllocFlags;
use crate::smp::MAX_CPUS;
use crate::status::{Result, Status};
use crate::sync::mutex::Locked;
use crate::sync::spinlock::SpinLock;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Objects per magazine.
pub const MAGAZINE_SIZE: usize = 16;

/// Objects larger than this get multi-page slabs and out-of-line
/// metadata keyed by object address.
const SMALL_OBJ_LIMIT: usize = PAGE_SIZE / 8;

/// Constructor hook: receives the object and the cache's context
/// pointer. Runs once per object when its slab is populated.
pub type ObjectCtor = fn(obj: *mut u8, data: *mut ());

/// Destructor hook; runs only at slab teardown.
pub type ObjectDtor = fn(obj: *mut u8, data: *mut ());

bitflags::bitflags! {
    /// Cache-creation behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Bypass the per-CPU magazine layer: every allocation and free
        /// goes straight to the slab lists. For caches whose objects
        /// must not linger in magazines across CPUs.
        const NO_MAGAZINES = 1 << 0;
    }
}

/// A fixed-capacity stack of constructed objects.
pub struct Magazine {
    objs: [*mut u8; MAGAZINE_SIZE],
    count: usize,
}

unsafe impl Send for Magazine {}

impl Magazine {
    const fn new() -> Self {
        Self {
            objs: [core::ptr::null_mut(); MAGAZINE_SIZE],
            count: 0,
        }
    }

    fn push(&mut self, obj: *mut u8) -> bool {
        if self.count == MAGAZINE_SIZE {
            return false;
        }
        self.objs[self.count] = obj;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<*mut u8> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(self.objs[self.count])
    }

    fn is_full(&self) -> bool {
        self.count == MAGAZINE_SIZE
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Per-CPU magazine pair.
struct CpuCache {
    loaded: Magazine,
    previous: Magazine,
}

impl CpuCache {
    const fn new() -> Self {
        Self {
            loaded: Magazine::new(),
            previous: Magazine::new(),
        }
    }
}

/// One contiguous allocation carved into objects.
struct Slab {
    nobjs: usize,
    /// Free object indices within the slab.
    free: Vec<u32>,
    inuse: usize,
}

struct Depot {
    full: Vec<Magazine>,
    empty: Vec<Magazine>,
    /// Slabs keyed by base address.
    slabs: BTreeMap<usize, Slab>,
    /// Object address → slab base, for large-object caches where the
    /// base is not derivable from the object address.
    large_meta: BTreeMap<usize, usize>,
}

pub struct SlabCache {
    name: &'static str,
    obj_size: usize,
    slab_size: usize,
    objs_per_slab: usize,
    large: bool,
    flags: CacheFlags,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    /// Opaque context handed to every ctor/dtor invocation.
    data: *mut (),
    /// Allocation behaviour for the cache's own slab and metadata
    /// allocations; per-call flags are OR'd on top.
    mmflag: AllocFlags,
    depot: Locked<Depot>,
    cpu_caches: [SpinLock<CpuCache>; MAX_CPUS],
    /// Objects currently handed out to callers.
    outstanding: AtomicUsize,
}

// SAFETY: the context pointer is opaque to the cache; whoever creates a
// cache with a non-null `data` guarantees the referent is valid for the
// cache's lifetime and safe to use from any CPU, which is the ctor/dtor
// contract.
unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

#[derive(Debug, Clone, Copy)]
pub struct SlabStats {
    pub outstanding: usize,
    pub slabs: usize,
    pub full_magazines: usize,
    pub empty_magazines: usize,
}

impl SlabCache {
    /// Create and register a cache. `size` and `align` are validated;
    /// objects are served `size` rounded up to `align`. `data` is passed
    /// to every `ctor`/`dtor` invocation; `flags` select cache
    /// behaviour and `mmflag` governs the cache's own slab and metadata
    /// allocations (per-call allocation flags are OR'd on top).
    pub fn create(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
        data: *mut (),
        flags: CacheFlags,
        mmflag: AllocFlags,
    ) -> Result<&'static SlabCache> {
        if size == 0 || size > 16 * PAGE_SIZE {
            return Err(Status::InvalidArg);
        }
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(Status::InvalidArg);
        }
        if !data.is_null() && ctor.is_none() && dtor.is_none() {
            // Context with nobody to receive it is a caller mistake.
            return Err(Status::InvalidArg);
        }
        let obj_size = (size.max(align) + align - 1) & !(align - 1);
        let (slab_size, large) = if obj_size <= SMALL_OBJ_LIMIT {
            (PAGE_SIZE, false)
        } else {
            // Multi-page slab holding at least four objects.
            let bytes = obj_size * 4;
            ((bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1), true)
        };
        let objs_per_slab = slab_size / obj_size;

        const CPU_CACHE: SpinLock<CpuCache> = SpinLock::new(CpuCache::new());
        let cache = alloc::boxed::Box::leak(alloc::boxed::Box::new(SlabCache {
            name,
            obj_size,
            slab_size,
            objs_per_slab,
            large,
            flags,
            ctor,
            dtor,
            data,
            mmflag,
            depot: Locked::new("slab-depot", Depot {
                full: Vec::new(),
                empty: Vec::new(),
                slabs: BTreeMap::new(),
                large_meta: BTreeMap::new(),
            }),
            cpu_caches: [CPU_CACHE; MAX_CPUS],
            outstanding: AtomicUsize::new(0),
        }));
        CACHES.lock().push(cache);
        crate::debug!(
            "slab: cache {} (obj {} bytes, {} per {}-byte slab)",
            name,
            obj_size,
            objs_per_slab,
            slab_size
        );
        Ok(cache)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.obj_size
    }

    /// Allocate a constructed object.
    pub fn alloc(&self, flags: AllocFlags) -> Result<*mut u8> {
        self.alloc_on(crate::arch::cpu_id(), flags)
    }

    /// Allocation pinned to one CPU's magazine pair.
    pub fn alloc_on(&self, cpu: usize, flags: AllocFlags) -> Result<*mut u8> {
        let cpu = cpu % MAX_CPUS;
        if self.flags.contains(CacheFlags::NO_MAGAZINES) {
            let obj = self.slab_alloc(flags)?;
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            return Ok(obj);
        }
        loop {
            {
                let mut cc = self.cpu_caches[cpu].lock_irq();
                if let Some(obj) = cc.loaded.pop() {
                    self.outstanding.fetch_add(1, Ordering::AcqRel);
                    return Ok(obj);
                }
                // Loaded is dry: swap with previous and retry.
                let cc = &mut *cc;
                core::mem::swap(&mut cc.loaded, &mut cc.previous);
                if let Some(obj) = cc.loaded.pop() {
                    self.outstanding.fetch_add(1, Ordering::AcqRel);
                    return Ok(obj);
                }
            }

            // Both magazines dry: try a full magazine from the depot.
            let refill = {
                let mut depot = self.depot.lock();
                depot.full.pop()
            };
            match refill {
                Some(mag) => {
                    enum Outcome {
                        Displaced(Magazine),
                        Raced(Magazine),
                    }
                    let outcome = {
                        let mut cc = self.cpu_caches[cpu].lock_irq();
                        if cc.loaded.is_empty() {
                            let displaced =
                                core::mem::replace(&mut cc.previous, Magazine::new());
                            cc.loaded = mag;
                            Outcome::Displaced(displaced)
                        } else {
                            // Raced with a free that restocked us; put
                            // the magazine back and retry the fast path.
                            Outcome::Raced(mag)
                        }
                    };
                    let mut depot = self.depot.lock();
                    match outcome {
                        Outcome::Displaced(mag) => depot.empty.push(mag),
                        Outcome::Raced(mag) => depot.full.push(mag),
                    }
                    continue;
                }
                None => {
                    // Depot dry too: carve from a slab.
                    let obj = self.slab_alloc(flags)?;
                    self.outstanding.fetch_add(1, Ordering::AcqRel);
                    return Ok(obj);
                }
            }
        }
    }

    /// Return an object. It goes back to a magazine still constructed;
    /// the destructor only runs at slab teardown.
    pub fn free(&self, obj: *mut u8) {
        self.free_on(crate::arch::cpu_id(), obj)
    }

    pub fn free_on(&self, cpu: usize, obj: *mut u8) {
        let cpu = cpu % MAX_CPUS;
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.flags.contains(CacheFlags::NO_MAGAZINES) {
            let mut depot = self.depot.lock();
            self.return_to_slab(&mut *depot, obj);
            return;
        }
        loop {
            let overflow = {
                let mut cc = self.cpu_caches[cpu].lock_irq();
                if cc.loaded.push(obj) {
                    return;
                }
                let cc = &mut *cc;
                core::mem::swap(&mut cc.loaded, &mut cc.previous);
                if cc.loaded.push(obj) {
                    return;
                }
                // Both full: hand one to the depot and retry.
                core::mem::replace(&mut cc.previous, Magazine::new())
            };
            let mut depot = self.depot.lock();
            depot.full.push(overflow);
        }
    }

    /// Take an object straight from a slab, creating one if needed.
    fn slab_alloc(&self, flags: AllocFlags) -> Result<*mut u8> {
        let mut depot = self.depot.lock();
        let found = depot
            .slabs
            .iter()
            .find(|(_, slab)| !slab.free.is_empty())
            .map(|(&base, _)| base);
        let base = match found {
            Some(base) => base,
            None => self.grow(&mut *depot, flags)?,
        };
        let slab = match depot.slabs.get_mut(&base) {
            Some(slab) => slab,
            None => crate::fatal!("slab {}: grown slab vanished", self.name),
        };
        let idx = match slab.free.pop() {
            Some(idx) => idx,
            None => crate::fatal!("slab {}: chosen slab has no free object", self.name),
        };
        slab.inuse += 1;
        Ok((base + idx as usize * self.obj_size) as *mut u8)
    }

    /// Allocate and construct a new slab.
    fn grow(&self, depot: &mut Depot, flags: AllocFlags) -> Result<usize> {
        let mem = super::kvmem::alloc(self.slab_size, flags | self.mmflag)?;
        let base = mem as usize;
        let mut free = Vec::with_capacity(self.objs_per_slab);
        for i in (0..self.objs_per_slab).rev() {
            free.push(i as u32);
        }
        if let Some(ctor) = self.ctor {
            for i in 0..self.objs_per_slab {
                ctor((base + i * self.obj_size) as *mut u8, self.data);
            }
        }
        if self.large {
            for i in 0..self.objs_per_slab {
                depot.large_meta.insert(base + i * self.obj_size, base);
            }
        }
        depot.slabs.insert(
            base,
            Slab {
                nobjs: self.objs_per_slab,
                free,
                inuse: 0,
            },
        );
        Ok(base)
    }

    /// Slab base owning `obj`: page base for small caches, out-of-line
    /// metadata for large ones.
    fn slab_base_of(&self, depot: &Depot, obj: usize) -> Option<usize> {
        if self.large {
            depot.large_meta.get(&obj).copied()
        } else {
            Some(obj & !(PAGE_SIZE - 1))
        }
    }

    fn return_to_slab(&self, depot: &mut Depot, obj: *mut u8) {
        let addr = obj as usize;
        let Some(base) = self.slab_base_of(depot, addr) else {
            crate::fatal!("slab {}: free of foreign pointer {:p}", self.name, obj);
        };
        let Some(slab) = depot.slabs.get_mut(&base) else {
            crate::fatal!("slab {}: free of foreign pointer {:p}", self.name, obj);
        };
        let idx = ((addr - base) / self.obj_size) as u32;
        slab.free.push(idx);
        slab.inuse -= 1;
    }

    /// Release cached memory: drain depot magazines back to their slabs
    /// and free slabs with no object in use (running destructors).
    /// Returns bytes released.
    pub fn reclaim(&self) -> usize {
        let mut depot = self.depot.lock();
        let full: Vec<Magazine> = core::mem::take(&mut depot.full);
        for mut mag in full {
            while let Some(obj) = mag.pop() {
                self.return_to_slab(&mut *depot, obj);
            }
        }
        depot.empty.clear();

        let idle: Vec<usize> = depot
            .slabs
            .iter()
            .filter(|(_, slab)| slab.inuse == 0 && slab.free.len() == slab.nobjs)
            .map(|(&base, _)| base)
            .collect();
        let mut released = 0;
        for base in idle {
            depot.slabs.remove(&base);
            if let Some(dtor) = self.dtor {
                for i in 0..self.objs_per_slab {
                    dtor((base + i * self.obj_size) as *mut u8, self.data);
                }
            }
            if self.large {
                for i in 0..self.objs_per_slab {
                    depot.large_meta.remove(&(base + i * self.obj_size));
                }
            }
            super::kvmem::free(base as *mut u8, self.slab_size);
            released += self.slab_size;
        }
        released
    }

    /// Tear the cache down. Fails with InUse while any object is still
    /// handed out.
    pub fn destroy(&'static self) -> Result<()> {
        if self.outstanding.load(Ordering::Acquire) != 0 {
            return Err(Status::InUse);
        }
        // Drain the CPU magazines, then let reclaim free everything.
        for cpu in 0..MAX_CPUS {
            let (mut loaded, mut previous) = {
                let mut cc = self.cpu_caches[cpu].lock_irq();
                (
                    core::mem::replace(&mut cc.loaded, Magazine::new()),
                    core::mem::replace(&mut cc.previous, Magazine::new()),
                )
            };
            let mut depot = self.depot.lock();
            while let Some(obj) = loaded.pop() {
                self.return_to_slab(&mut *depot, obj);
            }
            while let Some(obj) = previous.pop() {
                self.return_to_slab(&mut *depot, obj);
            }
        }
        self.reclaim();
        CACHES.lock().retain(|c| !core::ptr::eq(*c, self));
        Ok(())
    }

    pub fn stats(&self) -> SlabStats {
        let depot = self.depot.lock();
        SlabStats {
            outstanding: self.outstanding.load(Ordering::Acquire),
            slabs: depot.slabs.len(),
            full_magazines: depot.full.len(),
            empty_magazines: depot.empty.len(),
        }
    }
}

/// Registered caches, for the low-resource shrink pass.
static CACHES: SpinLock<Vec<&'static SlabCache>> = SpinLock::new(Vec::new());

pub fn init() {
    crate::info!("slab: magazine layer online ({} objs/magazine)", MAGAZINE_SIZE);
}

/// Shrink every registered cache; returns total bytes released.
pub fn reclaim_all() -> usize {
    let caches: Vec<&'static SlabCache> = CACHES.lock().clone();
    caches.iter().map(|c| c.reclaim()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    static CTOR_RUNS: AtomicU32 = AtomicU32::new(0);
    static DTOR_RUNS: AtomicU32 = AtomicU32::new(0);

    fn counting_ctor(obj: *mut u8, _data: *mut ()) {
        CTOR_RUNS.fetch_add(1, Ordering::SeqCst);
        unsafe {
            core::ptr::write_bytes(obj, 0xCC, 8);
        }
    }

    fn counting_dtor(_obj: *mut u8, _data: *mut ()) {
        DTOR_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    /// Plain cache: no hooks, no context, default behaviour.
    fn plain_cache(name: &'static str, size: usize, align: usize) -> &'static SlabCache {
        SlabCache::create(
            name,
            size,
            align,
            None,
            None,
            core::ptr::null_mut(),
            CacheFlags::empty(),
            AllocFlags::empty(),
        )
        .unwrap()
    }

    #[test]
    fn round_trip_may_reuse_object() {
        crate::testing::init_kernel();
        let cache = plain_cache("rt-test", 64, 8);
        let a = cache.alloc_on(0, AllocFlags::empty()).unwrap();
        cache.free_on(0, a);
        let b = cache.alloc_on(0, AllocFlags::empty()).unwrap();
        // LIFO through the loaded magazine: the same object comes back.
        assert_eq!(a, b);
        cache.free_on(0, b);
        assert_eq!(cache.stats().outstanding, 0);
        cache.destroy().unwrap();
    }

    #[test]
    fn ctor_runs_once_per_lifetime_dtor_on_teardown() {
        crate::testing::init_kernel();
        CTOR_RUNS.store(0, Ordering::SeqCst);
        DTOR_RUNS.store(0, Ordering::SeqCst);
        let cache = SlabCache::create(
            "ctor-test",
            128,
            8,
            Some(counting_ctor),
            Some(counting_dtor),
            core::ptr::null_mut(),
            CacheFlags::empty(),
            AllocFlags::empty(),
        )
        .unwrap();
        let a = cache.alloc_on(1, AllocFlags::empty()).unwrap();
        let objs_per_slab = cache.objs_per_slab;
        // Slab population constructed every object exactly once.
        assert_eq!(CTOR_RUNS.load(Ordering::SeqCst) as usize, objs_per_slab);
        cache.free_on(1, a);
        let b = cache.alloc_on(1, AllocFlags::empty()).unwrap();
        assert_eq!(a, b);
        // Recycling through the magazine constructed nothing new.
        assert_eq!(CTOR_RUNS.load(Ordering::SeqCst) as usize, objs_per_slab);
        assert_eq!(DTOR_RUNS.load(Ordering::SeqCst), 0);
        cache.free_on(1, b);
        cache.destroy().unwrap();
        // Teardown destroyed every object.
        assert_eq!(DTOR_RUNS.load(Ordering::SeqCst) as usize, objs_per_slab);
    }

    #[test]
    fn magazine_overflow_reaches_depot() {
        crate::testing::init_kernel();
        let cache = plain_cache("depot-test", 32, 8);
        let mut objs = Vec::new();
        // More than two magazines' worth forces depot traffic on free.
        for _ in 0..(3 * MAGAZINE_SIZE) {
            objs.push(cache.alloc_on(2, AllocFlags::empty()).unwrap());
        }
        for obj in objs.drain(..) {
            cache.free_on(2, obj);
        }
        assert!(cache.stats().full_magazines >= 1);
        assert_eq!(cache.stats().outstanding, 0);
        cache.destroy().unwrap();
    }

    #[test]
    fn destroy_fails_with_outstanding_objects() {
        crate::testing::init_kernel();
        let cache = plain_cache("busy-test", 64, 8);
        let obj = cache.alloc_on(3, AllocFlags::empty()).unwrap();
        assert_eq!(cache.destroy(), Err(Status::InUse));
        cache.free_on(3, obj);
        cache.destroy().unwrap();
    }

    #[test]
    fn large_objects_use_out_of_line_metadata() {
        crate::testing::init_kernel();
        let cache = plain_cache("large-test", 2048, 64);
        assert!(cache.large);
        let a = cache.alloc_on(4, AllocFlags::empty()).unwrap();
        let b = cache.alloc_on(4, AllocFlags::empty()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a as usize % 64, 0);
        cache.free_on(4, a);
        cache.free_on(4, b);
        // Reclaim after draining leaves nothing cached.
        cache.destroy().unwrap();
    }

    #[test]
    fn create_validates_arguments() {
        crate::testing::init_kernel();
        assert_eq!(
            SlabCache::create(
                "bad-size",
                0,
                8,
                None,
                None,
                core::ptr::null_mut(),
                CacheFlags::empty(),
                AllocFlags::empty(),
            )
            .err(),
            Some(Status::InvalidArg)
        );
        assert_eq!(
            SlabCache::create(
                "bad-align",
                64,
                3,
                None,
                None,
                core::ptr::null_mut(),
                CacheFlags::empty(),
                AllocFlags::empty(),
            )
            .err(),
            Some(Status::InvalidArg)
        );
        // Context without any hook to receive it is rejected.
        let mut word = 0u32;
        assert_eq!(
            SlabCache::create(
                "bad-data",
                64,
                8,
                None,
                None,
                &mut word as *mut u32 as *mut (),
                CacheFlags::empty(),
                AllocFlags::empty(),
            )
            .err(),
            Some(Status::InvalidArg)
        );
    }

    static CTX_CTOR_RUNS: AtomicU32 = AtomicU32::new(0);

    fn context_ctor(obj: *mut u8, data: *mut ()) {
        // The context is the cache's fill byte.
        let fill = unsafe { (data as *const AtomicU32).as_ref() }
            .map(|v| v.load(Ordering::SeqCst) as u8)
            .unwrap_or(0);
        unsafe {
            core::ptr::write_bytes(obj, fill, 8);
        }
        CTX_CTOR_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn ctor_receives_cache_context() {
        crate::testing::init_kernel();
        static FILL: AtomicU32 = AtomicU32::new(0x5E);
        CTX_CTOR_RUNS.store(0, Ordering::SeqCst);
        let cache = SlabCache::create(
            "ctx-test",
            64,
            8,
            Some(context_ctor),
            None,
            &FILL as *const AtomicU32 as *mut (),
            CacheFlags::empty(),
            AllocFlags::empty(),
        )
        .unwrap();
        let obj = cache.alloc_on(6, AllocFlags::empty()).unwrap();
        // The constructor saw the context and stamped the object.
        assert!(CTX_CTOR_RUNS.load(Ordering::SeqCst) > 0);
        assert_eq!(unsafe { *obj }, 0x5E);
        cache.free_on(6, obj);
        cache.destroy().unwrap();
    }

    #[test]
    fn no_magazines_cache_bypasses_cpu_layer() {
        crate::testing::init_kernel();
        let cache = SlabCache::create(
            "nomag-test",
            64,
            8,
            None,
            None,
            core::ptr::null_mut(),
            CacheFlags::NO_MAGAZINES,
            AllocFlags::empty(),
        )
        .unwrap();
        let a = cache.alloc_on(7, AllocFlags::empty()).unwrap();
        cache.free_on(7, a);
        // The free went straight back to the slab, not into a magazine.
        assert_eq!(cache.stats().full_magazines, 0);
        assert_eq!(cache.stats().empty_magazines, 0);
        let b = cache.alloc_on(7, AllocFlags::empty()).unwrap();
        // Slab free list is LIFO: the same object comes back.
        assert_eq!(a, b);
        cache.free_on(7, b);
        cache.destroy().unwrap();
    }
}
