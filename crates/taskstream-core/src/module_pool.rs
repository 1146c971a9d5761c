//! Chunked, reference-counted pool allocator for loaded kernel modules.
//!
//! Module slots are grouped into fixed-size pools. Lookup and lazy creation
//! touch only the owning pool's mutex, so independent pools can be
//! populated and reclaimed concurrently. Physical reclamation happens in
//! whole-pool units: a pool is freed only when every slot is vacant or
//! unreferenced, and the sweep keeps an isolation window behind the most
//! recently used pool so a concurrent lookup never races a reclaim.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Identity of a pool-managed kernel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ModuleId(pub u64);

impl ModuleId {
    /// Create a module id.
    pub const fn new(id: u64) -> Self {
        ModuleId(id)
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "module-{}", self.0)
    }
}

/// A live slot: device handle plus reference count.
#[derive(Debug, Clone, Copy)]
struct PooledModule {
    handle: u64,
    refs: u64,
}

/// One chunk of module slots guarded by its own mutex.
struct ModulePool {
    slots: Mutex<Vec<Option<PooledModule>>>,
}

impl ModulePool {
    fn new(chunk_size: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; chunk_size]),
        }
    }
}

/// Statistics snapshot for the module table.
#[derive(Debug, Clone, Default)]
pub struct ModuleTableStats {
    /// Number of pools currently allocated.
    pub pools: usize,
    /// Live (loaded) modules across all pools.
    pub live_modules: usize,
    /// Whole pools reclaimed so far.
    pub pools_reclaimed: u64,
}

/// The module pool allocator.
pub struct ModuleTable {
    chunk_size: usize,
    isolation_width: usize,
    pools: RwLock<Vec<Arc<ModulePool>>>,
    /// Index of the most recently used pool; the sweep never reclaims it or
    /// anything inside the isolation window behind it.
    mru_pool: AtomicUsize,
    next_id: AtomicU64,
    pools_reclaimed: AtomicU64,
}

impl ModuleTable {
    /// Create a table with `chunk_size` slots per pool and the given
    /// reclamation isolation window.
    pub fn new(chunk_size: usize, isolation_width: usize) -> Self {
        Self {
            chunk_size,
            isolation_width,
            pools: RwLock::new(Vec::new()),
            mru_pool: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            pools_reclaimed: AtomicU64::new(0),
        }
    }

    /// Reserve the next module id.
    pub fn allocate_id(&self) -> ModuleId {
        ModuleId::new(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    fn locate(&self, id: ModuleId) -> (usize, usize) {
        let index = id.0 as usize;
        (index / self.chunk_size, index % self.chunk_size)
    }

    fn pool(&self, pool_index: usize) -> Arc<ModulePool> {
        {
            let pools = self.pools.read();
            if let Some(pool) = pools.get(pool_index) {
                return Arc::clone(pool);
            }
        }
        let mut pools = self.pools.write();
        while pools.len() <= pool_index {
            pools.push(Arc::new(ModulePool::new(self.chunk_size)));
        }
        Arc::clone(&pools[pool_index])
    }

    /// Return the device handle for `id`, loading it through `loader` if
    /// the slot is vacant, and take a reference on the slot.
    ///
    /// The loader runs under the owning pool's mutex only; other pools
    /// remain fully concurrent.
    pub fn get_or_create<F>(&self, id: ModuleId, loader: F) -> Result<u64>
    where
        F: FnOnce() -> Result<u64>,
    {
        let (pool_index, slot_index) = self.locate(id);
        let pool = self.pool(pool_index);
        self.mru_pool.store(pool_index, Ordering::Release);

        let mut slots = pool.slots.lock();
        match &mut slots[slot_index] {
            Some(module) => {
                module.refs += 1;
                Ok(module.handle)
            }
            vacant => {
                let handle = loader()?;
                *vacant = Some(PooledModule { handle, refs: 1 });
                debug!(module = %id, handle, pool = pool_index, "loaded module");
                Ok(handle)
            }
        }
    }

    /// Drop one reference on `id`. Never frees; physical reclamation goes
    /// through [`try_recycle_pool`](Self::try_recycle_pool).
    pub fn release(&self, id: ModuleId) -> Result<()> {
        let (pool_index, slot_index) = self.locate(id);
        let pools = self.pools.read();
        let pool = pools
            .get(pool_index)
            .ok_or(RuntimeError::ModuleNotFound(id))?;
        let mut slots = pool.slots.lock();
        match &mut slots[slot_index] {
            Some(module) => {
                module.refs = module.refs.saturating_sub(1);
                Ok(())
            }
            None => Err(RuntimeError::ModuleNotFound(id)),
        }
    }

    /// True if any slot in the pool is live and referenced.
    pub fn pool_referenced(&self, pool_index: usize) -> bool {
        let pools = self.pools.read();
        match pools.get(pool_index) {
            Some(pool) => pool
                .slots
                .lock()
                .iter()
                .any(|slot| matches!(slot, Some(m) if m.refs > 0)),
            None => false,
        }
    }

    /// Attempt to reclaim one whole pool.
    ///
    /// Frees every slot (unloading each live handle through `unloader`) and
    /// returns `true` only if no slot was referenced; otherwise leaves the
    /// pool untouched and returns `false`.
    pub fn try_recycle_pool<F>(&self, pool_index: usize, unloader: F) -> Result<bool>
    where
        F: Fn(u64) -> Result<()>,
    {
        let pool = {
            let pools = self.pools.read();
            match pools.get(pool_index) {
                Some(pool) => Arc::clone(pool),
                None => return Ok(false),
            }
        };

        let mut slots = pool.slots.lock();
        if slots
            .iter()
            .any(|slot| matches!(slot, Some(m) if m.refs > 0))
        {
            return Ok(false);
        }

        let mut freed = 0usize;
        for slot in slots.iter_mut() {
            if let Some(module) = slot.take() {
                unloader(module.handle)?;
                freed += 1;
            }
        }
        if freed > 0 {
            self.pools_reclaimed.fetch_add(1, Ordering::Relaxed);
            debug!(pool = pool_index, freed, "reclaimed module pool");
        }
        Ok(freed > 0)
    }

    /// Opportunistic reclamation sweep.
    ///
    /// Walks every pool at least `isolation_width` behind the most recently
    /// used pool, skipping the active pool itself. Pool-level failures are
    /// returned to the caller immediately.
    pub fn recycle_sweep<F>(&self, unloader: F) -> Result<usize>
    where
        F: Fn(u64) -> Result<()>,
    {
        let mru = self.mru_pool.load(Ordering::Acquire);
        let pool_count = self.pools.read().len();
        let mut reclaimed = 0usize;
        for index in 0..pool_count {
            if index == mru || index + self.isolation_width > mru {
                continue;
            }
            if self.try_recycle_pool(index, &unloader)? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ModuleTableStats {
        let pools = self.pools.read();
        let live = pools
            .iter()
            .map(|pool| pool.slots.lock().iter().filter(|s| s.is_some()).count())
            .sum();
        ModuleTableStats {
            pools: pools.len(),
            live_modules: live,
            pools_reclaimed: self.pools_reclaimed.load(Ordering::Relaxed),
        }
    }
}
