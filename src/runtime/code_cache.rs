// Code cache management. A code cache is a fixed address range: method bodies are carved from
// its bottom upwards and helper trampolines from its top downwards, so a trampoline always
// lies inside the same range as the code that calls it. When a call site cannot reach a
// helper directly, the snippet asks for the helper's trampoline in the cache that contains
// the call site. Trampolines are created lazily, at most once per (cache, helper), under the
// cache's write lock; concurrent compilations that race on the same helper observe the same
// address. The encoded trampoline bytes are kept in a per-cache image so tools and tests can
// inspect what a trampoline jumps to.

//! Code cache manager and helper trampolines.

use super::helpers::{HelperId, HelperTable};
use crate::codegen::code_buffer::align_up;
use crate::core::error::{CompileError, CompileResult};
use crate::target::ArchitectureEncoder;
use hashbrown::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Allocation of code memory and helper trampolines.
pub trait CodeCacheManager: Send + Sync {
    /// Reserve `length` bytes of code memory aligned to `alignment`; returns its base.
    fn reserve_code(&self, length: u32, alignment: u32) -> CompileResult<u64>;

    /// Trampoline for `helper` reachable from `from`, or `None` if none can be provided.
    fn find_helper_trampoline(&self, helper: HelperId, from: u64) -> Option<u64>;
}

#[derive(Debug)]
struct Regions {
    /// Next free code byte.
    warm_top: u64,
    /// Lowest trampoline slot handed out.
    trampoline_base: u64,
}

#[derive(Debug)]
struct CodeCache {
    base: u64,
    end: u64,
    regions: Mutex<Regions>,
    trampolines: RwLock<HashMap<HelperId, u64>>,
    /// Trampoline address to encoded bytes.
    images: Mutex<HashMap<u64, Vec<u8>>>,
}

impl CodeCache {
    fn contains(&self, address: u64) -> bool {
        (self.base..self.end).contains(&address)
    }
}

/// Default code cache manager over a list of address ranges.
pub struct CodeCaches {
    target: Arc<dyn ArchitectureEncoder>,
    helpers: Arc<HelperTable>,
    caches: RwLock<Vec<Arc<CodeCache>>>,
}

impl CodeCaches {
    pub fn new(target: Arc<dyn ArchitectureEncoder>, helpers: Arc<HelperTable>) -> Self {
        Self {
            target,
            helpers,
            caches: RwLock::new(Vec::new()),
        }
    }

    /// Add a cache covering `[base, base + size)`; returns its index.
    pub fn add_cache(&self, base: u64, size: u64) -> usize {
        let cache = Arc::new(CodeCache {
            base,
            end: base + size,
            regions: Mutex::new(Regions {
                warm_top: base,
                trampoline_base: base + size,
            }),
            trampolines: RwLock::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        });
        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        caches.push(cache);
        log::debug!("Code cache {} at {base:#x}..{:#x}", caches.len() - 1, base + size);
        caches.len() - 1
    }

    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }

    fn cache_for(&self, address: u64) -> Option<Arc<CodeCache>> {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        caches.iter().find(|c| c.contains(address)).cloned()
    }

    /// Number of trampolines created in the cache containing `address`.
    pub fn trampoline_count(&self, address: u64) -> usize {
        self.cache_for(address)
            .map(|c| c.trampolines.read().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    /// Encoded bytes of the trampoline at `address`.
    pub fn trampoline_bytes(&self, address: u64) -> Option<Vec<u8>> {
        let cache = self.cache_for(address)?;
        let images = cache.images.lock().unwrap_or_else(|e| e.into_inner());
        images.get(&address).cloned()
    }

    fn create_trampoline(&self, cache: &CodeCache, helper: HelperId) -> Option<u64> {
        let helper_address = self.helpers.address(helper)?;
        let mut table = cache.trampolines.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&existing) = table.get(&helper) {
            return Some(existing);
        }

        let size = self.target.trampoline_size() as u64;
        let slot = {
            let mut regions = cache.regions.lock().unwrap_or_else(|e| e.into_inner());
            match regions.trampoline_base.checked_sub(size).map(|top| top & !7) {
                Some(slot) if slot >= regions.warm_top => {
                    regions.trampoline_base = slot;
                    slot
                }
                _ => {
                    log::warn!("No room for a {helper} trampoline in cache at {:#x}", cache.base);
                    return None;
                }
            }
        };

        let mut bytes = Vec::with_capacity(size as usize);
        if let Err(e) = self.target.encode_trampoline(slot, helper_address, &mut bytes) {
            log::warn!("Cannot encode {helper} trampoline at {slot:#x}: {e}");
            return None;
        }
        cache
            .images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot, bytes);
        table.insert(helper, slot);
        log::debug!(
            "Created trampoline for {} at {slot:#x}",
            self.helpers.name(helper).unwrap_or("?")
        );
        Some(slot)
    }
}

impl CodeCacheManager for CodeCaches {
    fn reserve_code(&self, length: u32, alignment: u32) -> CompileResult<u64> {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        let alignment = alignment.max(1) as u64;
        for cache in caches.iter() {
            let mut regions = cache.regions.lock().unwrap_or_else(|e| e.into_inner());
            let base = align_up(regions.warm_top, alignment);
            if base + length as u64 <= regions.trampoline_base {
                regions.warm_top = base + length as u64;
                return Ok(base);
            }
        }
        Err(CompileError::CodeCacheExhausted { requested: length })
    }

    fn find_helper_trampoline(&self, helper: HelperId, from: u64) -> Option<u64> {
        let cache = self.cache_for(from)?;
        let existing = cache
            .trampolines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&helper)
            .copied();
        existing.or_else(|| self.create_trampoline(&cache, helper))
    }
}
