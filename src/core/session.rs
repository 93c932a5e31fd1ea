// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns nothing but a borrowed Bump arena and the bookkeeping that must live
// exactly as long as one compilation: interned strings (helper and snippet names shown in
// dumps), the name of the method being compiled, and SessionStats. Code bytes and constant
// pool payloads are carved out of the same arena by the code generator, so tearing the arena
// down after a successful or failed compilation releases every buffer at once. SessionStats
// gathers the per-phase timing and memory profiles recorded by the phase driver together with
// emission counters (code size, snippets, trampolines, relocations, external groups) and
// renders them through Display for the end-of-compilation summary.

//! Arena-based compilation session management.
//!
//! All per-compilation buffers are tied to the session arena, so a compilation
//! that fails half way releases its memory with the arena.

use crate::codegen::phase::Phase;
use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for tracing and tuning.
    stats: RefCell<SessionStats>,

    /// String interning for names shown in dumps.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Method being compiled.
    current_method: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_method: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T>(&self, slice: &[T]) -> &'arena [T]
    where
        T: Copy,
    {
        self.arena.alloc_slice_copy(slice)
    }

    /// Allocate a zero-filled byte region, used for code buffers.
    pub fn alloc_zeroed_bytes(&self, len: usize) -> &'arena mut [u8] {
        self.arena.alloc_slice_fill_copy(len, 0u8)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Set the method being compiled.
    pub fn set_current_method(&self, name: &str) {
        let name = self.intern_str(name);
        *self.current_method.borrow_mut() = Some(name);
    }

    pub fn current_method(&self) -> Option<&'arena str> {
        *self.current_method.borrow()
    }

    /// Bytes currently allocated from the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Record the profile of a finished phase.
    pub fn record_phase(&self, profile: PhaseProfile) {
        let mut stats = self.stats.borrow_mut();
        stats.phases_run += 1;
        stats.phase_profiles.push(profile);
    }

    /// Record the final code length of the method.
    pub fn record_code_size(&self, estimated: u32, actual: u32, snippet_bytes: u32) {
        let mut stats = self.stats.borrow_mut();
        stats.estimated_code_size = estimated;
        stats.code_size = actual;
        stats.snippet_code_size = snippet_bytes;
    }

    pub fn record_snippet_emitted(&self) {
        self.stats.borrow_mut().snippets_emitted += 1;
    }

    pub fn record_trampoline_used(&self) {
        self.stats.borrow_mut().trampolines_used += 1;
    }

    pub fn record_relocations_applied(&self, count: usize) {
        self.stats.borrow_mut().relocations_applied += count;
    }

    pub fn record_external_groups(&self, groups: usize, sites: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.external_groups = groups;
        stats.external_sites = sites;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Timing and memory profile of one phase.
#[derive(Debug, Clone)]
pub struct PhaseProfile {
    pub phase: Phase,
    pub elapsed: Duration,
    /// Bytes allocated from the phase's transient region.
    pub transient_bytes: usize,
    /// Growth of the session arena during the phase.
    pub arena_growth: usize,
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of phases performed.
    pub phases_run: usize,

    /// Profile per performed phase, in order.
    pub phase_profiles: Vec<PhaseProfile>,

    /// Estimated code length (bytes).
    pub estimated_code_size: u32,

    /// Final code length (bytes).
    pub code_size: u32,

    /// Bytes consumed by snippets.
    pub snippet_code_size: u32,

    /// Snippets emitted.
    pub snippets_emitted: usize,

    /// Helper calls routed through a trampoline.
    pub trampolines_used: usize,

    /// Relocations applied to the code buffer or to a group.
    pub relocations_applied: usize,

    /// Iterated external relocation groups.
    pub external_groups: usize,

    /// Sites across all groups.
    pub external_sites: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Phases run: {}", self.phases_run)?;
        writeln!(
            f,
            "  Code size: {} bytes (estimated {})",
            self.code_size, self.estimated_code_size
        )?;
        writeln!(f, "  Snippet code: {} bytes", self.snippet_code_size)?;
        writeln!(f, "  Snippets emitted: {}", self.snippets_emitted)?;
        writeln!(f, "  Trampolines used: {}", self.trampolines_used)?;
        writeln!(f, "  Relocations applied: {}", self.relocations_applied)?;
        writeln!(
            f,
            "  External relocation groups: {} ({} sites)",
            self.external_groups, self.external_sites
        )?;

        if !self.phase_profiles.is_empty() {
            writeln!(f, "  Phase profile:")?;
            for profile in &self.phase_profiles {
                writeln!(
                    f,
                    "    {:<32} {:>10?} {:>8} transient {:>8} arena",
                    profile.phase.name(),
                    profile.elapsed,
                    profile.transient_bytes,
                    profile.arena_growth
                )?;
            }
        }

        Ok(())
    }
}
