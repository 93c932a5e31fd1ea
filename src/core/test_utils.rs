//! Test utilities for arena-based testing.
//!
//! Every compilation borrows its arena from the caller; tests get one per
//! test through [`TestContext`] so nothing outlives the test.

use super::session::CompilationSession;
use bumpalo::Bump;

/// Test context that manages arena lifetime for tests.
pub struct TestContext {
    arena: Bump,
}

impl TestContext {
    /// Create a new test context with default capacity.
    pub fn new() -> Self {
        Self { arena: Bump::new() }
    }

    /// Create a test context with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Bump::with_capacity(capacity),
        }
    }

    /// Get a reference to the arena.
    pub fn arena(&self) -> &Bump {
        &self.arena
    }

    /// Create a compilation session using this context's arena.
    ///
    /// The returned session borrows from the TestContext, so the
    /// TestContext must outlive the session.
    pub fn create_session(&self) -> CompilationSession<'_> {
        CompilationSession::new(&self.arena)
    }

    /// Get current memory usage.
    pub fn memory_used(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Run a test with a session.
    pub fn with_session<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&CompilationSession<'_>) -> R,
    {
        let session = self.create_session();
        f(&session)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a test with a temporary arena context.
pub fn with_test_context<F, R>(f: F) -> R
where
    F: FnOnce(&TestContext) -> R,
{
    let ctx = TestContext::new();
    f(&ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_allocate_from_the_context_arena() {
        with_test_context(|ctx| {
            let before = ctx.memory_used();
            ctx.with_session(|session| {
                session.alloc_zeroed_bytes(128);
            });
            assert!(ctx.memory_used() >= before + 128);
        });
    }
}
