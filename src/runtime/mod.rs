//! Runtime collaborators of the code generator: the code cache that hands out code memory and
//! helper trampolines, and the helper table.

pub mod code_cache;
pub mod helpers;

pub use code_cache::{CodeCacheManager, CodeCaches};
pub use helpers::{HelperId, HelperTable};
