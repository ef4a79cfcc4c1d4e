//! Dynamic translation for the virtual CPU: basic-block discovery, a small
//! block-local IR with an optimizing pipeline, linear-scan register
//! allocation, and tiered execution backends over a shared trace cache.
//!
//! Correctness rule: every backend produces the same architectural state as
//! single-stepping the interpreter. Instructions outside the lowered subset
//! bail out to the interpreter mid-block; the memory system invalidates
//! cached translations synchronously when guest code bytes change.

pub mod backend;
pub mod block;
pub mod cache;
pub mod compiler;
pub mod ir;
pub mod liveness;
pub mod lower;
pub mod opt;
pub mod regalloc;

pub use backend::{run_block, BackendKind, CompiledBlock};
pub use block::{analyze_block, BasicBlock, BlockEnd, BlockInst, RegSet, MAX_BLOCK_INSTS};
pub use cache::{TraceCache, TraceCacheStats};
pub use compiler::{Jit, JitConfig, JitStats};
pub use ir::{BlockHints, BlockIr};
pub use lower::lower_block;
