//! Composition root for the emulator: the CPU execution engine over an
//! MMU-translated, cache-fronted memory system, with the JIT compiling hot
//! basic blocks into a shared trace cache.
//!
//! Guest stores invalidate overlapping translations synchronously, so
//! self-modifying code always sees its own writes on the next dispatch.

mod machine;
mod memory;

pub use machine::{Machine, MachineConfig, MachineError, RunExit};
pub use memory::LinearMemory;
