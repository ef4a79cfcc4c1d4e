//! Execution engine: architectural register state, flag-exact ALU helpers,
//! and an instruction-at-a-time interpreter over a pluggable memory bus.

pub mod bus;
mod exec;
pub mod flags;
pub mod interrupts;
mod state;

use thiserror::Error;

pub use bus::{BusError, CpuBus, FlatTestBus};
pub use exec::{Cpu, ExecHook, Flow, StepOutcome, SyscallHandler};
pub use state::{
    CpuState, RFlags, Segment, GPR_RAX, GPR_RBP, GPR_RBX, GPR_RCX, GPR_RDI, GPR_RDX, GPR_RSI,
    GPR_RSP,
};

/// Execution failure that escapes the engine.
///
/// `Divide` never reaches callers of [`Cpu::step`]; it is converted into a
/// vector-0 interrupt internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("integer divide fault")]
    Divide,
}
