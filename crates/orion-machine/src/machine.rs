//! The assembled machine: CPU, memory system, and the JIT driver loop.

use std::sync::Arc;

use orion_cpu::{BusError, Cpu, CpuError, ExecHook, StepOutcome, SyscallHandler, GPR_RSP};
use orion_jit::{Jit, JitConfig, TraceCache};
use orion_mmu::{MmuError, Protection};
use thiserror::Error;
use tracing::debug;

use crate::memory::LinearMemory;

/// Guest stack placed well above typical program load addresses.
const STACK_TOP: u64 = 0x7FFF_0000;
const STACK_SIZE: u64 = 0x1_0000;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Cpu(#[from] CpuError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Mmu(#[from] MmuError),
}

#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    pub ram_bytes: usize,
    pub cache_sets: usize,
    pub cache_ways: usize,
    pub jit: JitConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_bytes: 16 << 20,
            cache_sets: 64,
            cache_ways: 4,
            jit: JitConfig::default(),
        }
    }
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Halted,
    /// A host handler cleared the running flag.
    Stopped,
    /// The step budget ran out first.
    StepBudget,
}

pub struct Machine {
    pub cpu: Cpu,
    pub mem: LinearMemory,
    jit: Jit,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let trace_cache = Arc::new(TraceCache::new());
        Self {
            cpu: Cpu::new(),
            mem: LinearMemory::new(
                config.ram_bytes,
                config.cache_sets,
                config.cache_ways,
                Arc::clone(&trace_cache),
            ),
            jit: Jit::with_cache(config.jit, trace_cache),
        }
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    /// Map and copy a program image, set up a stack, and point RIP at
    /// `base + entry`.
    pub fn load(&mut self, image: &[u8], base: u64, entry: u64) -> Result<(), MachineError> {
        self.mem
            .map(base, image.len() as u64, Protection::RWX, "program")?;
        self.mem.write_virt(base, image)?;
        self.mem
            .map(STACK_TOP - STACK_SIZE, STACK_SIZE, Protection::RW, "stack")?;

        self.cpu.state.reset(base + entry);
        self.cpu.state.write_gpr(GPR_RSP, STACK_TOP);
        debug!(
            base = format_args!("{base:#x}"),
            len = image.len(),
            entry = format_args!("{:#x}", base + entry),
            "program loaded"
        );
        Ok(())
    }

    /// Execute from the current RIP: a cached translation if one exists,
    /// otherwise either compile (once the entry runs hot) or single-step.
    pub fn step(&mut self) -> Result<StepOutcome, MachineError> {
        if self.cpu.state.halted {
            return Ok(StepOutcome::Halted);
        }
        if !self.cpu.state.running {
            return Ok(StepOutcome::Stopped);
        }

        let pc = self.cpu.state.rip;
        if let Some(block) = self.mem.trace_cache().lookup(pc) {
            return Ok(self.jit.run(&mut self.cpu, &mut self.mem, &block)?);
        }
        if self.jit.should_compile(pc) {
            let mem = &mut self.mem;
            let block = self.jit.compile(pc, |addr, window| match mem.fetch_window(addr) {
                Some((bytes, avail)) => {
                    window[..avail].copy_from_slice(&bytes[..avail]);
                    avail
                }
                None => 0,
            });
            if block.insts.is_empty() {
                // Nothing was fetchable; single-stepping raises the fault.
                return Ok(self.cpu.step(mem)?);
            }
            return Ok(self.jit.run(&mut self.cpu, mem, &block)?);
        }
        Ok(self.cpu.step(&mut self.mem)?)
    }

    /// Drive [`Machine::step`] until halt, stop, or the budget runs out.
    pub fn run(&mut self, max_steps: u64) -> Result<RunExit, MachineError> {
        for _ in 0..max_steps {
            match self.step()? {
                StepOutcome::Executed => {}
                StepOutcome::Halted => return Ok(RunExit::Halted),
                StepOutcome::Stopped => return Ok(RunExit::Stopped),
            }
        }
        Ok(RunExit::StepBudget)
    }

    // Debugger-facing accessors.

    pub fn reg(&self, idx: u8) -> u64 {
        self.cpu.state.read_gpr(idx)
    }

    pub fn set_reg(&mut self, idx: u8, value: u64) {
        self.cpu.state.write_gpr(idx, value);
    }

    pub fn rip(&self) -> u64 {
        self.cpu.state.rip
    }

    pub fn running(&self) -> bool {
        self.cpu.state.running && !self.cpu.state.halted
    }

    pub fn set_exec_hook(&mut self, hook: Option<ExecHook>) {
        self.cpu.set_exec_hook(hook);
    }

    pub fn set_syscall_handler(&mut self, handler: SyscallHandler) {
        self.cpu.set_syscall_handler(handler);
    }
}
