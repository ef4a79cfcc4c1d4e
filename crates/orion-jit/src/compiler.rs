//! Compilation driver: hot-spot profiling, the per-block pipeline, and the
//! shared trace cache.
//!
//! The pipeline for one entry point is analyze, lower, optimize, allocate,
//! then (for the native backends) emit. A block that fails native emission
//! still compiles; it just runs on the IR evaluator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use orion_cpu::{Cpu, CpuBus, CpuError, StepOutcome};
use orion_x86::MAX_INST_LEN;
use tracing::debug;

use crate::backend::{self, BackendKind, CompiledBlock};
use crate::block::analyze_block;
use crate::cache::TraceCache;
use crate::lower::lower_block;
use crate::opt::run_pipeline;

#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    pub backend: BackendKind,
    /// 0 disables the optimizer entirely; see [`crate::opt::run_pipeline`].
    pub opt_level: u8,
    /// Executions of an entry point before it is compiled.
    pub hot_threshold: u64,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Interpreter,
            opt_level: 2,
            hot_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitStats {
    pub blocks_compiled: u64,
    pub native_blocks: u64,
}

pub struct Jit {
    config: JitConfig,
    cache: Arc<TraceCache>,
    /// Execution counts for entry points that are not yet compiled.
    heat: Mutex<HashMap<u64, u64>>,
    compiled: AtomicU64,
    native: AtomicU64,
}

impl Jit {
    pub fn new(config: JitConfig) -> Self {
        Self::with_cache(config, Arc::new(TraceCache::new()))
    }

    pub fn with_cache(config: JitConfig, cache: Arc<TraceCache>) -> Self {
        Self {
            config,
            cache,
            heat: Mutex::new(HashMap::new()),
            compiled: AtomicU64::new(0),
            native: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cache(&self) -> Arc<TraceCache> {
        Arc::clone(&self.cache)
    }

    pub fn stats(&self) -> JitStats {
        JitStats {
            blocks_compiled: self.compiled.load(Ordering::Relaxed),
            native_blocks: self.native.load(Ordering::Relaxed),
        }
    }

    /// Count an execution of an uncompiled entry point; true once it has
    /// crossed the hot threshold and should be compiled now.
    pub fn should_compile(&self, pc: u64) -> bool {
        let mut heat = self.heat.lock().unwrap();
        let count = heat.entry(pc).or_insert(0);
        *count += 1;
        if *count >= self.config.hot_threshold {
            heat.remove(&pc);
            true
        } else {
            false
        }
    }

    /// Compile the block at `entry` and publish it to the cache. `fetch`
    /// fills an instruction window and returns the number of valid bytes.
    pub fn compile<F>(&self, entry: u64, fetch: F) -> Arc<CompiledBlock>
    where
        F: FnMut(u64, &mut [u8; MAX_INST_LEN]) -> usize,
    {
        let (block, end) = analyze_block(entry, fetch);
        let mut ir = lower_block(&block);

        // The fast native tier trades optimization time for compile latency.
        let opt_level = match self.config.backend {
            BackendKind::NativeFast => self.config.opt_level.min(1),
            _ => self.config.opt_level,
        };
        let iterations = run_pipeline(&mut ir, opt_level);

        #[cfg(all(unix, target_arch = "x86_64"))]
        let native = if matches!(
            self.config.backend,
            BackendKind::NativeFast | BackendKind::NativeOpt
        ) {
            let alloc = crate::regalloc::allocate(
                crate::liveness::live_ranges(&ir),
                crate::backend::native::POOL.len(),
            );
            crate::backend::native::compile(&ir, &alloc)
        } else {
            None
        };
        #[cfg(all(unix, target_arch = "x86_64"))]
        let is_native = native.is_some();
        #[cfg(not(all(unix, target_arch = "x86_64")))]
        let is_native = false;

        debug!(
            entry = format_args!("{entry:#x}"),
            insts = block.insts.len(),
            ops = ir.ops.len(),
            ?end,
            iterations,
            native = is_native,
            "compiled block"
        );

        self.compiled.fetch_add(1, Ordering::Relaxed);
        if is_native {
            self.native.fetch_add(1, Ordering::Relaxed);
        }

        let mut compiled =
            CompiledBlock::new(entry, block.byte_len, self.config.backend, block.insts, ir);
        #[cfg(all(unix, target_arch = "x86_64"))]
        {
            compiled.native = native;
        }
        let compiled = Arc::new(compiled);
        self.cache.insert(Arc::clone(&compiled));
        compiled
    }

    /// Execute a compiled block. RIP must be at the block entry.
    pub fn run<B: CpuBus>(
        &self,
        cpu: &mut Cpu,
        bus: &mut B,
        block: &CompiledBlock,
    ) -> Result<StepOutcome, CpuError> {
        backend::run_block(cpu, bus, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_cpu::FlatTestBus;

    fn fetch_from(bus: &FlatTestBus) -> impl FnMut(u64, &mut [u8; MAX_INST_LEN]) -> usize + '_ {
        move |pc, window| {
            let slice = bus.slice(pc, MAX_INST_LEN.min(0x10000 - pc as usize));
            window[..slice.len()].copy_from_slice(slice);
            slice.len()
        }
    }

    #[test]
    fn hot_threshold_fires_once() {
        let jit = Jit::new(JitConfig {
            hot_threshold: 3,
            ..Default::default()
        });
        assert!(!jit.should_compile(0x1000));
        assert!(!jit.should_compile(0x1000));
        assert!(jit.should_compile(0x1000));
        // Counting restarts after the trigger; the caller is expected to
        // have published a translation by then.
        assert!(!jit.should_compile(0x1000));
    }

    #[test]
    fn compiled_block_matches_single_stepping() {
        // mov rax, 7; add rax, rbx; hlt
        static CODE: &[u8] = &[
            0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00, 0x48, 0x01, 0xD8, 0xF4,
        ];

        let mut bus = FlatTestBus::new(0x10000);
        bus.load(0x1000, CODE);

        // Reference run, one instruction at a time.
        let mut ref_bus = bus.clone();
        let mut reference = Cpu::new();
        reference.state.reset(0x1000);
        reference.state.gpr[3] = 5;
        while reference.step(&mut ref_bus).unwrap() == StepOutcome::Executed {}

        let jit = Jit::new(JitConfig {
            backend: BackendKind::Interpreter,
            hot_threshold: 1,
            ..Default::default()
        });
        let block = jit.compile(0x1000, fetch_from(&bus));
        assert!(jit.cache().contains(0x1000));

        let mut cpu = Cpu::new();
        cpu.state.reset(0x1000);
        cpu.state.gpr[3] = 5;
        let outcome = jit.run(&mut cpu, &mut bus, &block).unwrap();

        assert_eq!(outcome, StepOutcome::Halted);
        assert_eq!(cpu.state.gpr[0], reference.state.gpr[0]);
        assert_eq!(cpu.state.gpr[0], 12);
        assert_eq!(block.executions(), 1);
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn native_tier_compiles_flag_free_register_blocks() {
        // MOV and LEA leave RFLAGS alone, so the whole block stays out of
        // the flag machinery and qualifies for host code.
        // mov rax, 2; lea rbx, [rax + rax*2 + 4]; jmp +0
        static CODE: &[u8] = &[
            0x48, 0xC7, 0xC0, 0x02, 0x00, 0x00, 0x00, // mov rax, 2
            0x48, 0x8D, 0x5C, 0x40, 0x04, // lea rbx, [rax + rax*2 + 4]
            0xEB, 0x00, // jmp +0
        ];

        let mut bus = FlatTestBus::new(0x10000);
        bus.load(0x1000, CODE);

        let jit = Jit::new(JitConfig {
            backend: BackendKind::NativeOpt,
            opt_level: 2,
            hot_threshold: 1,
        });
        let block = jit.compile(0x1000, fetch_from(&bus));
        assert!(block.native.is_some());
        assert_eq!(jit.stats().native_blocks, 1);

        let mut cpu = Cpu::new();
        cpu.state.reset(0x1000);
        jit.run(&mut cpu, &mut bus, &block).unwrap();
        assert_eq!(cpu.state.gpr[0], 2);
        assert_eq!(cpu.state.gpr[3], 10);
        assert_eq!(cpu.state.rip, 0x1000 + CODE.len() as u64);
    }

    #[test]
    fn bailout_at_block_entry_still_advances() {
        // dec r/m is outside the IR subset, so the block compiles to a lone
        // bailout; running it must interpret the instruction rather than
        // spin at the entry.
        static CODE: &[u8] = &[0x48, 0xFF, 0xC9, 0xEB, 0x00]; // dec rcx; jmp +0

        let mut bus = FlatTestBus::new(0x10000);
        bus.load(0x1000, CODE);

        let jit = Jit::new(JitConfig {
            backend: BackendKind::NativeOpt,
            hot_threshold: 1,
            ..Default::default()
        });
        let block = jit.compile(0x1000, fetch_from(&bus));

        let mut cpu = Cpu::new();
        cpu.state.reset(0x1000);
        cpu.state.gpr[1] = 5;
        jit.run(&mut cpu, &mut bus, &block).unwrap();
        assert_eq!(cpu.state.gpr[1], 4);
        assert_eq!(cpu.state.rip, 0x1003);
    }

    #[test]
    fn blocks_with_live_flags_fall_back_to_the_ir_evaluator() {
        // add rax, rbx keeps its flag write (it is the block's last flag
        // writer), which disqualifies native emission but not compilation.
        static CODE: &[u8] = &[0x48, 0x01, 0xD8, 0xEB, 0x00];

        let mut bus = FlatTestBus::new(0x10000);
        bus.load(0x1000, CODE);

        let jit = Jit::new(JitConfig {
            backend: BackendKind::NativeOpt,
            opt_level: 2,
            hot_threshold: 1,
        });
        let block = jit.compile(0x1000, fetch_from(&bus));
        #[cfg(all(unix, target_arch = "x86_64"))]
        assert!(block.native.is_none());

        let mut cpu = Cpu::new();
        cpu.state.reset(0x1000);
        cpu.state.gpr[0] = u64::MAX;
        cpu.state.gpr[3] = 1;
        jit.run(&mut cpu, &mut bus, &block).unwrap();
        assert_eq!(cpu.state.gpr[0], 0);
        assert!(cpu.state.rflags.contains(orion_cpu::RFlags::ZF));
        assert!(cpu.state.rflags.contains(orion_cpu::RFlags::CF));
        assert_eq!(cpu.state.rip, 0x1005);
    }
}
