//! JIT-specific behavior of the assembled machine: tier agreement with
//! single-stepping, hot promotion, and self-modifying code.

use orion_cpu::CpuBus;
use orion_jit::{BackendKind, JitConfig};
use orion_machine::{Machine, MachineConfig, RunExit};

// xor rax, rax
// mov rcx, 10
// loop: add rax, rcx
// dec rcx
// jnz loop
// hlt
//
// Sums 10..=1 into rax. The back edge makes both block entries hot.
#[rustfmt::skip]
const SUM_LOOP: &[u8] = &[
    0x48, 0x31, 0xC0,
    0x48, 0xC7, 0xC1, 0x0A, 0x00, 0x00, 0x00,
    0x48, 0x01, 0xC8,
    0x48, 0xFF, 0xC9,
    0x75, 0xF8,
    0xF4,
];

fn machine_with(jit: JitConfig) -> Machine {
    Machine::new(MachineConfig {
        jit,
        ..Default::default()
    })
}

fn run_sum_loop(jit: JitConfig) -> Machine {
    let mut m = machine_with(jit);
    m.load(SUM_LOOP, 0, 0).unwrap();
    assert_eq!(m.run(10_000).unwrap(), RunExit::Halted);
    m
}

#[test]
fn compiled_loop_matches_pure_interpretation() {
    // High threshold: every instruction single-steps.
    let stepped = run_sum_loop(JitConfig {
        hot_threshold: u64::MAX,
        ..Default::default()
    });
    assert_eq!(stepped.jit().stats().blocks_compiled, 0);

    // Threshold 1: everything runs out of the trace cache.
    let jitted = run_sum_loop(JitConfig {
        hot_threshold: 1,
        ..Default::default()
    });
    assert!(jitted.jit().stats().blocks_compiled >= 2);

    assert_eq!(jitted.reg(0), stepped.reg(0));
    assert_eq!(jitted.reg(0), 55);
    assert_eq!(jitted.reg(1), 0);
    assert_eq!(jitted.rip(), stepped.rip());
}

#[test]
fn ir_evaluator_backend_agrees_with_replay() {
    let replayed = run_sum_loop(JitConfig {
        backend: BackendKind::Interpreter,
        hot_threshold: 1,
        ..Default::default()
    });
    let evaluated = run_sum_loop(JitConfig {
        backend: BackendKind::NativeOpt,
        opt_level: 3,
        hot_threshold: 1,
    });

    assert_eq!(evaluated.reg(0), replayed.reg(0));
    assert_eq!(evaluated.reg(1), replayed.reg(1));
    assert_eq!(evaluated.rip(), replayed.rip());
}

#[test]
fn hot_blocks_are_served_from_the_trace_cache() {
    let m = run_sum_loop(JitConfig {
        hot_threshold: 1,
        ..Default::default()
    });

    let stats = m.mem.trace_cache().stats();
    assert!(stats.lookups > 0);
    // The loop body re-enters an already compiled block eight times: ten
    // iterations, minus the one inside the entry block and the one that
    // compiled the body.
    assert!(stats.hits >= 8);
}

#[test]
fn stores_over_compiled_code_force_recompilation() {
    // mov rax, 1; hlt. The immediate sits at offset 3.
    let program: &[u8] = &[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, 0xF4];

    let mut m = machine_with(JitConfig {
        hot_threshold: 1,
        ..Default::default()
    });
    m.load(program, 0x1000, 0).unwrap();
    assert_eq!(m.run(10).unwrap(), RunExit::Halted);
    assert_eq!(m.reg(0), 1);
    assert!(m.mem.trace_cache().contains(0x1000));

    // Patch the immediate. The store must drop the stale translation
    // before it completes.
    m.mem.write_u8(0x1003, 2).unwrap();
    assert!(!m.mem.trace_cache().contains(0x1000));

    m.cpu.state.reset(0x1000);
    assert_eq!(m.run(10).unwrap(), RunExit::Halted);
    assert_eq!(m.reg(0), 2);
    assert_eq!(m.mem.trace_cache().stats().invalidated_blocks, 1);
}

#[test]
fn compilation_counts_as_execution_for_the_step_budget() {
    let mut m = machine_with(JitConfig {
        hot_threshold: 1,
        ..Default::default()
    });
    m.load(SUM_LOOP, 0, 0).unwrap();

    // One step dispatches one whole block, not one instruction.
    m.step().unwrap();
    assert!(m.rip() != 0);
    assert_eq!(m.jit().stats().blocks_compiled, 1);
}
