//! End-to-end programs run through the assembled machine.

use orion_cpu::CpuBus;
use orion_machine::{Machine, MachineConfig, RunExit};
use orion_mmu::{Protection, PAGE_SIZE};

fn machine() -> Machine {
    Machine::new(MachineConfig::default())
}

#[test]
fn arithmetic_store_load_compare_branch() {
    // mov rax, 10
    // add rax, 5
    // imul rax, rax, 3
    // mov [0x200], rax
    // mov rbx, [0x200]
    // cmp rbx, 45
    // jz skip
    // mov rcx, 999        (skipped)
    // skip: mov rcx, 123
    // hlt
    #[rustfmt::skip]
    let program: &[u8] = &[
        0x48, 0xC7, 0xC0, 0x0A, 0x00, 0x00, 0x00,
        0x48, 0x83, 0xC0, 0x05,
        0x48, 0x6B, 0xC0, 0x03,
        0x48, 0xA3, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x48, 0x8B, 0x1C, 0x25, 0x00, 0x02, 0x00, 0x00,
        0x48, 0x83, 0xFB, 0x2D,
        0x74, 0x07,
        0x48, 0xC7, 0xC1, 0xE7, 0x03, 0x00, 0x00,
        0x48, 0xC7, 0xC1, 0x7B, 0x00, 0x00, 0x00,
        0xF4,
    ];

    let mut m = machine();
    m.load(program, 0, 0).unwrap();
    assert_eq!(m.run(1000).unwrap(), RunExit::Halted);

    assert_eq!(m.reg(0), 45); // rax
    assert_eq!(m.reg(3), 45); // rbx, read back through the cache
    assert_eq!(m.reg(1), 123); // rcx, the 999 store was branched over
    assert_eq!(m.mem.read_u64(0x200).unwrap(), 45);
}

#[test]
fn divide_by_zero_without_handler_halts_with_operands_intact() {
    // mov rax, 10; mov rdx, 7; xor rbx, rbx; div rbx; hlt
    #[rustfmt::skip]
    let program: &[u8] = &[
        0x48, 0xC7, 0xC0, 0x0A, 0x00, 0x00, 0x00,
        0x48, 0xC7, 0xC2, 0x07, 0x00, 0x00, 0x00,
        0x48, 0x31, 0xDB,
        0x48, 0xF7, 0xF3,
        0xF4,
    ];

    let mut m = machine();
    m.load(program, 0, 0).unwrap();
    assert_eq!(m.run(100).unwrap(), RunExit::Halted);

    // #DE is a fault: no partial quotient reaches the registers.
    assert_eq!(m.reg(0), 10);
    assert_eq!(m.reg(2), 7);
}

#[test]
fn divide_by_zero_with_handler_vectors_to_it() {
    // Same divide, but vector 0 points at a hlt stub at 0x300.
    #[rustfmt::skip]
    let program: &[u8] = &[
        0x48, 0xC7, 0xC0, 0x0A, 0x00, 0x00, 0x00,
        0x48, 0x31, 0xDB,
        0x48, 0xF7, 0xF3,
        0xF4,
    ];

    let mut m = machine();
    m.load(program, 0, 0).unwrap();
    m.mem.write_u8(0x300, 0xF4).unwrap();
    m.cpu.set_interrupt_vector(0, 0x300);

    assert_eq!(m.run(100).unwrap(), RunExit::Halted);
    assert_eq!(m.rip(), 0x301);
    assert_eq!(m.reg(0), 10);
}

#[test]
fn remap_does_not_leak_previous_contents() {
    let mut m = machine();
    let base = 0x40_0000;
    m.mem.map(base, 3 * PAGE_SIZE, Protection::RW, "window").unwrap();

    let middle = base + PAGE_SIZE + 0x10;
    m.mem.write_u64(middle, 0x5EC2E7).unwrap();
    m.mem.unmap(base).unwrap();

    m.mem.map(base, 3 * PAGE_SIZE, Protection::RW, "window").unwrap();
    assert_eq!(m.mem.read_u64(middle).unwrap(), 0);
}

#[test]
fn stores_to_readonly_mappings_fail() {
    let mut m = machine();
    m.mem
        .map(0x50_0000, PAGE_SIZE, Protection::READ, "ro")
        .unwrap();
    assert!(m.mem.write_u8(0x50_0000, 1).is_err());
    assert!(m.mem.read_u8(0x50_0000).is_ok());
}

#[test]
fn syscall_handler_can_stop_the_machine() {
    // mov rax, 21; syscall; hlt
    #[rustfmt::skip]
    let program: &[u8] = &[
        0x48, 0xC7, 0xC0, 0x15, 0x00, 0x00, 0x00,
        0x0F, 0x05,
        0xF4,
    ];

    let mut m = machine();
    m.load(program, 0, 0).unwrap();
    m.set_syscall_handler(Box::new(|state| {
        state.gpr[3] = state.gpr[0] * 2;
        state.running = false;
    }));

    assert_eq!(m.run(100).unwrap(), RunExit::Stopped);
    assert_eq!(m.reg(3), 42);
}

#[test]
fn run_honors_the_step_budget() {
    // An infinite loop: jmp -2.
    let program: &[u8] = &[0xEB, 0xFE];
    let mut m = machine();
    m.load(program, 0, 0).unwrap();
    assert_eq!(m.run(50).unwrap(), RunExit::StepBudget);
    assert!(m.running());
}

#[test]
fn cache_serves_repeated_accesses() {
    let mut m = machine();
    m.mem.map(0x60_0000, PAGE_SIZE, Protection::RW, "data").unwrap();
    m.mem.write_u64(0x60_0000, 1).unwrap();
    for _ in 0..8 {
        m.mem.read_u64(0x60_0000).unwrap();
    }
    let stats = m.mem.cache_stats();
    assert!(stats.hits >= 8);
}
