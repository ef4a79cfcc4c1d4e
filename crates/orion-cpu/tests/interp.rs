//! End-to-end interpreter tests over small machine-code programs.

use orion_cpu::{Cpu, CpuBus, FlatTestBus, RFlags, StepOutcome, GPR_RAX, GPR_RBX, GPR_RCX, GPR_RDX};

const CODE_BASE: u64 = 0x100;
const STACK_TOP: u64 = 0x8000;

fn machine(code: &[u8]) -> (Cpu, FlatTestBus) {
    let mut cpu = Cpu::new();
    let mut bus = FlatTestBus::new(0x1_0000);
    bus.load(CODE_BASE, code);
    cpu.state.reset(CODE_BASE);
    cpu.state.set_rsp(STACK_TOP);
    (cpu, bus)
}

fn run(cpu: &mut Cpu, bus: &mut FlatTestBus) {
    for _ in 0..10_000 {
        match cpu.step(bus).unwrap() {
            StepOutcome::Executed => {}
            StepOutcome::Halted | StepOutcome::Stopped => return,
        }
    }
    panic!("program did not halt");
}

#[test]
fn loop_sums_one_through_ten() {
    #[rustfmt::skip]
    let code = [
        0x31, 0xC0,                   // xor eax, eax
        0xB9, 0x01, 0x00, 0x00, 0x00, // mov ecx, 1
        0x01, 0xC8,                   // add eax, ecx
        0xFF, 0xC1,                   // inc ecx
        0x83, 0xF9, 0x0A,             // cmp ecx, 10
        0x7E, 0xF7,                   // jle -9
        0xF4,                         // hlt
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 55);
    assert_eq!(cpu.state.read_gpr(GPR_RCX), 11);
    assert!(cpu.state.halted);
}

#[test]
fn call_and_ret_round_trip() {
    #[rustfmt::skip]
    let code = [
        0xE8, 0x05, 0x00, 0x00, 0x00, // call +5 (0x10A)
        0xF4,                         // hlt
        0x90, 0x90, 0x90, 0x90,       // padding
        0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
        0xC3,                         // ret
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 42);
    // Balanced stack.
    assert_eq!(cpu.state.rsp(), STACK_TOP);
    assert_eq!(cpu.state.rip, CODE_BASE + 6);
}

#[test]
fn push_pop_transfers_values() {
    #[rustfmt::skip]
    let code = [
        0x48, 0xB8, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00, 0x00, // mov rax, 0xDEADBEEF
        0x50,                                                       // push rax
        0x5B,                                                       // pop rbx
        0xF4,                                                       // hlt
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RBX), 0xDEAD_BEEF);
    assert_eq!(cpu.state.rsp(), STACK_TOP);
}

#[test]
fn push_immediate_forms_execute() {
    // Both widths carry no ModRM; the immediate is sign-extended to 64 bits.
    #[rustfmt::skip]
    let code = [
        0x6A, 0x10,                   // push 0x10
        0x68, 0x00, 0x01, 0x00, 0x00, // push 0x100
        0x6A, 0xFF,                   // push -1
        0x58,                         // pop rax
        0x5B,                         // pop rbx
        0x59,                         // pop rcx
        0xF4,                         // hlt
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), u64::MAX);
    assert_eq!(cpu.state.read_gpr(GPR_RBX), 0x100);
    assert_eq!(cpu.state.read_gpr(GPR_RCX), 0x10);
    assert_eq!(cpu.state.rsp(), STACK_TOP);
}

#[test]
fn reset_state_has_interrupts_enabled() {
    let code = [0x9C, 0xF4]; // pushfq; hlt
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    let pushed = u64::from_le_bytes(bus.slice(STACK_TOP - 8, 8).try_into().unwrap());
    assert_ne!(pushed & (1 << 9), 0); // IF
    assert_ne!(pushed & (1 << 1), 0); // always-set bit
}

#[test]
fn divide_error_raises_vector_zero_with_operands_intact() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0x0A, 0x00, 0x00, 0x00, // mov eax, 10
        0x31, 0xD2,                   // xor edx, edx
        0x31, 0xC9,                   // xor ecx, ecx
        0xF7, 0xF1,                   // div ecx  -> #DE
        0xF4,                         // hlt (never reached)
    ];
    let (mut cpu, mut bus) = machine(&code);
    // Handler just halts.
    bus.load(0x700, &[0xF4]);
    cpu.set_interrupt_vector(0, 0x700);
    run(&mut cpu, &mut bus);

    // Fault semantics: RAX/RDX are untouched and the pushed return RIP is
    // the divide instruction itself.
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 10);
    assert_eq!(cpu.state.read_gpr(GPR_RDX), 0);
    assert!(cpu.state.halted);
    let pushed_rip = bus.read_u64(cpu.state.rsp()).unwrap();
    assert_eq!(pushed_rip, CODE_BASE + 9);
}

#[test]
fn divide_error_without_handler_halts() {
    let code = [0x31, 0xC9, 0xF7, 0xF1]; // xor ecx,ecx; div ecx
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert!(cpu.state.halted);
}

#[test]
fn int3_and_iret_resume_after_trap() {
    #[rustfmt::skip]
    let code = [
        0xF9,                         // stc
        0xCC,                         // int3
        0xB8, 0x07, 0x00, 0x00, 0x00, // mov eax, 7
        0xF4,                         // hlt
    ];
    let (mut cpu, mut bus) = machine(&code);
    // Handler: mov ebx, 1; iretq
    bus.load(0x700, &[0xBB, 0x01, 0x00, 0x00, 0x00, 0xCF]);
    cpu.set_interrupt_vector(3, 0x700);
    run(&mut cpu, &mut bus);

    assert_eq!(cpu.state.read_gpr(GPR_RBX), 1);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 7, "execution resumed after INT3");
    // IRET restored the pre-trap flags.
    assert!(cpu.state.flag(RFlags::CF));
    assert_eq!(cpu.state.rsp(), STACK_TOP);
}

#[test]
fn signed_division_sets_quotient_and_remainder() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0xF9, 0xFF, 0xFF, 0xFF, // mov eax, -7
        0x99,                         // cdq
        0xB9, 0x02, 0x00, 0x00, 0x00, // mov ecx, 2
        0xF7, 0xF9,                   // idiv ecx
        0xF4,                         // hlt
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX) as u32 as i32, -3);
    assert_eq!(cpu.state.read_gpr(GPR_RDX) as u32 as i32, -1);
}

#[test]
fn wide_multiply_fills_rdx() {
    #[rustfmt::skip]
    let code = [
        0x48, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // mov rax, -1
        0x48, 0xC7, 0xC1, 0x02, 0x00, 0x00, 0x00,                   // mov rcx, 2
        0x48, 0xF7, 0xE1,                                           // mul rcx
        0xF4,
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), u64::MAX - 1);
    assert_eq!(cpu.state.read_gpr(GPR_RDX), 1);
    assert!(cpu.state.flag(RFlags::CF) && cpu.state.flag(RFlags::OF));
}

#[test]
fn memory_operands_and_movzx() {
    #[rustfmt::skip]
    let code = [
        0xC6, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, 0x80, // mov byte [0x2000], 0x80
        0x0F, 0xB6, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, // movzx eax, byte [0x2000]
        0x0F, 0xBE, 0x1C, 0x25, 0x00, 0x20, 0x00, 0x00, // movsx ebx, byte [0x2000]
        0xF4,
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 0x80);
    assert_eq!(cpu.state.read_gpr(GPR_RBX), 0xFFFF_FF80);
}

#[test]
fn setcc_and_cmov_follow_flags() {
    #[rustfmt::skip]
    let code = [
        0x31, 0xC0,                   // xor eax, eax      (ZF=1)
        0x0F, 0x94, 0xC3,             // sete bl
        0xB9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
        0x0F, 0x44, 0xC1,             // cmove eax, ecx
        0xF4,
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RBX) & 0xFF, 1);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 5);
}

#[test]
fn syscall_handler_reads_and_writes_registers() {
    #[rustfmt::skip]
    let code = [
        0xB8, 0x0C, 0x00, 0x00, 0x00, // mov eax, 12
        0x0F, 0x05,                   // syscall
        0xF4,
    ];
    let (mut cpu, mut bus) = machine(&code);
    cpu.set_syscall_handler(Box::new(|state| {
        let n = state.read_gpr(GPR_RAX);
        state.write_gpr(GPR_RBX, n * 2);
        state.running = false;
    }));
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RBX), 24);
    assert!(!cpu.state.running, "handler requested a stop");
    assert!(!cpu.state.halted, "stop is not a halt");
}

#[test]
fn unknown_opcode_halts_instead_of_panicking() {
    let code = [0x0F, 0xFF, 0xFF]; // not implemented
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert!(cpu.state.halted);
}

#[test]
fn inc_preserves_carry_end_to_end() {
    #[rustfmt::skip]
    let code = [
        0xF9,       // stc
        0xFF, 0xC0, // inc eax
        0xF4,
    ];
    let (mut cpu, mut bus) = machine(&code);
    run(&mut cpu, &mut bus);
    assert!(cpu.state.flag(RFlags::CF));
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 1);
}

#[test]
fn rip_relative_addressing_resolves_against_next_instruction() {
    // mov eax, [rip+0x10] at 0x100 is 6 bytes; the next instruction is at
    // 0x106, so the load reads 0x116.
    let code = [0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, 0xF4];
    let (mut cpu, mut bus) = machine(&code);
    bus.load(0x116, &0x1234_5678u32.to_le_bytes());
    run(&mut cpu, &mut bus);
    assert_eq!(cpu.state.read_gpr(GPR_RAX), 0x1234_5678);
}
