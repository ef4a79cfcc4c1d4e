//! Instruction dispatch and the fetch/decode/execute loop.

mod alu;
mod flow;
mod simd;
mod string;

use orion_x86::{decode, Instruction, MemoryRef, OperandSize, SegmentReg};
use tracing::warn;

use crate::bus::CpuBus;
use crate::state::{CpuState, RFlags, Segment};
use crate::CpuError;

pub(crate) use flow::{condition, push64};

/// How an instruction handler left RIP.
///
/// `Next` lets the engine advance past the instruction; control-flow handlers
/// that assign RIP themselves return `Jump` so it is not advanced twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    Jump,
}

/// Result of a single [`Cpu::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    /// HLT (or an unrecoverable condition downgraded to a halt).
    Halted,
    /// A system-call handler cleared the running flag.
    Stopped,
}

/// Host-side system call handler. Receives full register state; clearing
/// `state.running` requests a clean stop of the run loop.
pub type SyscallHandler = Box<dyn FnMut(&mut CpuState) + Send>;

/// Pre-execution hook, called after decode with the instruction address.
pub type ExecHook = Box<dyn FnMut(u64, &Instruction) + Send>;

pub struct Cpu {
    pub state: CpuState,
    /// Guest handler address per interrupt vector; zero means unset.
    pub ivt: [u64; 256],
    syscall: Option<SyscallHandler>,
    hook: Option<ExecHook>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            state: CpuState::new(),
            ivt: [0; 256],
            syscall: None,
            hook: None,
        }
    }

    pub fn set_syscall_handler(&mut self, handler: SyscallHandler) {
        self.syscall = Some(handler);
    }

    pub fn set_exec_hook(&mut self, hook: Option<ExecHook>) {
        self.hook = hook;
    }

    pub fn set_interrupt_vector(&mut self, vector: u8, handler: u64) {
        self.ivt[vector as usize] = handler;
    }

    /// Fetch, decode, and execute one instruction.
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> Result<StepOutcome, CpuError> {
        if self.state.halted {
            return Ok(StepOutcome::Halted);
        }
        if !self.state.running {
            return Ok(StepOutcome::Stopped);
        }

        let pc = self.state.rip;
        let (window, avail) = bus.fetch(pc)?;
        let inst = match decode(&window[..avail]) {
            Ok(inst) => inst,
            Err(err) => {
                warn!(rip = format_args!("{pc:#x}"), %err, "undecodable instruction, halting");
                self.state.halted = true;
                return Ok(StepOutcome::Halted);
            }
        };

        if let Some(hook) = self.hook.as_mut() {
            hook(pc, &inst);
        }
        self.execute_decoded(bus, &inst, pc)?;
        self.state.inst_count = self.state.inst_count.wrapping_add(1);

        Ok(if self.state.halted {
            StepOutcome::Halted
        } else if !self.state.running {
            StepOutcome::Stopped
        } else {
            StepOutcome::Executed
        })
    }

    /// Execute an already-decoded instruction at `pc`, updating RIP.
    ///
    /// This is the replay entry point used by cached translations; semantics
    /// are identical to the fetching path in [`Cpu::step`].
    pub fn execute_decoded<B: CpuBus>(
        &mut self,
        bus: &mut B,
        inst: &Instruction,
        pc: u64,
    ) -> Result<(), CpuError> {
        match self.dispatch(bus, inst, pc) {
            Ok(Flow::Next) => {
                self.state.rip = pc.wrapping_add(inst.len as u64);
                Ok(())
            }
            Ok(Flow::Jump) => Ok(()),
            Err(CpuError::Divide) => {
                // #DE is a fault: the saved RIP points at the divide itself
                // and the operand registers are left untouched.
                crate::interrupts::deliver(self, bus, 0, pc)
            }
            Err(err) => Err(err),
        }
    }

    fn dispatch<B: CpuBus>(
        &mut self,
        bus: &mut B,
        inst: &Instruction,
        pc: u64,
    ) -> Result<Flow, CpuError> {
        match inst.opcode {
            // ALU binary groups: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP.
            0x00..=0x05 | 0x08..=0x0D | 0x10..=0x15 | 0x18..=0x1D | 0x20..=0x25 | 0x28..=0x2D
            | 0x30..=0x35 | 0x38..=0x3D => alu::binop_group(self, bus, inst, pc),
            0x80 | 0x81 | 0x83 => alu::group1_imm(self, bus, inst, pc),

            0x50..=0x57 => flow::push_reg(self, bus, inst),
            0x58..=0x5F => flow::pop_reg(self, bus, inst),
            0x68 | 0x6A => flow::push_imm(self, bus, inst),
            0x8F => flow::pop_rm(self, bus, inst, pc),

            0x63 => alu::movsxd(self, bus, inst, pc),
            0x69 | 0x6B => alu::imul_imm(self, bus, inst, pc),
            0x0FAF => alu::imul_reg(self, bus, inst, pc),

            0x70..=0x7F | 0x0F80..=0x0F8F => flow::jcc(self, inst, pc),
            0xE0..=0xE2 => flow::loop_family(self, inst, pc),
            0xE3 => flow::jrcxz(self, inst, pc),
            0xE8 => flow::call_rel(self, bus, inst, pc),
            0xE9 | 0xEB => flow::jmp_rel(self, inst, pc),
            0xC2 | 0xC3 => flow::ret(self, bus, inst),

            0x84 | 0x85 => alu::test_rm_reg(self, bus, inst, pc),
            0xA8 | 0xA9 => alu::test_acc_imm(self, inst),
            0x86 | 0x87 => alu::xchg_rm(self, bus, inst, pc),
            0x91..=0x97 => alu::xchg_acc(self, inst),

            0x88..=0x8B => alu::mov_rm(self, bus, inst, pc),
            0x8D => alu::lea(self, inst, pc),
            0xA0..=0xA3 => alu::mov_moffs(self, bus, inst),
            0xB0..=0xBF => alu::mov_imm_reg(self, inst),
            0xC6 | 0xC7 => alu::mov_imm_rm(self, bus, inst, pc),

            0x90 => Ok(Flow::Next), // NOP
            0x98 => alu::sign_extend_acc(self, inst),
            0x99 => alu::sign_extend_acc_pair(self, inst),

            0x9C => flow::pushf(self, bus),
            0x9D => flow::popf(self, bus),
            0x9E => flow::sahf(self),
            0x9F => flow::lahf(self),

            0xA4..=0xA7 | 0xAA..=0xAF => string::string_op(self, bus, inst),

            0xC0 | 0xC1 | 0xD0..=0xD3 => alu::group2_shift(self, bus, inst, pc),
            0xF6 | 0xF7 => alu::group3(self, bus, inst, pc),
            0xFE => alu::group4_inc_dec(self, bus, inst, pc),
            0xFF => alu::group5(self, bus, inst, pc),

            0xCC => crate::interrupts::software_int(self, bus, 3, pc, inst.len),
            0xCD => crate::interrupts::software_int(self, bus, inst.imm as u8, pc, inst.len),
            0xCE => flow::into(self, bus, inst, pc),
            0xCF => flow::iret(self, bus),

            0xF4 => {
                self.state.halted = true;
                Ok(Flow::Next)
            }
            0xF5 => {
                let cf = self.state.flag(RFlags::CF);
                self.state.rflags.set(RFlags::CF, !cf);
                Ok(Flow::Next)
            }
            0xF8 => flow::set_flag(self, RFlags::CF, false),
            0xF9 => flow::set_flag(self, RFlags::CF, true),
            0xFA => flow::set_flag(self, RFlags::IF, false),
            0xFB => flow::set_flag(self, RFlags::IF, true),
            0xFC => flow::set_flag(self, RFlags::DF, false),
            0xFD => flow::set_flag(self, RFlags::DF, true),

            0x0F05 => flow::syscall(self),
            0x0F1F => Ok(Flow::Next), // multi-byte NOP
            0x0F31 => flow::rdtsc(self),
            0x0FA2 => flow::cpuid(self),

            0x0F40..=0x0F4F => alu::cmovcc(self, bus, inst, pc),
            0x0F90..=0x0F9F => alu::setcc(self, bus, inst, pc),

            0x0FA3 | 0x0FAB | 0x0FB3 | 0x0FBB => alu::bt_reg(self, bus, inst, pc),
            0x0FBA => alu::bt_imm(self, bus, inst, pc),
            0x0FBC | 0x0FBD => alu::bit_scan(self, bus, inst, pc),
            0x0FC8..=0x0FCF => alu::bswap(self, inst),

            0x0FB6 | 0x0FB7 | 0x0FBE | 0x0FBF => alu::movzx_movsx(self, bus, inst, pc),

            0x0F10 | 0x0F11 | 0x0F28 | 0x0F29 | 0x0F6F | 0x0F7F | 0x0FEF | 0x0FFE => {
                simd::sse_op(self, bus, inst, pc)
            }

            0x0F0B => {
                warn!(rip = format_args!("{pc:#x}"), "UD2, halting");
                self.state.halted = true;
                Ok(Flow::Next)
            }
            opcode => {
                warn!(
                    rip = format_args!("{pc:#x}"),
                    opcode = format_args!("{opcode:#x}"),
                    "unimplemented opcode, halting"
                );
                self.state.halted = true;
                Ok(Flow::Next)
            }
        }
    }
}

/// Effective address of a decoded memory operand.
pub(crate) fn effective_addr(state: &CpuState, inst: &Instruction, pc: u64, m: &MemoryRef) -> u64 {
    let mut addr = m.disp as i64 as u64;
    if m.rip_relative {
        addr = addr.wrapping_add(pc.wrapping_add(inst.len as u64));
    }
    if let Some(base) = m.base {
        addr = addr.wrapping_add(state.read_gpr(base));
    }
    if let Some(index) = m.index {
        addr = addr.wrapping_add(state.read_gpr(index).wrapping_mul(m.scale as u64));
    }
    match inst.prefixes.segment {
        Some(SegmentReg::FS) => addr.wrapping_add(state.seg_base[Segment::Fs as usize]),
        Some(SegmentReg::GS) => addr.wrapping_add(state.seg_base[Segment::Gs as usize]),
        _ => addr,
    }
}

/// Read the r/m operand at the instruction's effective operand size.
pub(crate) fn read_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
    size: OperandSize,
) -> Result<u64, CpuError> {
    if let Some(m) = inst.memory_ref() {
        let addr = effective_addr(&cpu.state, inst, pc, &m);
        Ok(bus.read_sized(addr, size.bytes())?)
    } else if size == OperandSize::Bits8 {
        Ok(cpu.state.read_reg8(inst.modrm_rm(), inst.rex.is_some()))
    } else {
        Ok(cpu.state.read_gpr_sized(inst.modrm_rm(), size))
    }
}

pub(crate) fn write_rm<B: CpuBus>(
    cpu: &mut Cpu,
    bus: &mut B,
    inst: &Instruction,
    pc: u64,
    size: OperandSize,
    value: u64,
) -> Result<(), CpuError> {
    if let Some(m) = inst.memory_ref() {
        let addr = effective_addr(&cpu.state, inst, pc, &m);
        bus.write_sized(addr, size.bytes(), value)?;
    } else if size == OperandSize::Bits8 {
        cpu.state.write_reg8(inst.modrm_rm(), inst.rex.is_some(), value);
    } else {
        cpu.state.write_gpr_sized(inst.modrm_rm(), size, value);
    }
    Ok(())
}

/// Read the ModRM.reg operand.
pub(crate) fn read_reg_operand(cpu: &Cpu, inst: &Instruction, size: OperandSize) -> u64 {
    if size == OperandSize::Bits8 {
        cpu.state.read_reg8(inst.modrm_reg(), inst.rex.is_some())
    } else {
        cpu.state.read_gpr_sized(inst.modrm_reg(), size)
    }
}

pub(crate) fn write_reg_operand(cpu: &mut Cpu, inst: &Instruction, size: OperandSize, value: u64) {
    if size == OperandSize::Bits8 {
        cpu.state.write_reg8(inst.modrm_reg(), inst.rex.is_some(), value);
    } else {
        cpu.state.write_gpr_sized(inst.modrm_reg(), size, value);
    }
}
