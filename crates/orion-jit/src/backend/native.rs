//! Host x86-64 code emission for fully-lowered blocks.
//!
//! Only blocks whose optimized IR is pure register traffic qualify: moves,
//! flag-free binary ops, and a static exit. Anything touching memory,
//! architectural flags, or a conditional exit stays on the IR evaluator.
//!
//! Emitted code follows one calling convention: `rdi` points at the guest
//! GPR file (16 slots, encoding order) and the return value is the next
//! guest RIP. Guest registers live in that array; allocator-assigned temps
//! live in host scratch registers, overflowing to a small stack frame.

use crate::backend::code_buffer::CodeBuffer;
use crate::ir::{BinOp, BlockIr, IrOp, Operand, Place};
use crate::liveness::Assignment;
use crate::regalloc::AllocationResult;

/// Host registers handed to the allocator: SysV caller-saved, minus `rdi`
/// (GPR file pointer) and `r10`/`r11` (emitter scratch).
pub const POOL: [u8; 6] = [0, 1, 2, 6, 8, 9]; // rax rcx rdx rsi r8 r9

const ACC: u8 = 11; // r11
const TMP: u8 = 10; // r10
const RBP: u8 = 5;
const RDI: u8 = 7;

pub struct NativeBlock {
    code: CodeBuffer,
    code_len: usize,
}

impl NativeBlock {
    /// Run the block against the guest GPR file; returns the next RIP.
    pub fn run(&self, gprs: &mut [u64; 16]) -> u64 {
        // SAFETY: the buffer holds a function emitted by `compile` for
        // exactly this signature, and `gprs` provides the 16 slots it
        // addresses.
        unsafe { self.code.entry()(gprs.as_mut_ptr()) }
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

/// Emit host code for the block, or `None` when it does not qualify.
pub fn compile(ir: &BlockIr, alloc: &AllocationResult) -> Option<NativeBlock> {
    if !eligible(ir) {
        return None;
    }

    let mut assign: Vec<Option<Assignment>> = vec![None; ir.temp_count as usize];
    for range in &alloc.ranges {
        assign[range.temp.0 as usize] = range.assignment;
    }

    let mut asm = Asm::default();
    let frame = (alloc.spill_bytes + 15) & !15;
    asm.prologue(frame);

    for op in &ir.ops {
        match op {
            IrOp::Set { dst, src } => {
                asm.load(&assign, ACC, *src);
                asm.store(&assign, *dst, ACC);
            }
            IrOp::Bin {
                dst,
                op,
                lhs,
                rhs,
                set_flags: false,
            } => {
                asm.load(&assign, ACC, *lhs);
                match op {
                    BinOp::Shl | BinOp::ShrU | BinOp::SarS => {
                        let Operand::Imm(count) = rhs else {
                            unreachable!("eligibility admits only immediate shift counts");
                        };
                        asm.shift_ri(shift_ext(*op), ACC, *count as u8);
                    }
                    BinOp::Mul => {
                        asm.load(&assign, TMP, *rhs);
                        asm.imul_rr(ACC, TMP);
                    }
                    _ => {
                        if let Operand::Imm(v) = rhs {
                            if let Ok(imm) = i32::try_from(*v) {
                                asm.alu_ri(alu_ext(*op), ACC, imm);
                                asm.store(&assign, *dst, ACC);
                                continue;
                            }
                        }
                        asm.load(&assign, TMP, *rhs);
                        asm.alu_rr(alu_opcode(*op), ACC, TMP);
                    }
                }
                asm.store(&assign, *dst, ACC);
            }
            IrOp::Exit { next_rip } => {
                // Return value in rax; any temp it held is dead here.
                asm.load(&assign, 0, *next_rip);
                asm.epilogue();
            }
            _ => unreachable!("eligibility rejected this op"),
        }
    }

    let code_len = asm.buf.len();
    CodeBuffer::executable(&asm.buf).map(|code| NativeBlock { code, code_len })
}

fn eligible(ir: &BlockIr) -> bool {
    ir.ops.iter().all(|op| match op {
        IrOp::Set { .. } | IrOp::Exit { .. } => true,
        IrOp::Bin {
            op, rhs, set_flags, ..
        } => {
            !set_flags
                && match op {
                    BinOp::Shl | BinOp::ShrU | BinOp::SarS => {
                        matches!(*rhs, Operand::Imm(c) if (0..64).contains(&c))
                    }
                    _ => true,
                }
        }
        _ => false,
    })
}

fn alu_opcode(op: BinOp) -> u8 {
    match op {
        BinOp::Add => 0x01,
        BinOp::Or => 0x09,
        BinOp::And => 0x21,
        BinOp::Sub => 0x29,
        BinOp::Xor => 0x31,
        _ => unreachable!(),
    }
}

fn alu_ext(op: BinOp) -> u8 {
    match op {
        BinOp::Add => 0,
        BinOp::Or => 1,
        BinOp::And => 4,
        BinOp::Sub => 5,
        BinOp::Xor => 6,
        _ => unreachable!(),
    }
}

fn shift_ext(op: BinOp) -> u8 {
    match op {
        BinOp::Shl => 4,
        BinOp::ShrU => 5,
        BinOp::SarS => 7,
        _ => unreachable!(),
    }
}

/// Minimal 64-bit assembler over a byte buffer.
#[derive(Default)]
struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    fn rex(&mut self, reg: u8, rm: u8) {
        self.buf.push(0x48 | ((reg >> 3) << 2) | (rm >> 3));
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.buf.push((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    fn prologue(&mut self, frame: u32) {
        self.buf.push(0x55); // push rbp
        self.buf.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        if frame > 0 {
            self.buf.extend_from_slice(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
            self.buf.extend_from_slice(&frame.to_le_bytes());
        }
    }

    fn epilogue(&mut self) {
        self.buf.push(0xC9); // leave
        self.buf.push(0xC3); // ret
    }

    fn mov_ri(&mut self, dst: u8, imm: u64) {
        self.rex(0, dst);
        self.buf.push(0xB8 | (dst & 7));
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    fn mov_rr(&mut self, dst: u8, src: u8) {
        self.rex(src, dst);
        self.buf.push(0x89);
        self.modrm(3, src, dst);
    }

    /// mov dst, [rdi + 8*guest]
    fn mov_r_gpr(&mut self, dst: u8, guest: u8) {
        self.rex(dst, RDI);
        self.buf.push(0x8B);
        self.modrm(1, dst, RDI);
        self.buf.push(guest * 8);
    }

    /// mov [rdi + 8*guest], src
    fn mov_gpr_r(&mut self, guest: u8, src: u8) {
        self.rex(src, RDI);
        self.buf.push(0x89);
        self.modrm(1, src, RDI);
        self.buf.push(guest * 8);
    }

    /// mov dst, [rbp + off]
    fn mov_r_spill(&mut self, dst: u8, off: i32) {
        self.rex(dst, RBP);
        self.buf.push(0x8B);
        self.modrm(2, dst, RBP);
        self.buf.extend_from_slice(&off.to_le_bytes());
    }

    /// mov [rbp + off], src
    fn mov_spill_r(&mut self, off: i32, src: u8) {
        self.rex(src, RBP);
        self.buf.push(0x89);
        self.modrm(2, src, RBP);
        self.buf.extend_from_slice(&off.to_le_bytes());
    }

    fn alu_rr(&mut self, opcode: u8, dst: u8, src: u8) {
        self.rex(src, dst);
        self.buf.push(opcode);
        self.modrm(3, src, dst);
    }

    fn alu_ri(&mut self, ext: u8, dst: u8, imm: i32) {
        self.rex(0, dst);
        self.buf.push(0x81);
        self.modrm(3, ext, dst);
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    fn imul_rr(&mut self, dst: u8, src: u8) {
        self.rex(dst, src);
        self.buf.push(0x0F);
        self.buf.push(0xAF);
        self.modrm(3, dst, src);
    }

    fn shift_ri(&mut self, ext: u8, dst: u8, count: u8) {
        self.rex(0, dst);
        self.buf.push(0xC1);
        self.modrm(3, ext, dst);
        self.buf.push(count);
    }

    fn load(&mut self, assign: &[Option<Assignment>], host: u8, operand: Operand) {
        match operand {
            Operand::Imm(v) => self.mov_ri(host, v as u64),
            Operand::Reg(g) => self.mov_r_gpr(host, g),
            Operand::Temp(t) => match assign[t.0 as usize] {
                Some(Assignment::Reg(i)) => self.mov_rr(host, POOL[i as usize]),
                Some(Assignment::Spill(off)) => self.mov_r_spill(host, off),
                None => unreachable!("use of unallocated temp"),
            },
        }
    }

    fn store(&mut self, assign: &[Option<Assignment>], place: Place, host: u8) {
        match place {
            Place::Reg(g) => self.mov_gpr_r(g, host),
            Place::Temp(t) => match assign[t.0 as usize] {
                Some(Assignment::Reg(i)) => self.mov_rr(POOL[i as usize], host),
                Some(Assignment::Spill(off)) => self.mov_spill_r(off, host),
                None => unreachable!("definition of unallocated temp"),
            },
        }
    }
}
