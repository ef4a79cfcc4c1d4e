//! Differential length checks against iced-x86.
//!
//! For every encoding in the supported subset, the hand-rolled decoder must
//! consume exactly the byte count an independent reference decoder does.

use iced_x86::{Decoder, DecoderOptions};

fn iced_len(bytes: &[u8]) -> usize {
    let mut decoder = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
    let inst = decoder.decode();
    assert!(!inst.is_invalid(), "iced rejected {bytes:02X?}");
    inst.len()
}

fn assert_same_len(bytes: &[u8]) {
    let ours = orion_x86::decode(bytes).expect("decode failed").len as usize;
    assert_eq!(ours, iced_len(bytes), "length mismatch for {bytes:02X?}");
}

#[test]
fn mov_forms() {
    assert_same_len(&[0xB8, 0x0A, 0x00, 0x00, 0x00]); // mov eax, 10
    assert_same_len(&[0x48, 0xC7, 0xC0, 0x0A, 0x00, 0x00, 0x00]); // mov rax, 10
    assert_same_len(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]); // mov rax, imm64
    assert_same_len(&[0xB0, 0x7F]); // mov al, 0x7f
    assert_same_len(&[0x66, 0xB8, 0x34, 0x12]); // mov ax, 0x1234
    assert_same_len(&[0x89, 0xD8]); // mov eax, ebx
    assert_same_len(&[0x48, 0x89, 0xD8]); // mov rax, rbx
    assert_same_len(&[0x88, 0x45, 0x10]); // mov [rbp+0x10], al
    assert_same_len(&[0x48, 0x8B, 0x04, 0x25, 0x00, 0x02, 0x00, 0x00]); // mov rax, [0x200]
    assert_same_len(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]); // mov rax, [rip+0x10]
    assert_same_len(&[0x4C, 0x8B, 0x64, 0xC8, 0x08]); // mov r12, [rax+rcx*8+8]
    assert_same_len(&[0xC6, 0x00, 0x42]); // mov byte [rax], 0x42
    assert_same_len(&[0x48, 0xC7, 0x84, 0x98, 0x00, 0x01, 0x00, 0x00, 0x05, 0, 0, 0]);
}

#[test]
fn alu_forms() {
    assert_same_len(&[0x01, 0xC8]); // add eax, ecx
    assert_same_len(&[0x48, 0x01, 0xC8]); // add rax, rcx
    assert_same_len(&[0x48, 0x83, 0xC0, 0x05]); // add rax, 5
    assert_same_len(&[0x48, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]); // add rax, 0x100
    assert_same_len(&[0x29, 0xC8]); // sub eax, ecx
    assert_same_len(&[0x48, 0x2D, 0x10, 0x00, 0x00, 0x00]); // sub rax, 0x10
    assert_same_len(&[0x31, 0xC0]); // xor eax, eax
    assert_same_len(&[0x48, 0x39, 0xC8]); // cmp rax, rcx
    assert_same_len(&[0x3C, 0x05]); // cmp al, 5
    assert_same_len(&[0x48, 0xF7, 0xE3]); // mul rbx
    assert_same_len(&[0x48, 0xF7, 0xF3]); // div rbx
    assert_same_len(&[0x48, 0x0F, 0xAF, 0xC3]); // imul rax, rbx
    assert_same_len(&[0x48, 0x6B, 0xC0, 0x03]); // imul rax, rax, 3
    assert_same_len(&[0x48, 0x69, 0xC0, 0x00, 0x01, 0x00, 0x00]); // imul rax, rax, 0x100
    assert_same_len(&[0x48, 0xFF, 0xC0]); // inc rax
    assert_same_len(&[0x48, 0xFF, 0xC8]); // dec rax
    assert_same_len(&[0xFE, 0xC0]); // inc al
    assert_same_len(&[0x48, 0xC1, 0xE0, 0x04]); // shl rax, 4
    assert_same_len(&[0x48, 0xD1, 0xE8]); // shr rax, 1
    assert_same_len(&[0x48, 0xF7, 0xD8]); // neg rax
    assert_same_len(&[0x48, 0x85, 0xC0]); // test rax, rax
    assert_same_len(&[0xA8, 0x01]); // test al, 1
    assert_same_len(&[0x48, 0x8D, 0x44, 0x88, 0x10]); // lea rax, [rax+rcx*4+0x10]
}

#[test]
fn control_flow_forms() {
    assert_same_len(&[0xEB, 0x05]);
    assert_same_len(&[0xE9, 0x00, 0x01, 0x00, 0x00]);
    assert_same_len(&[0xE8, 0x00, 0x01, 0x00, 0x00]);
    assert_same_len(&[0x74, 0x10]); // jz
    assert_same_len(&[0x75, 0xF0]); // jnz backwards
    assert_same_len(&[0x0F, 0x84, 0x00, 0x01, 0x00, 0x00]);
    assert_same_len(&[0x0F, 0x8F, 0x00, 0x01, 0x00, 0x00]);
    assert_same_len(&[0xC3]);
    assert_same_len(&[0xC2, 0x10, 0x00]);
    assert_same_len(&[0xFF, 0xE0]); // jmp rax
    assert_same_len(&[0xFF, 0xD0]); // call rax
    assert_same_len(&[0xCC]);
    assert_same_len(&[0xCD, 0x80]);
    assert_same_len(&[0xCF]); // iret (iced: iretd)
    assert_same_len(&[0x0F, 0x05]); // syscall
    assert_same_len(&[0xF4]); // hlt
}

#[test]
fn stack_and_string_forms() {
    for op in 0x50..=0x5Fu8 {
        assert_same_len(&[op]);
    }
    assert_same_len(&[0x41, 0x54]); // push r12
    assert_same_len(&[0x68, 0x00, 0x01, 0x00, 0x00]); // push imm32
    assert_same_len(&[0x6A, 0x10]); // push imm8
    assert_same_len(&[0xF3, 0xA4]); // rep movsb
    assert_same_len(&[0xF3, 0x48, 0xA5]); // rep movsq
    assert_same_len(&[0xF3, 0xAA]); // rep stosb
    assert_same_len(&[0xF2, 0xAE]); // repne scasb
    assert_same_len(&[0xA6]); // cmpsb
    assert_same_len(&[0xAC]); // lodsb
}

#[test]
fn simd_and_wide_moves() {
    assert_same_len(&[0x0F, 0x10, 0x00]); // movups xmm0, [rax]
    assert_same_len(&[0x0F, 0x11, 0x00]); // movups [rax], xmm0
    assert_same_len(&[0x66, 0x0F, 0x6F, 0x00]); // movdqa xmm0, [rax]
    assert_same_len(&[0xF3, 0x0F, 0x6F, 0x00]); // movdqu xmm0, [rax]
    assert_same_len(&[0x66, 0x0F, 0xEF, 0xC0]); // pxor xmm0, xmm0
    assert_same_len(&[0x48, 0x0F, 0xB6, 0xC0]); // movzx rax, al
    assert_same_len(&[0x48, 0x0F, 0xBF, 0xC0]); // movsx rax, ax
    assert_same_len(&[0x48, 0x63, 0xC0]); // movsxd rax, eax
}
