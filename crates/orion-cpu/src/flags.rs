//! ALU flag computation shared by the interpreter and the JIT backends.
//!
//! Every helper masks its inputs to `size` bytes and returns the masked
//! result, so callers can pass full-width register values unconditionally.

use crate::state::RFlags;

#[inline]
pub fn mask_for_size(size: usize) -> u64 {
    if size == 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

#[inline]
fn sign_bit(size: usize) -> u64 {
    1u64 << (size * 8 - 1)
}

#[inline]
fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn set_result_flags(rflags: &mut RFlags, result: u64, size: usize) {
    rflags.set(RFlags::ZF, result == 0);
    rflags.set(RFlags::SF, result & sign_bit(size) != 0);
    rflags.set(RFlags::PF, parity(result as u8));
}

pub fn add_with_flags(
    rflags: &mut RFlags,
    dest: u64,
    src: u64,
    carry_in: bool,
    size: usize,
) -> u64 {
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let src = src & mask;
    let full = (dest as u128) + (src as u128) + (carry_in as u128);
    let result = full as u64 & mask;

    let sb = sign_bit(size);
    rflags.set(RFlags::CF, full > mask as u128);
    rflags.set(RFlags::OF, (dest ^ result) & (src ^ result) & sb != 0);
    rflags.set(RFlags::AF, (dest ^ src ^ result) & 0x10 != 0);
    set_result_flags(rflags, result, size);
    result
}

pub fn sub_with_flags(
    rflags: &mut RFlags,
    dest: u64,
    src: u64,
    borrow_in: bool,
    size: usize,
) -> u64 {
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = (src as u128) + (borrow_in as u128);
    let result = (dest as u128).wrapping_sub(subtrahend) as u64 & mask;

    let sb = sign_bit(size);
    let src2 = src.wrapping_add(borrow_in as u64) & mask;
    rflags.set(RFlags::CF, (dest as u128) < subtrahend);
    rflags.set(RFlags::OF, (dest ^ src2) & (dest ^ result) & sb != 0);
    rflags.set(RFlags::AF, (dest ^ src2 ^ result) & 0x10 != 0);
    set_result_flags(rflags, result, size);
    result
}

/// CMP: SUB flags without a result.
pub fn cmp_with_flags(rflags: &mut RFlags, dest: u64, src: u64, size: usize) {
    let _ = sub_with_flags(rflags, dest, src, false, size);
}

/// AND/OR/XOR/TEST: CF and OF cleared, AF undefined (left cleared).
pub fn logic_with_flags(rflags: &mut RFlags, result: u64, size: usize) -> u64 {
    let result = result & mask_for_size(size);
    rflags.set(RFlags::CF, false);
    rflags.set(RFlags::OF, false);
    rflags.set(RFlags::AF, false);
    set_result_flags(rflags, result, size);
    result
}

/// INC: ADD by one, CF untouched.
pub fn inc_with_flags(rflags: &mut RFlags, dest: u64, size: usize) -> u64 {
    let cf = rflags.contains(RFlags::CF);
    let result = add_with_flags(rflags, dest, 1, false, size);
    rflags.set(RFlags::CF, cf);
    result
}

/// DEC: SUB by one, CF untouched.
pub fn dec_with_flags(rflags: &mut RFlags, dest: u64, size: usize) -> u64 {
    let cf = rflags.contains(RFlags::CF);
    let result = sub_with_flags(rflags, dest, 1, false, size);
    rflags.set(RFlags::CF, cf);
    result
}

/// NEG: SUB from zero; CF set when the operand was non-zero.
pub fn neg_with_flags(rflags: &mut RFlags, dest: u64, size: usize) -> u64 {
    sub_with_flags(rflags, 0, dest, false, size)
}

/// SHL/SAL. Count is masked to 6 bits (5 below 64-bit width) before use.
pub fn shl_with_flags(rflags: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let count = mask_count(count, size);
    if count == 0 {
        return dest & mask_for_size(size);
    }
    let mask = mask_for_size(size);
    let dest = dest & mask;
    let bits = size as u32 * 8;
    let result = if count >= bits { 0 } else { (dest << count) & mask };

    let cf = count <= bits && dest >> (bits - count) & 1 != 0;
    rflags.set(RFlags::CF, cf);
    if count == 1 {
        // OF: sign changed.
        rflags.set(RFlags::OF, (result & sign_bit(size) != 0) != cf);
    }
    set_result_flags(rflags, result, size);
    result
}

/// SHR (logical right shift).
pub fn shr_with_flags(rflags: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let count = mask_count(count, size);
    if count == 0 {
        return dest & mask_for_size(size);
    }
    let dest = dest & mask_for_size(size);
    let bits = size as u32 * 8;
    let result = if count >= bits { 0 } else { dest >> count };

    rflags.set(RFlags::CF, count <= bits && dest >> (count - 1) & 1 != 0);
    if count == 1 {
        rflags.set(RFlags::OF, dest & sign_bit(size) != 0);
    }
    set_result_flags(rflags, result, size);
    result
}

/// SAR (arithmetic right shift).
pub fn sar_with_flags(rflags: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let count = mask_count(count, size);
    let mask = mask_for_size(size);
    if count == 0 {
        return dest & mask;
    }
    let bits = size as u32 * 8;
    let signed = sign_extend(dest, size);
    let shift = count.min(bits - 1);
    let mut result = (signed >> shift) as u64 & mask;
    let mut cf = signed >> (count.min(bits) - 1) & 1 != 0;
    if count >= bits {
        result = if signed < 0 { mask } else { 0 };
        cf = signed < 0;
    }

    rflags.set(RFlags::CF, cf);
    if count == 1 {
        rflags.set(RFlags::OF, false);
    }
    set_result_flags(rflags, result, size);
    result
}

/// ROL. Only CF (and OF for count 1) are affected.
pub fn rol_with_flags(rflags: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let bits = size as u32 * 8;
    let count = mask_count(count, size) % bits;
    let mask = mask_for_size(size);
    let dest = dest & mask;
    if count == 0 {
        return dest;
    }
    let result = ((dest << count) | (dest >> (bits - count))) & mask;
    let cf = result & 1 != 0;
    rflags.set(RFlags::CF, cf);
    if count == 1 {
        rflags.set(RFlags::OF, (result & sign_bit(size) != 0) != cf);
    }
    result
}

/// ROR.
pub fn ror_with_flags(rflags: &mut RFlags, dest: u64, count: u64, size: usize) -> u64 {
    let bits = size as u32 * 8;
    let count = mask_count(count, size) % bits;
    let mask = mask_for_size(size);
    let dest = dest & mask;
    if count == 0 {
        return dest;
    }
    let result = ((dest >> count) | (dest << (bits - count))) & mask;
    rflags.set(RFlags::CF, result & sign_bit(size) != 0);
    if count == 1 {
        let top = result & sign_bit(size) != 0;
        let next = result & (sign_bit(size) >> 1) != 0;
        rflags.set(RFlags::OF, top != next);
    }
    result
}

#[inline]
fn mask_count(count: u64, size: usize) -> u32 {
    let m = if size == 8 { 0x3F } else { 0x1F };
    (count & m) as u32
}

/// Sign-extend the low `size` bytes to i64.
#[inline]
pub fn sign_extend(value: u64, size: usize) -> i64 {
    match size {
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        4 => value as u32 as i32 as i64,
        _ => value as i64,
    }
}

/// MUL flags: CF/OF set when the upper half of the product is significant.
pub fn mul_flags(rflags: &mut RFlags, high_significant: bool) {
    rflags.set(RFlags::CF, high_significant);
    rflags.set(RFlags::OF, high_significant);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_carry_and_overflow() {
        let mut fl = RFlags::default();
        let r = add_with_flags(&mut fl, 0xFF, 1, false, 1);
        assert_eq!(r, 0);
        assert!(fl.contains(RFlags::CF) && fl.contains(RFlags::ZF));
        assert!(!fl.contains(RFlags::OF));

        let r = add_with_flags(&mut fl, 0x7F, 1, false, 1);
        assert_eq!(r, 0x80);
        assert!(fl.contains(RFlags::OF) && fl.contains(RFlags::SF));
        assert!(!fl.contains(RFlags::CF));
    }

    #[test]
    fn sub_borrow() {
        let mut fl = RFlags::default();
        let r = sub_with_flags(&mut fl, 0, 1, false, 4);
        assert_eq!(r, 0xFFFF_FFFF);
        assert!(fl.contains(RFlags::CF) && fl.contains(RFlags::SF));

        let r = sub_with_flags(&mut fl, 5, 5, false, 4);
        assert_eq!(r, 0);
        assert!(fl.contains(RFlags::ZF) && !fl.contains(RFlags::CF));
    }

    #[test]
    fn sbb_includes_borrow_in() {
        let mut fl = RFlags::default();
        let r = sub_with_flags(&mut fl, 5, 4, true, 4);
        assert_eq!(r, 0);
        assert!(fl.contains(RFlags::ZF));
        // 0 - 0 with borrow wraps.
        let r = sub_with_flags(&mut fl, 0, 0, true, 1);
        assert_eq!(r, 0xFF);
        assert!(fl.contains(RFlags::CF));
    }

    #[test]
    fn inc_dec_preserve_cf() {
        let mut fl = RFlags::default() | RFlags::CF;
        let r = inc_with_flags(&mut fl, 0x7FFF_FFFF, 4);
        assert_eq!(r, 0x8000_0000);
        assert!(fl.contains(RFlags::CF), "INC must not clobber CF");
        assert!(fl.contains(RFlags::OF));

        fl.set(RFlags::CF, false);
        let r = dec_with_flags(&mut fl, 0, 4);
        assert_eq!(r, 0xFFFF_FFFF);
        assert!(!fl.contains(RFlags::CF), "DEC must not set CF on wrap");
    }

    #[test]
    fn logic_clears_cf_of() {
        let mut fl = RFlags::default() | RFlags::CF | RFlags::OF;
        let r = logic_with_flags(&mut fl, 0xF0 & 0x0F, 1);
        assert_eq!(r, 0);
        assert!(fl.contains(RFlags::ZF));
        assert!(!fl.contains(RFlags::CF) && !fl.contains(RFlags::OF));
    }

    #[test]
    fn parity_counts_low_byte_only() {
        let mut fl = RFlags::default();
        logic_with_flags(&mut fl, 0x3, 4); // two bits set: even parity
        assert!(fl.contains(RFlags::PF));
        logic_with_flags(&mut fl, 0x7, 4); // three bits
        assert!(!fl.contains(RFlags::PF));
        logic_with_flags(&mut fl, 0xFF00, 4); // high byte ignored
        assert!(fl.contains(RFlags::PF));
    }

    #[test]
    fn shifts_update_cf() {
        let mut fl = RFlags::default();
        let r = shl_with_flags(&mut fl, 0x80, 1, 1);
        assert_eq!(r, 0);
        assert!(fl.contains(RFlags::CF) && fl.contains(RFlags::ZF));

        let r = shr_with_flags(&mut fl, 0x3, 1, 1);
        assert_eq!(r, 1);
        assert!(fl.contains(RFlags::CF));

        let r = sar_with_flags(&mut fl, 0x80, 1, 1);
        assert_eq!(r, 0xC0);

        // Count of zero leaves flags untouched.
        fl.set(RFlags::CF, true);
        shl_with_flags(&mut fl, 1, 0, 4);
        assert!(fl.contains(RFlags::CF));
    }

    #[test]
    fn rotates() {
        let mut fl = RFlags::default();
        assert_eq!(rol_with_flags(&mut fl, 0x80, 1, 1), 0x01);
        assert!(fl.contains(RFlags::CF));
        assert_eq!(ror_with_flags(&mut fl, 0x01, 1, 1), 0x80);
        assert!(fl.contains(RFlags::CF));
    }

    #[test]
    fn sign_extend_widths() {
        assert_eq!(sign_extend(0x80, 1), -128);
        assert_eq!(sign_extend(0x7F, 1), 127);
        assert_eq!(sign_extend(0xFFFF_FFFF, 4), -1);
    }
}
