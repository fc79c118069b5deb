//! Pure constant folds: given an operation family, a width and concrete
//! operand values, compute the value the generated code would have produced.
//!
//! Shift amounts at or above the operation width are undefined inputs for the
//! generated code, so the fold may return any value; it settles on the
//! mathematical limit (zero, or all-ones for an arithmetic shift of a
//! negative value) and never faults. Rotation amounts are reduced modulo the
//! width, with a rotation by zero returning the value unchanged.

use crate::ir::{Arg, BinOp, Cond, UnaryOp, Width};
use crate::wordint::WordInt;

/// Fold a binary operation on two constants.
pub(crate) fn binary(op: BinOp, w: Width, x: Arg, y: Arg) -> Arg {
    let a = WordInt::new(w, x);
    let b = WordInt::new(w, y);
    let r = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::And => a.bitand(b),
        BinOp::Or => a.bitor(b),
        BinOp::Xor => a.bitxor(b),
        BinOp::Andc => a.bitand(b.not()),
        BinOp::Orc => a.bitor(b.not()),
        BinOp::Eqv => a.bitxor(b).not(),
        BinOp::Nand => a.bitand(b).not(),
        BinOp::Nor => a.bitor(b).not(),
        BinOp::Shl => a.checked_shl(b.val()).unwrap_or(WordInt::new(w, 0)),
        BinOp::Shr => a.checked_shr(b.val()).unwrap_or(WordInt::new(w, 0)),
        BinOp::Sar => a.checked_sar(b.val()).unwrap_or_else(|| {
            let fill = if a.as_signed() < 0 { u64::MAX } else { 0 };
            WordInt::new(w, fill)
        }),
        BinOp::Rotl => a.rotl(b.val()),
        BinOp::Rotr => a.rotr(b.val()),
    };
    r.val()
}

/// Fold a unary operation on a constant.
pub(crate) fn unary(op: UnaryOp, w: Width, x: Arg) -> Arg {
    let a = WordInt::new(w, x);
    let r = match op {
        UnaryOp::Not => a.not(),
        UnaryOp::Neg => a.wrapping_neg(),
        UnaryOp::Ext8s => a.sext_from(8),
        UnaryOp::Ext8u => a.zext_from(8),
        UnaryOp::Ext16s => a.sext_from(16),
        UnaryOp::Ext16u => a.zext_from(16),
        UnaryOp::Ext32s => a.sext_from(32),
        UnaryOp::Ext32u => a.zext_from(32),
    };
    r.val()
}

/// Fold a bitfield insert: replace `len` bits at `pos` in `base` with the low
/// `len` bits of `value`.
pub(crate) fn deposit(w: Width, base: Arg, value: Arg, pos: u64, len: u64) -> Arg {
    let mask = if len >= 64 { u64::MAX } else { (1u64 << len) - 1 };
    let r = (base & !(mask << pos)) | ((value & mask) << pos);
    r & w.mask()
}

/// Evaluate a comparison on two constants at the given width.
pub(crate) fn eval_cond(w: Width, x: Arg, y: Arg, cond: Cond) -> bool {
    let a = WordInt::new(w, x);
    let b = WordInt::new(w, y);
    match cond {
        Cond::Eq => a.val() == b.val(),
        Cond::Ne => a.val() != b.val(),
        Cond::Lt => a.as_signed() < b.as_signed(),
        Cond::Ge => a.as_signed() >= b.as_signed(),
        Cond::Le => a.as_signed() <= b.as_signed(),
        Cond::Gt => a.as_signed() > b.as_signed(),
        Cond::Ltu => a.val() < b.val(),
        Cond::Geu => a.val() >= b.val(),
        Cond::Leu => a.val() <= b.val(),
        Cond::Gtu => a.val() > b.val(),
    }
}

/// The answer a comparison gives when its operands are known to hold the same
/// value, without inspecting the value itself.
pub(crate) fn cond_when_equal(cond: Cond) -> bool {
    match cond {
        Cond::Eq | Cond::Ge | Cond::Le | Cond::Geu | Cond::Leu => true,
        Cond::Ne | Cond::Lt | Cond::Gt | Cond::Ltu | Cond::Gtu => false,
    }
}

/// Compose two 32-bit halves into the 64-bit value a double-word comparison
/// operates on.
pub(crate) fn compose64(lo: Arg, hi: Arg) -> u64 {
    ((hi & 0xffff_ffff) << 32) | (lo & 0xffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strum::EnumCount;

    #[test]
    fn binary_masks_to_width() {
        assert_eq!(binary(BinOp::Add, Width::W32, 0xffff_ffff, 1), 0);
        assert_eq!(binary(BinOp::Add, Width::W64, 0xffff_ffff, 1), 0x1_0000_0000);
        assert_eq!(binary(BinOp::Mul, Width::W32, 0x10000, 0x10000), 0);
        assert_eq!(binary(BinOp::Sub, Width::W32, 0, 1), 0xffff_ffff);
    }

    #[test]
    fn negated_operand_families() {
        assert_eq!(binary(BinOp::Andc, Width::W32, 0b1100, 0b1010), 0b0100);
        assert_eq!(
            binary(BinOp::Orc, Width::W32, 0b1100, 0b1010),
            0xffff_fffd
        );
        assert_eq!(binary(BinOp::Eqv, Width::W32, 0b1100, 0b1010), 0xffff_fff9);
        assert_eq!(binary(BinOp::Nand, Width::W32, 0b1100, 0b1010), 0xffff_fff7);
        assert_eq!(binary(BinOp::Nor, Width::W32, 0b1100, 0b1010), 0xffff_fff1);
    }

    #[test]
    fn oversize_shifts_do_not_fault() {
        // Undefined input: any value is fine, faulting is not.
        let _ = binary(BinOp::Shl, Width::W32, 1, 32);
        let _ = binary(BinOp::Shr, Width::W32, 1, 100);
        let _ = binary(BinOp::Sar, Width::W64, u64::MAX, 64);
    }

    #[test]
    fn sar_preserves_the_sign_bit() {
        assert_eq!(binary(BinOp::Sar, Width::W32, 0x8000_0000, 31), 0xffff_ffff);
        assert_eq!(binary(BinOp::Sar, Width::W64, 1 << 63, 63), u64::MAX);
        assert_eq!(binary(BinOp::Sar, Width::W32, 0x4000_0000, 30), 1);
    }

    #[test]
    fn unary_extends() {
        assert_eq!(unary(UnaryOp::Ext8s, Width::W32, 0x80), 0xffff_ff80);
        assert_eq!(unary(UnaryOp::Ext8u, Width::W32, 0xfff80), 0x80);
        assert_eq!(unary(UnaryOp::Ext16s, Width::W64, 0x8000), 0xffff_ffff_ffff_8000);
        assert_eq!(unary(UnaryOp::Ext32s, Width::W64, 0x8000_0000), 0xffff_ffff_8000_0000);
        assert_eq!(unary(UnaryOp::Ext32u, Width::W64, u64::MAX), 0xffff_ffff);
        assert_eq!(unary(UnaryOp::Not, Width::W32, 0), 0xffff_ffff);
        assert_eq!(unary(UnaryOp::Neg, Width::W32, 1), 0xffff_ffff);
    }

    #[test]
    fn deposit_inserts_a_bitfield() {
        // Replace bits [8, 16) of the base.
        assert_eq!(
            deposit(Width::W32, 0xaaaa_aaaa, 0xff, 8, 8),
            0xaaaa_ffaa
        );
        // A deposit of the full width is a plain overwrite.
        assert_eq!(deposit(Width::W32, 0x1234_5678, 0x9abc_def0, 0, 32), 0x9abc_def0);
        assert_eq!(deposit(Width::W64, u64::MAX, 0, 0, 64), 0);
    }

    #[test]
    fn signed_and_unsigned_predicates_differ() {
        // -1 < 1 signed, but 0xffffffff > 1 unsigned.
        assert!(eval_cond(Width::W32, 0xffff_ffff, 1, Cond::Lt));
        assert!(eval_cond(Width::W32, 0xffff_ffff, 1, Cond::Gtu));
        assert!(eval_cond(Width::W64, u64::MAX, 1, Cond::Lt));
        assert!(!eval_cond(Width::W64, u64::MAX, 1, Cond::Ltu));
    }

    #[test]
    fn compose64_joins_halves() {
        assert_eq!(compose64(0x9abc_def0, 0x1234_5678), 0x1234_5678_9abc_def0);
        // Upper garbage in a half is ignored.
        assert_eq!(compose64(0xf_0000_0001, 0), 1);
    }

    proptest! {
        #[test]
        fn eval_cond_matches_native_32(x in any::<u32>(), y in any::<u32>(), c in 0usize..Cond::COUNT) {
            let cond = Cond::from_repr(c as u8).unwrap();
            let expect = match cond {
                Cond::Eq => x == y,
                Cond::Ne => x != y,
                Cond::Lt => (x as i32) < (y as i32),
                Cond::Ge => (x as i32) >= (y as i32),
                Cond::Le => (x as i32) <= (y as i32),
                Cond::Gt => (x as i32) > (y as i32),
                Cond::Ltu => x < y,
                Cond::Geu => x >= y,
                Cond::Leu => x <= y,
                Cond::Gtu => x > y,
            };
            prop_assert_eq!(eval_cond(Width::W32, u64::from(x), u64::from(y), cond), expect);
        }

        // Exchanging the operands while swapping the predicate never changes
        // the answer; inverting the predicate always flips it.
        #[test]
        fn swap_and_invert_laws(x in any::<u64>(), y in any::<u64>(), c in 0usize..Cond::COUNT) {
            let cond = Cond::from_repr(c as u8).unwrap();
            for w in [Width::W32, Width::W64] {
                let r = eval_cond(w, x, y, cond);
                prop_assert_eq!(eval_cond(w, y, x, cond.swap()), r);
                prop_assert_eq!(eval_cond(w, x, y, cond.invert()), !r);
            }
        }

        // The equal-operands shortcut agrees with actually comparing equal
        // values.
        #[test]
        fn cond_when_equal_law(x in any::<u64>(), c in 0usize..Cond::COUNT) {
            let cond = Cond::from_repr(c as u8).unwrap();
            for w in [Width::W32, Width::W64] {
                prop_assert_eq!(eval_cond(w, x, x, cond), cond_when_equal(cond));
            }
        }
    }
}
