//! The IR optimiser: constant propagation, copy propagation, constant folding
//! and local algebraic simplification over one translation unit's operation
//! stream.
//!
//! The optimiser makes a single forward scan. For each operation it first
//! substitutes inputs using what is already known (a use of a copy is
//! redirected to the best-known holder of the same value), canonicalises
//! commutative operand order, applies identity simplifications, and finally
//! either folds the operation away or passes it through while invalidating
//! whatever the operation clobbers. Facts never survive a basic-block
//! boundary.
//!
//! Rewriting is in place: the write cursor over the argument buffer never
//! overtakes the read cursor because every rewrite preserves or shortens an
//! operation's argument count. Operations that disappear entirely are
//! replaced by [Opcode::Nop] (with no arguments) so that the opcode buffer
//! keeps its length; downstream consumers skip nops.

mod fold;
mod state;

use crate::ir::{
    call_arity, temp, temp_arg, Arg, BinOp, Cond, OpFlags, OpKind, Opcode, TransContext, Width,
    CALL_NO_READ_GLOBALS, CALL_NO_WRITE_GLOBALS,
};
use crate::CodegenError;
use smallvec::SmallVec;
use state::{Known, TempValues};

/// Scratch copy of one operation's arguments. Most operations carry at most
/// six arguments; calls can spill to the heap.
type ArgVec = SmallVec<[Arg; 8]>;

/// Optimise the operation stream in place.
///
/// `ops` and `args` are the caller-owned stream produced by the front end;
/// `ctx` classifies the temps the stream refers to. On return the opcode
/// buffer has been rewritten in place (eliminated operations are
/// [Opcode::Nop]) and the argument buffer compacted; the returned cursor
/// points one past the last argument written.
///
/// Errors indicate a malformed stream, i.e. a front-end bug; the stream and
/// the state table are left in an unspecified (but memory-safe) state.
pub fn optimise(
    ctx: &TransContext,
    ops: &mut [Opcode],
    args: &mut [Arg],
) -> Result<usize, CodegenError> {
    let opt = Opt {
        vals: TempValues::new(ctx),
        ops,
        args,
        rpos: 0,
        wpos: 0,
        n_elided: 0,
    };
    opt.run()
}

struct Opt<'a> {
    vals: TempValues<'a>,
    ops: &'a mut [Opcode],
    args: &'a mut [Arg],
    /// Read cursor into `args`: the start of the next unread operation's
    /// arguments.
    rpos: usize,
    /// Write cursor into `args`. Always <= `rpos` between operations.
    wpos: usize,
    n_elided: usize,
}

impl Opt<'_> {
    fn run(mut self) -> Result<usize, CodegenError> {
        let mut idx = 0;
        while idx < self.ops.len() {
            idx += self.step(idx)?;
        }
        log::debug!(
            "optimised {} ops: {} elided, {} -> {} args",
            self.ops.len(),
            self.n_elided,
            self.rpos,
            self.wpos
        );
        Ok(self.wpos)
    }

    /// Process the operation at `idx`, returning how many opcode slots were
    /// consumed (two when a double-word fold claims its reserved nop slot).
    fn step(&mut self, idx: usize) -> Result<usize, CodegenError> {
        let op = self.ops[idx];
        let n_args = match op.kind() {
            OpKind::Call => {
                let packed = *self
                    .args
                    .get(self.rpos)
                    .ok_or_else(|| short_stream(idx, op))?;
                let (n_out, n_in) = call_arity(packed);
                3 + n_out + n_in
            }
            _ => op.def().total_args(),
        };
        if self.rpos + n_args > self.args.len() {
            return Err(short_stream(idx, op));
        }
        // Arguments are copied out before anything is written back: the write
        // cursor may already be inside this operation's argument range.
        let mut a: ArgVec = SmallVec::from_slice(&self.args[self.rpos..self.rpos + n_args]);
        self.rpos += n_args;

        self.substitute_inputs(op, &mut a);
        self.canonicalise(idx, op, &mut a)?;
        if self.try_identities(idx, op, &a)? {
            return Ok(1);
        }
        self.rewrite(idx, op, &a)
    }

    /// Phase 1: replace every input in copy state with the best-known holder
    /// of the same value.
    fn substitute_inputs(&mut self, op: Opcode, a: &mut ArgVec) {
        let (base, n_in) = match op.kind() {
            OpKind::Call => {
                let (n_out, n_in) = call_arity(a[0]);
                (1 + n_out, n_in)
            }
            _ => {
                let def = op.def();
                (def.n_out, def.n_in)
            }
        };
        for slot in a[base..base + n_in].iter_mut() {
            let t = temp(*slot);
            if matches!(self.vals.get(t), Known::Copy { .. }) {
                *slot = temp_arg(self.vals.best_copy(t));
            }
        }
    }

    /// Phase 2: canonicalise commutative operand order, rewriting the
    /// predicate where a comparison's operands are exchanged.
    fn canonicalise(&mut self, idx: usize, op: Opcode, a: &mut ArgVec) -> Result<(), CodegenError> {
        match op.kind() {
            OpKind::Binary(b) if b.is_commutative() => {
                self.swap_commutative(Some(a[0]), a, 1, 2);
            }
            OpKind::Brcond => {
                if self.swap_commutative(None, a, 0, 1) {
                    a[2] = self.cond_arg(idx, op, a[2])?.swap().arg();
                }
            }
            OpKind::Setcond => {
                if self.swap_commutative(Some(a[0]), a, 1, 2) {
                    a[3] = self.cond_arg(idx, op, a[3])?.swap().arg();
                }
            }
            OpKind::Movcond => {
                if self.swap_commutative(None, a, 1, 2) {
                    a[5] = self.cond_arg(idx, op, a[5])?.swap().arg();
                }
                // Make the "false" input alias the destination so the backend
                // can implement a move-if-true.
                if self.swap_commutative(Some(a[0]), a, 4, 3) {
                    a[5] = self.cond_arg(idx, op, a[5])?.invert().arg();
                }
            }
            OpKind::Add2 => {
                // The carry out of the low halves is insensitive to operand
                // order, so the halves may be swapped independently.
                let (dl, dh) = (a[0], a[1]);
                self.swap_commutative(Some(dl), a, 2, 4);
                self.swap_commutative(Some(dh), a, 3, 5);
            }
            OpKind::Mulu2 => {
                self.swap_commutative(Some(a[0]), a, 2, 3);
            }
            OpKind::Brcond2 => {
                if self.swap_commutative2(a, 0, 2) {
                    a[4] = self.cond_arg(idx, op, a[4])?.swap().arg();
                }
            }
            OpKind::Setcond2 => {
                if self.swap_commutative2(a, 1, 3) {
                    a[5] = self.cond_arg(idx, op, a[5])?.swap().arg();
                }
            }
            _ => (),
        }
        Ok(())
    }

    /// Move a constant into the right-hand slot. On a tie, prefer the layout
    /// `op d, d, x` (destination aliasing the left input), which non-RISC
    /// backends handle better.
    fn swap_commutative(&self, dest: Option<Arg>, a: &mut ArgVec, i: usize, j: usize) -> bool {
        let mut sum = 0i32;
        if self.vals.const_val(temp(a[i])).is_some() {
            sum += 1;
        }
        if self.vals.const_val(temp(a[j])).is_some() {
            sum -= 1;
        }
        if sum > 0 || (sum == 0 && dest == Some(a[j])) {
            a.swap(i, j);
            true
        } else {
            false
        }
    }

    /// Jointly swap the low/high operand pairs starting at `i` and `j` when
    /// that moves constants rightwards.
    fn swap_commutative2(&self, a: &mut ArgVec, i: usize, j: usize) -> bool {
        let mut sum = 0i32;
        for k in 0..2 {
            if self.vals.const_val(temp(a[i + k])).is_some() {
                sum += 1;
            }
            if self.vals.const_val(temp(a[j + k])).is_some() {
                sum -= 1;
            }
        }
        if sum > 0 {
            a.swap(i, j);
            a.swap(i + 1, j + 1);
            true
        } else {
            false
        }
    }

    /// Phase 3: identity simplifications on the binary families. Returns true
    /// if the operation was emitted in reduced form.
    fn try_identities(&mut self, idx: usize, op: Opcode, a: &ArgVec) -> Result<bool, CodegenError> {
        let OpKind::Binary(b) = op.kind() else {
            return Ok(false);
        };

        // Shifting or rotating a constant zero produces zero whatever the
        // amount.
        if b.is_shift_or_rot() && self.vals.const_val(temp(a[1])) == Some(0) {
            let w = self.op_width(idx, op)?;
            self.gen_movi(idx, Opcode::movi_op(w), a[0], 0);
            return Ok(true);
        }

        // x op 0 == x. A constant left operand is left for the full fold.
        if (matches!(b, BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor) || b.is_shift_or_rot())
            && self.vals.const_val(temp(a[1])).is_none()
            && self.vals.const_val(temp(a[2])) == Some(0)
        {
            if self.vals.are_copies(temp(a[0]), temp(a[1])) {
                self.gen_nop(idx);
            } else {
                let w = self.op_width(idx, op)?;
                self.gen_mov(idx, Opcode::mov_op(w), a[0], a[1]);
            }
            return Ok(true);
        }

        // x op 0 == 0.
        if matches!(b, BinOp::And | BinOp::Mul) && self.vals.const_val(temp(a[2])) == Some(0) {
            let w = self.op_width(idx, op)?;
            self.gen_movi(idx, Opcode::movi_op(w), a[0], 0);
            return Ok(true);
        }

        // x op x == x. When x is a constant temp the full fold computes the
        // same value, and a constant must never enter a copy ring.
        if matches!(b, BinOp::And | BinOp::Or)
            && self.vals.const_val(temp(a[1])).is_none()
            && self.vals.are_copies(temp(a[1]), temp(a[2]))
        {
            if self.vals.are_copies(temp(a[0]), temp(a[1])) {
                self.gen_nop(idx);
            } else {
                let w = self.op_width(idx, op)?;
                self.gen_mov(idx, Opcode::mov_op(w), a[0], a[1]);
            }
            return Ok(true);
        }

        // x op x == 0.
        if matches!(b, BinOp::Sub | BinOp::Xor)
            && self.vals.const_val(temp(a[1])).is_none()
            && self.vals.are_copies(temp(a[1]), temp(a[2]))
        {
            let w = self.op_width(idx, op)?;
            self.gen_movi(idx, Opcode::movi_op(w), a[0], 0);
            return Ok(true);
        }

        Ok(false)
    }

    /// Phases 4 and 5: fold, propagate, invalidate and emit. Returns how many
    /// opcode slots were consumed.
    fn rewrite(&mut self, idx: usize, op: Opcode, a: &ArgVec) -> Result<usize, CodegenError> {
        match op.kind() {
            OpKind::Mov => {
                if self.vals.are_copies(temp(a[0]), temp(a[1])) {
                    self.gen_nop(idx);
                } else if let Some(v) = self.vals.const_val(temp(a[1])) {
                    let w = self.op_width(idx, op)?;
                    self.gen_movi(idx, Opcode::movi_op(w), a[0], v);
                } else {
                    self.gen_mov(idx, op, a[0], a[1]);
                }
            }
            OpKind::Movi => {
                self.gen_movi(idx, op, a[0], a[1]);
            }
            OpKind::Unary(u) => {
                if let Some(x) = self.vals.const_val(temp(a[1])) {
                    let w = self.op_width(idx, op)?;
                    self.gen_movi(idx, Opcode::movi_op(w), a[0], fold::unary(u, w, x));
                } else {
                    self.passthrough(op, a);
                }
            }
            OpKind::Binary(b) => {
                let xy = (
                    self.vals.const_val(temp(a[1])),
                    self.vals.const_val(temp(a[2])),
                );
                if let (Some(x), Some(y)) = xy {
                    let w = self.op_width(idx, op)?;
                    self.gen_movi(idx, Opcode::movi_op(w), a[0], fold::binary(b, w, x, y));
                } else {
                    self.passthrough(op, a);
                }
            }
            OpKind::Deposit => {
                let xy = (
                    self.vals.const_val(temp(a[1])),
                    self.vals.const_val(temp(a[2])),
                );
                if let (Some(base), Some(value)) = xy {
                    let w = self.op_width(idx, op)?;
                    let v = fold::deposit(w, base, value, a[3], a[4]);
                    self.gen_movi(idx, Opcode::movi_op(w), a[0], v);
                } else {
                    self.passthrough(op, a);
                }
            }
            OpKind::Setcond => {
                let cond = self.cond_arg(idx, op, a[3])?;
                let w = self.op_width(idx, op)?;
                match self.cond_result(w, a[1], a[2], cond) {
                    Some(k) => self.gen_movi(idx, Opcode::movi_op(w), a[0], k as Arg),
                    None => self.passthrough(op, a),
                }
            }
            OpKind::Brcond => {
                let cond = self.cond_arg(idx, op, a[2])?;
                let w = self.op_width(idx, op)?;
                match self.cond_result(w, a[0], a[1], cond) {
                    Some(true) => {
                        // The branch is always taken: it becomes unconditional
                        // and ends the basic block here and now.
                        log::trace!("op {idx}: conditional branch is always taken");
                        self.vals.reset_all();
                        self.ops[idx] = Opcode::Br;
                        self.emit(&[a[3]]);
                    }
                    Some(false) => self.gen_nop(idx),
                    None => self.passthrough(op, a),
                }
            }
            OpKind::Movcond => {
                let cond = self.cond_arg(idx, op, a[5])?;
                let w = self.op_width(idx, op)?;
                match self.cond_result(w, a[1], a[2], cond) {
                    Some(k) => {
                        let v = if k { a[3] } else { a[4] };
                        if self.vals.are_copies(temp(a[0]), temp(v)) {
                            self.gen_nop(idx);
                        } else if let Some(cv) = self.vals.const_val(temp(v)) {
                            self.gen_movi(idx, Opcode::movi_op(w), a[0], cv);
                        } else {
                            self.gen_mov(idx, Opcode::mov_op(w), a[0], v);
                        }
                    }
                    None => self.passthrough(op, a),
                }
            }
            OpKind::Add2 | OpKind::Sub2 => {
                let halves = [a[2], a[3], a[4], a[5]].map(|x| self.vals.const_val(temp(x)));
                if let [Some(al), Some(ah), Some(bl), Some(bh)] = halves {
                    let x = fold::compose64(al, ah);
                    let y = fold::compose64(bl, bh);
                    let r = if matches!(op.kind(), OpKind::Add2) {
                        x.wrapping_add(y)
                    } else {
                        x.wrapping_sub(y)
                    };
                    self.claim_reserved_nop(idx, op)?;
                    self.gen_movi(idx, Opcode::MoviI32, a[0], r & 0xffff_ffff);
                    self.gen_movi(idx + 1, Opcode::MoviI32, a[1], r >> 32);
                    return Ok(2);
                }
                self.passthrough(op, a);
            }
            OpKind::Mulu2 => {
                let xy = (
                    self.vals.const_val(temp(a[2])),
                    self.vals.const_val(temp(a[3])),
                );
                if let (Some(x), Some(y)) = xy {
                    let r = (x & 0xffff_ffff) * (y & 0xffff_ffff);
                    self.claim_reserved_nop(idx, op)?;
                    self.gen_movi(idx, Opcode::MoviI32, a[0], r & 0xffff_ffff);
                    self.gen_movi(idx + 1, Opcode::MoviI32, a[1], r >> 32);
                    return Ok(2);
                }
                self.passthrough(op, a);
            }
            OpKind::Brcond2 => {
                let cond = self.cond_arg(idx, op, a[4])?;
                match self.cond2_result([a[0], a[1]], [a[2], a[3]], cond) {
                    Some(true) => {
                        log::trace!("op {idx}: double-word branch is always taken");
                        self.vals.reset_all();
                        self.ops[idx] = Opcode::Br;
                        self.emit(&[a[5]]);
                    }
                    Some(false) => self.gen_nop(idx),
                    None => {
                        if matches!(cond, Cond::Lt | Cond::Ge)
                            && self.vals.const_val(temp(a[2])) == Some(0)
                            && self.vals.const_val(temp(a[3])) == Some(0)
                        {
                            // The sign of the composed value lives entirely in
                            // the high half: compare only that against zero.
                            self.vals.reset_all();
                            self.ops[idx] = Opcode::BrcondI32;
                            self.emit(&[a[1], a[3], cond.arg(), a[5]]);
                        } else {
                            self.passthrough(op, a);
                        }
                    }
                }
            }
            OpKind::Setcond2 => {
                let cond = self.cond_arg(idx, op, a[5])?;
                match self.cond2_result([a[1], a[2]], [a[3], a[4]], cond) {
                    Some(k) => self.gen_movi(idx, Opcode::MoviI32, a[0], k as Arg),
                    None => {
                        if matches!(cond, Cond::Lt | Cond::Ge)
                            && self.vals.const_val(temp(a[3])) == Some(0)
                            && self.vals.const_val(temp(a[4])) == Some(0)
                        {
                            self.vals.reset(temp(a[0]));
                            self.ops[idx] = Opcode::SetcondI32;
                            self.emit(&[a[0], a[2], a[4], cond.arg()]);
                        } else {
                            self.passthrough(op, a);
                        }
                    }
                }
            }
            OpKind::Call => {
                let (n_out, n_in) = call_arity(a[0]);
                let flags = a[1 + n_out + n_in];
                // Unless the call site promises to leave guest globals alone,
                // everything known about them dies here.
                if flags & (CALL_NO_READ_GLOBALS | CALL_NO_WRITE_GLOBALS) == 0 {
                    self.vals.reset_globals();
                }
                for i in 0..n_out {
                    self.vals.reset(temp(a[1 + i]));
                }
                self.emit(a);
            }
            OpKind::Other => self.passthrough(op, a),
        }
        Ok(1)
    }

    /// Phase 5 for operations the rewriter has nothing for: invalidate what
    /// the operation clobbers and copy it through unchanged.
    fn passthrough(&mut self, op: Opcode, a: &ArgVec) {
        let def = op.def();
        if def.flags.contains(OpFlags::BB_END) {
            self.vals.reset_all();
        } else {
            for i in 0..def.n_out {
                self.vals.reset(temp(a[i]));
            }
        }
        self.emit(a);
    }

    /// Resolve a comparison between two temps to a constant truth value if
    /// the current knowledge allows it.
    fn cond_result(&self, w: Width, x: Arg, y: Arg, cond: Cond) -> Option<bool> {
        let (tx, ty) = (temp(x), temp(y));
        if let (Some(xv), Some(yv)) = (self.vals.const_val(tx), self.vals.const_val(ty)) {
            Some(fold::eval_cond(w, xv, yv, cond))
        } else if self.vals.are_copies(tx, ty) {
            Some(fold::cond_when_equal(cond))
        } else if self.vals.const_val(ty) == Some(0) {
            // Nothing is unsigned-below zero; everything is unsigned-at-least
            // zero.
            match cond {
                Cond::Ltu => Some(false),
                Cond::Geu => Some(true),
                _ => None,
            }
        } else {
            None
        }
    }

    /// [Opt::cond_result] for a double-word comparison of 32-bit half pairs.
    fn cond2_result(&self, a: [Arg; 2], b: [Arg; 2], cond: Cond) -> Option<bool> {
        let [al, ah] = a.map(temp);
        let [bl, bh] = b.map(temp);
        if let (Some(blv), Some(bhv)) = (self.vals.const_val(bl), self.vals.const_val(bh)) {
            let bv = fold::compose64(blv, bhv);
            if let (Some(alv), Some(ahv)) = (self.vals.const_val(al), self.vals.const_val(ah)) {
                let av = fold::compose64(alv, ahv);
                return Some(fold::eval_cond(Width::W64, av, bv, cond));
            }
            if bv == 0 {
                match cond {
                    Cond::Ltu => return Some(false),
                    Cond::Geu => return Some(true),
                    _ => (),
                }
            }
        }
        if self.vals.are_copies(al, bl) && self.vals.are_copies(ah, bh) {
            return Some(fold::cond_when_equal(cond));
        }
        None
    }

    /// Rewrite the operation at `idx` into a register move, recording the
    /// copy relation.
    fn gen_mov(&mut self, idx: usize, mov: Opcode, dst: Arg, src: Arg) {
        self.ops[idx] = mov;
        self.vals.join_copy(temp(dst), temp(src));
        self.emit(&[dst, src]);
    }

    /// Rewrite the operation at `idx` into a constant load, recording the
    /// constant.
    fn gen_movi(&mut self, idx: usize, movi: Opcode, dst: Arg, val: Arg) {
        self.ops[idx] = movi;
        self.vals.set_const(temp(dst), val);
        self.emit(&[dst, val]);
    }

    /// Eliminate the operation at `idx` entirely.
    fn gen_nop(&mut self, idx: usize) {
        log::trace!("op {idx}: elided");
        self.ops[idx] = Opcode::Nop;
        self.n_elided += 1;
    }

    fn emit(&mut self, xs: &[Arg]) {
        debug_assert!(self.wpos + xs.len() <= self.rpos);
        self.args[self.wpos..self.wpos + xs.len()].copy_from_slice(xs);
        self.wpos += xs.len();
    }

    /// Double-word folds emit two constant loads and therefore need the nop
    /// slot the front end reserves after `add2`/`sub2`/`mulu2`.
    fn claim_reserved_nop(&self, idx: usize, op: Opcode) -> Result<(), CodegenError> {
        if self.ops.get(idx + 1) == Some(&Opcode::Nop) {
            Ok(())
        } else {
            Err(CodegenError::Internal(format!(
                "operation {idx} ({op:?}): missing reserved nop slot for a double-word fold"
            )))
        }
    }

    fn op_width(&self, idx: usize, op: Opcode) -> Result<Width, CodegenError> {
        op.width().ok_or_else(|| {
            CodegenError::Internal(format!(
                "operation {idx} ({op:?}): width-less opcode cannot be rewritten"
            ))
        })
    }

    fn cond_arg(&self, idx: usize, op: Opcode, a: Arg) -> Result<Cond, CodegenError> {
        Cond::from_arg(a).ok_or_else(|| {
            CodegenError::Internal(format!(
                "operation {idx} ({op:?}): {a} is not a condition code"
            ))
        })
    }
}

fn short_stream(idx: usize, op: Opcode) -> CodegenError {
    CodegenError::Internal(format!(
        "operation {idx} ({op:?}): argument buffer ends before the operation's arguments"
    ))
}
