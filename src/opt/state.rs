//! Per-temp knowledge for the optimiser: what value, if any, each temp is
//! known to hold at the current point of the scan.
//!
//! Copy-equivalent temps are linked into a circular doubly-linked ring. The
//! ring is arena-indexed: each member stores the [TempIdx] of its neighbours
//! rather than a pointer, so the whole structure lives inside one flat table
//! and detaching a member is two index writes. A ring always has at least two
//! members; a temp that would be left alone in its ring is demoted to
//! [Known::Undef] instead.

use crate::ir::{Arg, TempIdx, TransContext};
use index_vec::IndexVec;

/// What is known about one temp.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Known {
    /// Nothing.
    Undef,
    /// The temp holds this literal value. Width interpretation is up to the
    /// consuming opcode. A `Const` temp is never a ring member.
    Const(Arg),
    /// The temp is a member of the copy ring through `prev`/`next`.
    Copy { prev: TempIdx, next: TempIdx },
}

/// The state table. Allocated fresh at pass entry (all [Known::Undef]),
/// mutated in place during the scan, discarded at pass exit.
pub(crate) struct TempValues<'a> {
    ctx: &'a TransContext,
    vals: IndexVec<TempIdx, Known>,
}

impl<'a> TempValues<'a> {
    pub(crate) fn new(ctx: &'a TransContext) -> Self {
        Self {
            ctx,
            vals: IndexVec::from_vec(vec![Known::Undef; ctx.n_temps()]),
        }
    }

    pub(crate) fn get(&self, t: TempIdx) -> Known {
        self.vals[t]
    }

    /// The constant `t` is known to hold, if any.
    pub(crate) fn const_val(&self, t: TempIdx) -> Option<Arg> {
        match self.vals[t] {
            Known::Const(v) => Some(v),
            _ => None,
        }
    }

    fn next(&self, t: TempIdx) -> TempIdx {
        let Known::Copy { next, .. } = self.vals[t] else {
            panic!("temp {} is not in a copy ring", t.index());
        };
        next
    }

    fn set_prev(&mut self, t: TempIdx, p: TempIdx) {
        let Known::Copy { prev, .. } = &mut self.vals[t] else {
            panic!("temp {} is not in a copy ring", t.index());
        };
        *prev = p;
    }

    fn set_next(&mut self, t: TempIdx, n: TempIdx) {
        let Known::Copy { next, .. } = &mut self.vals[t] else {
            panic!("temp {} is not in a copy ring", t.index());
        };
        *next = n;
    }

    /// Forget everything about `t`. If `t` was one of the two members of a
    /// ring, the survivor is demoted to [Known::Undef] as well: singleton
    /// rings are never kept.
    pub(crate) fn reset(&mut self, t: TempIdx) {
        if let Known::Copy { prev, next } = self.vals[t] {
            if prev == next {
                self.vals[next] = Known::Undef;
            } else {
                self.set_prev(next, prev);
                self.set_next(prev, next);
                self.debug_check_ring(next);
            }
        }
        self.vals[t] = Known::Undef;
    }

    /// Forget everything about every temp. Used at basic-block boundaries.
    pub(crate) fn reset_all(&mut self) {
        for v in self.vals.iter_mut() {
            *v = Known::Undef;
        }
    }

    /// Forget everything about every global temp. Used at call sites that may
    /// touch guest state.
    pub(crate) fn reset_globals(&mut self) {
        for i in 0..self.ctx.n_globals() {
            self.reset(TempIdx::from_usize(i));
        }
    }

    /// Record that `t` holds the literal `v`.
    pub(crate) fn set_const(&mut self, t: TempIdx, v: Arg) {
        self.reset(t);
        self.vals[t] = Known::Const(v);
    }

    /// Record that `dst` now holds the same value as `src`, splicing `dst`
    /// into `src`'s ring (starting one if `src` had none).
    ///
    /// Temps of differing declared widths are never joined: the caller still
    /// emits its move, but no equivalence is recorded and later uses of `dst`
    /// will not benefit from propagation.
    pub(crate) fn join_copy(&mut self, dst: TempIdx, src: TempIdx) {
        self.reset(dst);
        debug_assert!(
            !matches!(self.vals[src], Known::Const(_)),
            "constant source must have been rewritten to a constant load"
        );
        if self.ctx.width_of(dst) != self.ctx.width_of(src) {
            return;
        }
        if !matches!(self.vals[src], Known::Copy { .. }) {
            self.vals[src] = Known::Copy {
                prev: src,
                next: src,
            };
        }
        let src_next = self.next(src);
        self.vals[dst] = Known::Copy {
            prev: src,
            next: src_next,
        };
        self.set_prev(src_next, dst);
        self.set_next(src, dst);
        self.debug_check_ring(dst);
    }

    /// Do `a` and `b` hold the same runtime value?
    pub(crate) fn are_copies(&self, a: TempIdx, b: TempIdx) -> bool {
        if a == b {
            return true;
        }
        if !matches!(self.vals[a], Known::Copy { .. })
            || !matches!(self.vals[b], Known::Copy { .. })
        {
            return false;
        }
        let mut i = self.next(a);
        while i != a {
            if i == b {
                return true;
            }
            i = self.next(i);
        }
        false
    }

    /// The best representative of `t`'s equivalence class: references are
    /// hoisted towards longer-lived storage so later passes can reuse live
    /// registers. Priority: `t` itself if global, else the first global in the
    /// ring, else (when `t` is not a local) the first local, else `t`.
    pub(crate) fn best_copy(&self, t: TempIdx) -> TempIdx {
        if self.ctx.is_global(t) {
            return t;
        }
        if !matches!(self.vals[t], Known::Copy { .. }) {
            return t;
        }
        let mut i = self.next(t);
        while i != t {
            if self.ctx.is_global(i) {
                return i;
            }
            i = self.next(i);
        }
        if !self.ctx.is_local(t) {
            let mut i = self.next(t);
            while i != t {
                if self.ctx.is_local(i) {
                    return i;
                }
                i = self.next(i);
            }
        }
        t
    }

    /// Walk `t`'s ring checking symmetry (`next(prev(i)) == i` both ways) and
    /// that every member is in copy state. Debug builds only.
    pub(crate) fn debug_check_ring(&self, t: TempIdx) {
        if cfg!(debug_assertions) {
            if !matches!(self.vals[t], Known::Copy { .. }) {
                return;
            }
            let mut i = t;
            let mut steps = 0;
            loop {
                let Known::Copy { prev, next } = self.vals[i] else {
                    panic!("ring member {} left copy state", i.index());
                };
                assert!(
                    matches!(self.vals[next], Known::Copy { prev: p, .. } if p == i),
                    "ring asymmetry at temp {}",
                    i.index()
                );
                assert!(
                    matches!(self.vals[prev], Known::Copy { next: n, .. } if n == i),
                    "ring asymmetry at temp {}",
                    i.index()
                );
                steps += 1;
                assert!(steps <= self.ctx.n_temps(), "unclosed ring");
                i = next;
                if i == t {
                    break;
                }
            }
        }
    }
}
