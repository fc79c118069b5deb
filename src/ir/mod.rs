//! The operation-stream model shared by the front end, the optimiser and the
//! register allocator.
//!
//! A translation unit is a pair of parallel buffers: a sequence of [Opcode]s
//! and a flat sequence of [Arg]s. Each operation owns a contiguous run of
//! arguments in the order its [OpDef] prescribes: outputs first, then inputs,
//! then immediates (bitfield positions, condition codes, branch labels).
//!
//! Terminology used throughout the crate:
//!
//!  * `temp`: a virtual register allocated by the front end. Indexed by
//!    [TempIdx].
//!  * `global`: a temp representing architectural guest state; globals occupy
//!    the first [TransContext::n_globals] indices and survive across
//!    translation units.
//!  * `local`: a temp that is live across basic blocks within one translation
//!    unit, but no further.
//!  * `ctx`: the name conventionally given to the shared [TransContext].
//!  * `width`: the bit count (32 or 64) an opcode's arithmetic is interpreted
//!    at.
//!
//! Opcodes are `#[repr(u16)]`: the front end's serialised form of an operation
//! stream stores them as 16-bit values, decoded with [Opcode::from_repr].

use index_vec::IndexVec;
use strum::{EnumCount, FromRepr};

/// A host-word-sized stream argument: a temp index, an immediate, a condition
/// code or a branch label, depending on the slot's position within its
/// operation.
pub type Arg = u64;

index_vec::define_index_type! {
    /// An index into the translation context's temp table.
    pub struct TempIdx = u16;
}

/// Decode a stream argument that occupies a temp slot.
#[inline]
pub fn temp(a: Arg) -> TempIdx {
    TempIdx::from_usize(a as usize)
}

/// Encode a temp index as a stream argument.
#[inline]
pub fn temp_arg(t: TempIdx) -> Arg {
    t.index() as Arg
}

/// The width an opcode's arithmetic is interpreted at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    /// The mask selecting the low `bits()` bits of a host word.
    pub fn mask(self) -> u64 {
        match self {
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }
}

/// Per-opcode behaviour flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpFlags(u8);

impl OpFlags {
    pub const NONE: Self = Self(0);
    /// No constant or copy fact deduced before this operation may be relied
    /// upon after it.
    pub const BB_END: Self = Self(1 << 0);
    /// The operation affects state beyond its declared outputs and must
    /// survive rewriting.
    pub const SIDE_EFFECTS: Self = Self(1 << 1);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Arity and flags for one opcode: `n_out` output temps, `n_in` input temps,
/// `n_const` trailing immediates.
///
/// For [Opcode::Call] the out/in counts are carried per call site in the first
/// stream argument (see [call_arity]); `def()` reports only the two trailing
/// immediates (call-site flags and helper target).
#[derive(Clone, Copy, Debug)]
pub struct OpDef {
    pub n_out: usize,
    pub n_in: usize,
    pub n_const: usize,
    pub flags: OpFlags,
}

impl OpDef {
    pub fn total_args(&self) -> usize {
        self.n_out + self.n_in + self.n_const
    }
}

/// Call-site flag: the helper neither reads guest globals nor expects them to
/// be written back before the call.
pub const CALL_NO_READ_GLOBALS: Arg = 1 << 0;
/// Call-site flag: the helper does not modify guest globals.
pub const CALL_NO_WRITE_GLOBALS: Arg = 1 << 1;

/// Decode a call's packed first argument into `(n_out, n_in)`.
#[inline]
pub fn call_arity(packed: Arg) -> (usize, usize) {
    (((packed >> 16) & 0xffff) as usize, (packed & 0xffff) as usize)
}

/// Pack a call's out/in counts into its first argument.
#[inline]
pub fn pack_call_arity(n_out: usize, n_in: usize) -> Arg {
    debug_assert!(n_out <= 0xffff && n_in <= 0xffff);
    ((n_out as Arg) << 16) | n_in as Arg
}

/// A comparison predicate, as carried in the condition-code argument slot of
/// `setcond`/`brcond`/`movcond` and their double-word variants.
#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumCount, Eq, FromRepr, PartialEq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Le,
    Gt,
    Ltu,
    Geu,
    Leu,
    Gtu,
}

impl Cond {
    /// Decode a condition code from its argument slot.
    pub fn from_arg(a: Arg) -> Option<Cond> {
        u8::try_from(a).ok().and_then(Cond::from_repr)
    }

    /// Encode for an argument slot.
    pub fn arg(self) -> Arg {
        self as Arg
    }

    /// The predicate that gives the same answer after the operands are
    /// exchanged. `Eq`/`Ne` are their own swaps.
    pub fn swap(self) -> Cond {
        match self {
            Cond::Eq => Cond::Eq,
            Cond::Ne => Cond::Ne,
            Cond::Lt => Cond::Gt,
            Cond::Ge => Cond::Le,
            Cond::Le => Cond::Ge,
            Cond::Gt => Cond::Lt,
            Cond::Ltu => Cond::Gtu,
            Cond::Geu => Cond::Leu,
            Cond::Leu => Cond::Geu,
            Cond::Gtu => Cond::Ltu,
        }
    }

    /// The logical negation of the predicate.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ltu => Cond::Geu,
            Cond::Geu => Cond::Ltu,
            Cond::Leu => Cond::Gtu,
            Cond::Gtu => Cond::Leu,
        }
    }
}

/// A foldable binary operation family, independent of width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Andc,
    Orc,
    Eqv,
    Nand,
    Nor,
    Shl,
    Shr,
    Sar,
    Rotl,
    Rotr,
}

impl BinOp {
    /// Families whose operands may be exchanged freely.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Mul
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor
                | BinOp::Eqv
                | BinOp::Nand
                | BinOp::Nor
        )
    }

    pub fn is_shift_or_rot(self) -> bool {
        matches!(
            self,
            BinOp::Shl | BinOp::Shr | BinOp::Sar | BinOp::Rotl | BinOp::Rotr
        )
    }
}

/// A foldable unary operation family, independent of width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
    Ext8s,
    Ext8u,
    Ext16s,
    Ext16u,
    Ext32s,
    Ext32u,
}

/// The category tag the optimiser dispatches on. Rewrite rules switch on the
/// category plus the opcode's width rather than on every enumerant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Mov,
    Movi,
    Unary(UnaryOp),
    Binary(BinOp),
    Deposit,
    Setcond,
    Brcond,
    Movcond,
    Add2,
    Sub2,
    Mulu2,
    Brcond2,
    Setcond2,
    Call,
    /// Everything the rewriter has no rules for; such operations flow through
    /// the invalidation-and-passthrough path unchanged.
    Other,
}

/// One operation of the stream.
///
/// The `_i32`/`_i64` suffix fixes the width the operation's arithmetic is
/// interpreted at; width-less opcodes (control flow, calls) carry none.
#[repr(u16)]
#[derive(Clone, Copy, Debug, EnumCount, Eq, FromRepr, PartialEq)]
pub enum Opcode {
    Nop,
    Br,
    Call,
    SetLabel,
    ExitTb,
    GotoTb,

    MovI32,
    MoviI32,
    SetcondI32,
    MovcondI32,
    BrcondI32,
    AddI32,
    SubI32,
    MulI32,
    DivI32,
    DivuI32,
    RemI32,
    RemuI32,
    AndI32,
    OrI32,
    XorI32,
    AndcI32,
    OrcI32,
    EqvI32,
    NandI32,
    NorI32,
    ShlI32,
    ShrI32,
    SarI32,
    RotlI32,
    RotrI32,
    NotI32,
    NegI32,
    Ext8sI32,
    Ext8uI32,
    Ext16sI32,
    Ext16uI32,
    DepositI32,
    LdI32,
    StI32,
    Add2I32,
    Sub2I32,
    Mulu2I32,
    Brcond2I32,
    Setcond2I32,

    MovI64,
    MoviI64,
    SetcondI64,
    MovcondI64,
    BrcondI64,
    AddI64,
    SubI64,
    MulI64,
    DivI64,
    DivuI64,
    RemI64,
    RemuI64,
    AndI64,
    OrI64,
    XorI64,
    AndcI64,
    OrcI64,
    EqvI64,
    NandI64,
    NorI64,
    ShlI64,
    ShrI64,
    SarI64,
    RotlI64,
    RotrI64,
    NotI64,
    NegI64,
    Ext8sI64,
    Ext8uI64,
    Ext16sI64,
    Ext16uI64,
    Ext32sI64,
    Ext32uI64,
    DepositI64,
    LdI64,
    StI64,
}

impl Opcode {
    /// The width this opcode's arithmetic is interpreted at, or `None` for
    /// width-less opcodes (control flow, calls, labels).
    pub fn width(self) -> Option<Width> {
        use Opcode::*;
        match self {
            Nop | Br | Call | SetLabel | ExitTb | GotoTb => None,
            MovI32 | MoviI32 | SetcondI32 | MovcondI32 | BrcondI32 | AddI32 | SubI32 | MulI32
            | DivI32 | DivuI32 | RemI32 | RemuI32 | AndI32 | OrI32 | XorI32 | AndcI32 | OrcI32
            | EqvI32 | NandI32 | NorI32 | ShlI32 | ShrI32 | SarI32 | RotlI32 | RotrI32 | NotI32
            | NegI32 | Ext8sI32 | Ext8uI32 | Ext16sI32 | Ext16uI32 | DepositI32 | LdI32 | StI32
            | Add2I32 | Sub2I32 | Mulu2I32 | Brcond2I32 | Setcond2I32 => Some(Width::W32),
            MovI64 | MoviI64 | SetcondI64 | MovcondI64 | BrcondI64 | AddI64 | SubI64 | MulI64
            | DivI64 | DivuI64 | RemI64 | RemuI64 | AndI64 | OrI64 | XorI64 | AndcI64 | OrcI64
            | EqvI64 | NandI64 | NorI64 | ShlI64 | ShrI64 | SarI64 | RotlI64 | RotrI64 | NotI64
            | NegI64 | Ext8sI64 | Ext8uI64 | Ext16sI64 | Ext16uI64 | Ext32sI64 | Ext32uI64
            | DepositI64 | LdI64 | StI64 => Some(Width::W64),
        }
    }

    /// The category the optimiser's rewrite rules dispatch on.
    pub fn kind(self) -> OpKind {
        use Opcode::*;
        match self {
            MovI32 | MovI64 => OpKind::Mov,
            MoviI32 | MoviI64 => OpKind::Movi,
            NotI32 | NotI64 => OpKind::Unary(UnaryOp::Not),
            NegI32 | NegI64 => OpKind::Unary(UnaryOp::Neg),
            Ext8sI32 | Ext8sI64 => OpKind::Unary(UnaryOp::Ext8s),
            Ext8uI32 | Ext8uI64 => OpKind::Unary(UnaryOp::Ext8u),
            Ext16sI32 | Ext16sI64 => OpKind::Unary(UnaryOp::Ext16s),
            Ext16uI32 | Ext16uI64 => OpKind::Unary(UnaryOp::Ext16u),
            Ext32sI64 => OpKind::Unary(UnaryOp::Ext32s),
            Ext32uI64 => OpKind::Unary(UnaryOp::Ext32u),
            AddI32 | AddI64 => OpKind::Binary(BinOp::Add),
            SubI32 | SubI64 => OpKind::Binary(BinOp::Sub),
            MulI32 | MulI64 => OpKind::Binary(BinOp::Mul),
            AndI32 | AndI64 => OpKind::Binary(BinOp::And),
            OrI32 | OrI64 => OpKind::Binary(BinOp::Or),
            XorI32 | XorI64 => OpKind::Binary(BinOp::Xor),
            AndcI32 | AndcI64 => OpKind::Binary(BinOp::Andc),
            OrcI32 | OrcI64 => OpKind::Binary(BinOp::Orc),
            EqvI32 | EqvI64 => OpKind::Binary(BinOp::Eqv),
            NandI32 | NandI64 => OpKind::Binary(BinOp::Nand),
            NorI32 | NorI64 => OpKind::Binary(BinOp::Nor),
            ShlI32 | ShlI64 => OpKind::Binary(BinOp::Shl),
            ShrI32 | ShrI64 => OpKind::Binary(BinOp::Shr),
            SarI32 | SarI64 => OpKind::Binary(BinOp::Sar),
            RotlI32 | RotlI64 => OpKind::Binary(BinOp::Rotl),
            RotrI32 | RotrI64 => OpKind::Binary(BinOp::Rotr),
            DepositI32 | DepositI64 => OpKind::Deposit,
            SetcondI32 | SetcondI64 => OpKind::Setcond,
            BrcondI32 | BrcondI64 => OpKind::Brcond,
            MovcondI32 | MovcondI64 => OpKind::Movcond,
            Add2I32 => OpKind::Add2,
            Sub2I32 => OpKind::Sub2,
            Mulu2I32 => OpKind::Mulu2,
            Brcond2I32 => OpKind::Brcond2,
            Setcond2I32 => OpKind::Setcond2,
            Call => OpKind::Call,
            Nop | Br | SetLabel | ExitTb | GotoTb | DivI32 | DivI64 | DivuI32 | DivuI64
            | RemI32 | RemI64 | RemuI32 | RemuI64 | LdI32 | LdI64 | StI32 | StI64 => OpKind::Other,
        }
    }

    /// Arity and flags. Call arity is per call site; see [OpDef].
    pub fn def(self) -> OpDef {
        let terminal = OpFlags::BB_END.union(OpFlags::SIDE_EFFECTS);
        let (n_out, n_in, n_const, flags) = match self.kind() {
            OpKind::Mov => (1, 1, 0, OpFlags::NONE),
            OpKind::Movi => (1, 0, 1, OpFlags::NONE),
            OpKind::Unary(_) => (1, 1, 0, OpFlags::NONE),
            OpKind::Binary(_) => (1, 2, 0, OpFlags::NONE),
            OpKind::Deposit => (1, 2, 2, OpFlags::NONE),
            OpKind::Setcond => (1, 2, 1, OpFlags::NONE),
            OpKind::Brcond => (0, 2, 2, terminal),
            OpKind::Movcond => (1, 4, 1, OpFlags::NONE),
            OpKind::Add2 | OpKind::Sub2 => (2, 4, 0, OpFlags::NONE),
            OpKind::Mulu2 => (2, 2, 0, OpFlags::NONE),
            OpKind::Brcond2 => (0, 4, 2, terminal),
            OpKind::Setcond2 => (1, 4, 1, OpFlags::NONE),
            OpKind::Call => (0, 0, 2, OpFlags::SIDE_EFFECTS),
            OpKind::Other => match self {
                Opcode::Nop => (0, 0, 0, OpFlags::NONE),
                Opcode::Br | Opcode::SetLabel | Opcode::ExitTb | Opcode::GotoTb => {
                    (0, 0, 1, terminal)
                }
                Opcode::DivI32
                | Opcode::DivI64
                | Opcode::DivuI32
                | Opcode::DivuI64
                | Opcode::RemI32
                | Opcode::RemI64
                | Opcode::RemuI32
                | Opcode::RemuI64 => (1, 2, 0, OpFlags::NONE),
                // Memory is opaque to the optimiser: a load or store kills
                // every constant and copy fact, hence the BB_END flag.
                Opcode::LdI32 | Opcode::LdI64 => (1, 1, 1, terminal),
                Opcode::StI32 | Opcode::StI64 => (0, 2, 1, terminal),
                _ => unreachable!(),
            },
        };
        OpDef {
            n_out,
            n_in,
            n_const,
            flags,
        }
    }

    /// The register-to-register move opcode of the given width.
    pub fn mov_op(w: Width) -> Opcode {
        match w {
            Width::W32 => Opcode::MovI32,
            Width::W64 => Opcode::MovI64,
        }
    }

    /// The constant-load opcode of the given width.
    pub fn movi_op(w: Width) -> Opcode {
        match w {
            Width::W32 => Opcode::MoviI32,
            Width::W64 => Opcode::MoviI64,
        }
    }
}

/// The classification of one temp, declared by the front end.
#[derive(Clone, Copy, Debug)]
pub struct TempDecl {
    pub width: Width,
    /// Live across basic blocks within the translation unit. Globals are
    /// classified by index instead (see [TransContext::is_global]).
    pub local: bool,
}

/// The translation context's temp table: how many temps exist, which are
/// globals, and each temp's declared width. The optimiser reads this table
/// and never mutates it.
#[derive(Debug, Default)]
pub struct TransContext {
    n_globals: usize,
    decls: IndexVec<TempIdx, TempDecl>,
}

impl TransContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a global temp. All globals must be allocated before any other
    /// temp so that they occupy the low indices.
    pub fn new_global(&mut self, width: Width) -> TempIdx {
        assert_eq!(
            self.n_globals,
            self.decls.len(),
            "globals must be allocated before locals and ordinary temps"
        );
        self.n_globals += 1;
        self.decls.push(TempDecl {
            width,
            local: false,
        })
    }

    /// Allocate a temp that survives across basic blocks within the unit.
    pub fn new_local(&mut self, width: Width) -> TempIdx {
        self.decls.push(TempDecl { width, local: true })
    }

    /// Allocate an ordinary temp.
    pub fn new_temp(&mut self, width: Width) -> TempIdx {
        self.decls.push(TempDecl {
            width,
            local: false,
        })
    }

    pub fn n_temps(&self) -> usize {
        self.decls.len()
    }

    pub fn n_globals(&self) -> usize {
        self.n_globals
    }

    pub fn is_global(&self, t: TempIdx) -> bool {
        t.index() < self.n_globals
    }

    pub fn is_local(&self, t: TempIdx) -> bool {
        self.decls[t].local
    }

    pub fn width_of(&self, t: TempIdx) -> Width {
        self.decls[t].width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_swap_round_trips() {
        for i in 0..Cond::COUNT {
            let c = Cond::from_repr(i as u8).unwrap();
            assert_eq!(c.swap().swap(), c);
            assert_eq!(c.invert().invert(), c);
            // Swapping and inverting commute.
            assert_eq!(c.swap().invert(), c.invert().swap());
        }
    }

    #[test]
    fn cond_arg_round_trips() {
        for i in 0..Cond::COUNT {
            let c = Cond::from_repr(i as u8).unwrap();
            assert_eq!(Cond::from_arg(c.arg()), Some(c));
        }
        assert_eq!(Cond::from_arg(Cond::COUNT as Arg), None);
    }

    #[test]
    fn call_arity_round_trips() {
        let packed = pack_call_arity(2, 5);
        assert_eq!(call_arity(packed), (2, 5));
    }

    #[test]
    fn defs_are_consistent_with_kinds() {
        for i in 0..Opcode::COUNT {
            let op = Opcode::from_repr(i as u16).unwrap();
            let def = op.def();
            match op.kind() {
                // Every foldable op has a width.
                OpKind::Unary(_) | OpKind::Binary(_) | OpKind::Deposit => {
                    assert!(op.width().is_some(), "{op:?}");
                    assert_eq!(def.n_out, 1);
                }
                OpKind::Brcond | OpKind::Brcond2 => {
                    assert_eq!(def.n_out, 0);
                    assert!(def.flags.contains(OpFlags::BB_END));
                }
                _ => (),
            }
        }
    }

    #[test]
    fn globals_come_first() {
        let mut ctx = TransContext::new();
        let g = ctx.new_global(Width::W32);
        let l = ctx.new_local(Width::W32);
        let t = ctx.new_temp(Width::W64);
        assert!(ctx.is_global(g) && !ctx.is_local(g));
        assert!(!ctx.is_global(l) && ctx.is_local(l));
        assert!(!ctx.is_global(t) && !ctx.is_local(t));
        assert_eq!(ctx.width_of(t), Width::W64);
    }

    #[test]
    #[should_panic]
    fn late_global_allocation_is_rejected() {
        let mut ctx = TransContext::new();
        ctx.new_temp(Width::W32);
        ctx.new_global(Width::W32);
    }
}
