//! Instruction set and program representation for the abstract machine.
//!
//! The abstract machine (ATM) is a small register ISA that format
//! translators target: a handful of generic and pointer registers, memory
//! ops tagged by width, compare-and-branch, a branch table, and three call
//! flavors. [`crate::builder::Builder`] assembles instructions into a
//! [`Program`]; the backend lowers a program to amd64.
//!
//! Instructions live in an arena owned first by the builder, then by the
//! finished program. Successors and branch targets are arena indices, so a
//! program is a linked list threaded through [`InstrId`]s with a general
//! branch graph on top.

use std::fmt;

use smallvec::SmallVec;

use crate::abi::CallHandle;

// ─── Virtual registers ──────────────────────────────────────────────────────

/// A generic (integer) virtual register. `Rz` is the zero register: reads
/// as literal zero, discards as a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericRegister {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    Rz,
}

/// A pointer virtual register. `Pn` is the null register, the pointer
/// counterpart of [`GenericRegister::Rz`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerRegister {
    P0,
    P1,
    P2,
    P3,
    P4,
    P5,
    Pn,
}

impl GenericRegister {
    /// The register index, or `None` for the zero register.
    pub fn index(self) -> Option<u8> {
        match self {
            GenericRegister::R0 => Some(0),
            GenericRegister::R1 => Some(1),
            GenericRegister::R2 => Some(2),
            GenericRegister::R3 => Some(3),
            GenericRegister::R4 => Some(4),
            GenericRegister::R5 => Some(5),
            GenericRegister::Rz => None,
        }
    }

    pub fn is_zero(self) -> bool {
        self == GenericRegister::Rz
    }
}

impl PointerRegister {
    /// The register index, or `None` for the null register.
    pub fn index(self) -> Option<u8> {
        match self {
            PointerRegister::P0 => Some(0),
            PointerRegister::P1 => Some(1),
            PointerRegister::P2 => Some(2),
            PointerRegister::P3 => Some(3),
            PointerRegister::P4 => Some(4),
            PointerRegister::P5 => Some(5),
            PointerRegister::Pn => None,
        }
    }

    pub fn is_zero(self) -> bool {
        self == PointerRegister::Pn
    }
}

/// Either kind of virtual register. Generic and pointer registers share an
/// index space but are distinct identities: `r3` and `p3` are different
/// registers with different physical homes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Generic(GenericRegister),
    Pointer(PointerRegister),
}

/// High bit of an encoded register byte: set for pointer registers.
const ENC_POINTER: u8 = 0x80;
/// Low-bits value encoding the zero register of either kind.
const ENC_ZERO: u8 = 0x7f;

impl Register {
    pub fn index(self) -> Option<u8> {
        match self {
            Register::Generic(r) => r.index(),
            Register::Pointer(p) => p.index(),
        }
    }

    pub fn is_zero(self) -> bool {
        self.index().is_none()
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, Register::Pointer(_))
    }

    /// Encode into an argument-vector byte: high bit = pointer kind, low
    /// bits = index, `0x7f` = zero register.
    pub fn encode(self) -> u8 {
        let kind = if self.is_pointer() { ENC_POINTER } else { 0 };
        kind | self.index().unwrap_or(ENC_ZERO)
    }

    /// Inverse of [`Register::encode`].
    pub fn decode(byte: u8) -> Register {
        let idx = byte & !ENC_POINTER;
        if byte & ENC_POINTER == 0 {
            Register::Generic(match idx {
                0 => GenericRegister::R0,
                1 => GenericRegister::R1,
                2 => GenericRegister::R2,
                3 => GenericRegister::R3,
                4 => GenericRegister::R4,
                5 => GenericRegister::R5,
                ENC_ZERO => GenericRegister::Rz,
                _ => panic!("invalid generic register encoding {byte:#04x}"),
            })
        } else {
            Register::Pointer(match idx {
                0 => PointerRegister::P0,
                1 => PointerRegister::P1,
                2 => PointerRegister::P2,
                3 => PointerRegister::P3,
                4 => PointerRegister::P4,
                5 => PointerRegister::P5,
                ENC_ZERO => PointerRegister::Pn,
                _ => panic!("invalid pointer register encoding {byte:#04x}"),
            })
        }
    }
}

impl From<GenericRegister> for Register {
    fn from(r: GenericRegister) -> Self {
        Register::Generic(r)
    }
}

impl From<PointerRegister> for Register {
    fn from(p: PointerRegister) -> Self {
        Register::Pointer(p)
    }
}

impl fmt::Display for GenericRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(i) => write!(f, "r{i}"),
            None => write!(f, "rz"),
        }
    }
}

impl fmt::Display for PointerRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(i) => write!(f, "p{i}"),
            None => write!(f, "pn"),
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Generic(r) => r.fmt(f),
            Register::Pointer(p) => p.fmt(f),
        }
    }
}

// ─── Call argument vectors ──────────────────────────────────────────────────

/// Encoded argument or return registers of a call instruction: up to eight
/// bytes in [`Register::encode`] form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgVec {
    buf: [u8; 8],
    len: u8,
}

impl ArgVec {
    /// Encode a register slice. More than eight entries is a
    /// construction-time failure.
    pub fn from_regs(regs: &[Register]) -> ArgVec {
        let mut v = ArgVec::default();
        for &r in regs {
            if v.len as usize == v.buf.len() {
                panic!("too many registers for a call vector (max 8)");
            }
            v.buf[v.len as usize] = r.encode();
            v.len += 1;
        }
        v
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The encoded byte at `i`.
    pub fn raw(&self, i: usize) -> u8 {
        assert!(i < self.len(), "call vector index out of range");
        self.buf[i]
    }

    pub fn get(&self, i: usize) -> Register {
        Register::decode(self.raw(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = Register> + '_ {
        self.buf[..self.len()].iter().map(|&b| Register::decode(b))
    }
}

impl fmt::Display for ArgVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, "}}")
    }
}

// ─── Instructions ───────────────────────────────────────────────────────────

/// Index of an instruction in its program's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub(crate) u32);

impl InstrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Branch target vector of a `bsw`; `None` entries fall through.
pub type SwitchTargets = SmallVec<[Option<InstrId>; 8]>;

/// One abstract-machine operation. Operand shapes are fixed per variant;
/// the builder's typed emitters are the only constructors translators use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Nop,

    // ── Immediates and integer arithmetic ──
    /// Load a pointer immediate into `pd`.
    Ip { pr: usize, pd: PointerRegister },
    Addi { rx: GenericRegister, iv: i64, ry: GenericRegister },
    Muli { rx: GenericRegister, iv: i64, ry: GenericRegister },
    Andi { rx: GenericRegister, iv: i64, ry: GenericRegister },
    Xori { rx: GenericRegister, iv: i64, ry: GenericRegister },
    /// `ry = rx | (1 << iv)`.
    Sbiti { rx: GenericRegister, iv: i64, ry: GenericRegister },
    Add { rx: GenericRegister, ry: GenericRegister, rz: GenericRegister },
    Sub { rx: GenericRegister, ry: GenericRegister, rz: GenericRegister },

    // ── Memory, tagged by width ──
    Lb { ps: PointerRegister, rx: GenericRegister },
    Lw { ps: PointerRegister, rx: GenericRegister },
    Ll { ps: PointerRegister, rx: GenericRegister },
    Lq { ps: PointerRegister, rx: GenericRegister },
    Lp { ps: PointerRegister, pd: PointerRegister },
    Sb { rx: GenericRegister, pd: PointerRegister },
    Sw { rx: GenericRegister, pd: PointerRegister },
    Sl { rx: GenericRegister, pd: PointerRegister },
    Sq { rx: GenericRegister, pd: PointerRegister },
    Sp { ps: PointerRegister, pd: PointerRegister },

    // ── Pointer arithmetic ──
    Addp { ps: PointerRegister, rx: GenericRegister, pd: PointerRegister },
    Subp { ps: PointerRegister, rx: GenericRegister, pd: PointerRegister },
    Addpi { ps: PointerRegister, iv: i64, pd: PointerRegister },

    // ── Byte swaps ──
    Swapw { rx: GenericRegister, ry: GenericRegister },
    Swapl { rx: GenericRegister, ry: GenericRegister },
    Swapq { rx: GenericRegister, ry: GenericRegister },

    // ── Parameter bridge ──
    /// Load argument slot `id` into `rx`.
    Ldaq { id: usize, rx: GenericRegister },
    Ldap { id: usize, pd: PointerRegister },
    /// Store `rx` into return slot `id`.
    Strq { rx: GenericRegister, id: usize },
    Strp { ps: PointerRegister, id: usize },

    // ── Branches ──
    Beq { rx: GenericRegister, ry: GenericRegister, to: Option<InstrId> },
    Bne { rx: GenericRegister, ry: GenericRegister, to: Option<InstrId> },
    Blt { rx: GenericRegister, ry: GenericRegister, to: Option<InstrId> },
    Bltu { rx: GenericRegister, ry: GenericRegister, to: Option<InstrId> },
    Bgeu { rx: GenericRegister, ry: GenericRegister, to: Option<InstrId> },
    /// Branch if `ps` is null.
    Beqn { ps: PointerRegister, to: Option<InstrId> },
    /// Branch if `ps` is non-null.
    Bnen { ps: PointerRegister, to: Option<InstrId> },
    /// Direct jump; a non-null `pd` captures the return address.
    Jal { pd: PointerRegister, to: Option<InstrId> },
    /// Branch table indexed by `rx`; out-of-range and `None` entries fall
    /// through.
    Bsw { rx: GenericRegister, targets: SwitchTargets },

    // ── Bulk memory ──
    Bzero { nb: i64, pd: PointerRegister },
    /// Copy `rx` bytes from `ps` to `pd`.
    Bcopy { ps: PointerRegister, rx: GenericRegister, pd: PointerRegister },

    // ── Calls ──
    /// Native (C ABI) call.
    Ccall { func: CallHandle, args: ArgVec, rets: ArgVec },
    /// Runtime-managed call, honoring the host stack and register contract.
    Gcall { func: CallHandle, args: ArgVec, rets: ArgVec },
    /// Method call through a vtable pointer in `vt`, receiver in `vp`.
    Icall {
        vt: PointerRegister,
        vp: PointerRegister,
        method: CallHandle,
        args: ArgVec,
        rets: ArgVec,
    },

    // ── Terminators ──
    Halt,
    Break,
}

impl Op {
    /// True for operations that encode successors beyond the fallthrough
    /// link.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Op::Beq { .. }
                | Op::Bne { .. }
                | Op::Blt { .. }
                | Op::Bltu { .. }
                | Op::Bgeu { .. }
                | Op::Beqn { .. }
                | Op::Bnen { .. }
                | Op::Jal { .. }
                | Op::Bsw { .. }
        )
    }

    /// Snapshot of this op's branch target slots, in slot order. Empty for
    /// non-branches.
    pub(crate) fn branch_targets(&self) -> SwitchTargets {
        match self {
            Op::Beq { to, .. }
            | Op::Bne { to, .. }
            | Op::Blt { to, .. }
            | Op::Bltu { to, .. }
            | Op::Bgeu { to, .. }
            | Op::Beqn { to, .. }
            | Op::Bnen { to, .. }
            | Op::Jal { to, .. } => SmallVec::from_slice(&[*to]),
            Op::Bsw { targets, .. } => targets.clone(),
            _ => SmallVec::new(),
        }
    }

    /// Overwrite this op's branch target slots; `slots` must have the shape
    /// [`Op::branch_targets`] returned.
    pub(crate) fn set_branch_targets(&mut self, slots: &[Option<InstrId>]) {
        match self {
            Op::Beq { to, .. }
            | Op::Bne { to, .. }
            | Op::Blt { to, .. }
            | Op::Bltu { to, .. }
            | Op::Bgeu { to, .. }
            | Op::Beqn { to, .. }
            | Op::Bnen { to, .. }
            | Op::Jal { to, .. } => *to = slots[0],
            Op::Bsw { targets, .. } => {
                targets.clear();
                targets.extend_from_slice(slots);
            }
            _ => assert!(slots.is_empty(), "branch targets on a non-branch"),
        }
    }
}

/// An instruction: an operation plus its fallthrough successor. `next` is
/// `None` only at the end of the chain.
#[derive(Debug, Clone)]
pub struct Instr {
    pub op: Op,
    pub next: Option<InstrId>,
}

// ─── Arena ──────────────────────────────────────────────────────────────────

/// Backing store for instructions. Built by the builder, owned by the
/// program it produces; swept-out instructions simply stop being reachable.
#[derive(Debug, Default)]
pub(crate) struct InstrArena {
    items: Vec<Instr>,
}

impl InstrArena {
    pub(crate) fn push(&mut self, op: Op) -> InstrId {
        let id = InstrId(self.items.len() as u32);
        self.items.push(Instr { op, next: None });
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

impl std::ops::Index<InstrId> for InstrArena {
    type Output = Instr;
    fn index(&self, id: InstrId) -> &Instr {
        &self.items[id.index()]
    }
}

impl std::ops::IndexMut<InstrId> for InstrArena {
    fn index_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.items[id.index()]
    }
}

// ─── Program ────────────────────────────────────────────────────────────────

/// A finished instruction sequence, as produced by
/// [`crate::builder::Builder::build`]. Owns its instructions; the chain of
/// `next` links starting at [`Program::head`] is the execution order.
pub struct Program {
    pub(crate) arena: InstrArena,
    pub(crate) head: Option<InstrId>,
}

impl Program {
    /// First instruction, or `None` for the empty program.
    pub fn head(&self) -> Option<InstrId> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.arena[id]
    }

    /// Number of instructions on the chain.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Walk the chain in execution order.
    pub fn iter(&self) -> ProgramIter<'_> {
        ProgramIter {
            program: self,
            cursor: self.head,
        }
    }
}

pub struct ProgramIter<'a> {
    program: &'a Program,
    cursor: Option<InstrId>,
}

impl<'a> Iterator for ProgramIter<'a> {
    type Item = (InstrId, &'a Instr);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let ins = self.program.instr(id);
        self.cursor = ins.next;
        Some((id, ins))
    }
}

// ─── Listing ────────────────────────────────────────────────────────────────

impl fmt::Display for Program {
    /// Assembler-style listing with chain positions as labels.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::collections::HashMap;

        let mut pcs = HashMap::new();
        for (pc, (id, _)) in self.iter().enumerate() {
            pcs.insert(id, pc);
        }
        let at = |t: &Option<InstrId>| match t {
            Some(id) => match pcs.get(id) {
                Some(pc) => format!("@{pc}"),
                None => format!("@{id:?}"),
            },
            None => "@-".to_string(),
        };

        for (pc, (_, ins)) in self.iter().enumerate() {
            write!(f, "{pc:04} : ")?;
            match &ins.op {
                Op::Nop => writeln!(f, "nop")?,
                Op::Ip { pr, pd } => writeln!(f, "ip    ${pr:#x}, {pd}")?,
                Op::Addi { rx, iv, ry } => writeln!(f, "addi  {rx}, ${iv}, {ry}")?,
                Op::Muli { rx, iv, ry } => writeln!(f, "muli  {rx}, ${iv}, {ry}")?,
                Op::Andi { rx, iv, ry } => writeln!(f, "andi  {rx}, ${iv}, {ry}")?,
                Op::Xori { rx, iv, ry } => writeln!(f, "xori  {rx}, ${iv}, {ry}")?,
                Op::Sbiti { rx, iv, ry } => writeln!(f, "sbiti {rx}, ${iv}, {ry}")?,
                Op::Add { rx, ry, rz } => writeln!(f, "add   {rx}, {ry}, {rz}")?,
                Op::Sub { rx, ry, rz } => writeln!(f, "sub   {rx}, {ry}, {rz}")?,
                Op::Lb { ps, rx } => writeln!(f, "lb    ({ps}), {rx}")?,
                Op::Lw { ps, rx } => writeln!(f, "lw    ({ps}), {rx}")?,
                Op::Ll { ps, rx } => writeln!(f, "ll    ({ps}), {rx}")?,
                Op::Lq { ps, rx } => writeln!(f, "lq    ({ps}), {rx}")?,
                Op::Lp { ps, pd } => writeln!(f, "lp    ({ps}), {pd}")?,
                Op::Sb { rx, pd } => writeln!(f, "sb    {rx}, ({pd})")?,
                Op::Sw { rx, pd } => writeln!(f, "sw    {rx}, ({pd})")?,
                Op::Sl { rx, pd } => writeln!(f, "sl    {rx}, ({pd})")?,
                Op::Sq { rx, pd } => writeln!(f, "sq    {rx}, ({pd})")?,
                Op::Sp { ps, pd } => writeln!(f, "sp    {ps}, ({pd})")?,
                Op::Addp { ps, rx, pd } => writeln!(f, "addp  {ps}, {rx}, {pd}")?,
                Op::Subp { ps, rx, pd } => writeln!(f, "subp  {ps}, {rx}, {pd}")?,
                Op::Addpi { ps, iv, pd } => writeln!(f, "addpi {ps}, ${iv}, {pd}")?,
                Op::Swapw { rx, ry } => writeln!(f, "swapw {rx}, {ry}")?,
                Op::Swapl { rx, ry } => writeln!(f, "swapl {rx}, {ry}")?,
                Op::Swapq { rx, ry } => writeln!(f, "swapq {rx}, {ry}")?,
                Op::Ldaq { id, rx } => writeln!(f, "ldaq  #{id}, {rx}")?,
                Op::Ldap { id, pd } => writeln!(f, "ldap  #{id}, {pd}")?,
                Op::Strq { rx, id } => writeln!(f, "strq  {rx}, #{id}")?,
                Op::Strp { ps, id } => writeln!(f, "strp  {ps}, #{id}")?,
                Op::Beq { rx, ry, to } => writeln!(f, "beq   {rx}, {ry}, {}", at(to))?,
                Op::Bne { rx, ry, to } => writeln!(f, "bne   {rx}, {ry}, {}", at(to))?,
                Op::Blt { rx, ry, to } => writeln!(f, "blt   {rx}, {ry}, {}", at(to))?,
                Op::Bltu { rx, ry, to } => writeln!(f, "bltu  {rx}, {ry}, {}", at(to))?,
                Op::Bgeu { rx, ry, to } => writeln!(f, "bgeu  {rx}, {ry}, {}", at(to))?,
                Op::Beqn { ps, to } => writeln!(f, "beqn  {ps}, {}", at(to))?,
                Op::Bnen { ps, to } => writeln!(f, "bnen  {ps}, {}", at(to))?,
                Op::Jal { pd, to } => writeln!(f, "jal   {}, {pd}", at(to))?,
                Op::Bsw { rx, targets } => {
                    write!(f, "bsw   {rx}, [")?;
                    for (i, t) in targets.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", at(t))?;
                    }
                    writeln!(f, "]")?;
                }
                Op::Bzero { nb, pd } => writeln!(f, "bzero ${nb}, ({pd})")?,
                Op::Bcopy { ps, rx, pd } => writeln!(f, "bcopy ({ps}), {rx}, ({pd})")?,
                Op::Ccall { func, args, rets } => {
                    writeln!(f, "ccall {func} {args} -> {rets}")?
                }
                Op::Gcall { func, args, rets } => {
                    writeln!(f, "gcall {func} {args} -> {rets}")?
                }
                Op::Icall {
                    vt,
                    vp,
                    method,
                    args,
                    rets,
                } => writeln!(f, "icall ({vt}).{method} [{vp}] {args} -> {rets}")?,
                Op::Halt => writeln!(f, "halt")?,
                Op::Break => writeln!(f, "break")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_encoding_round_trips() {
        let all: &[Register] = &[
            GenericRegister::R0.into(),
            GenericRegister::R5.into(),
            GenericRegister::Rz.into(),
            PointerRegister::P0.into(),
            PointerRegister::P5.into(),
            PointerRegister::Pn.into(),
        ];
        for &r in all {
            assert_eq!(Register::decode(r.encode()), r);
        }
    }

    #[test]
    fn zero_registers_have_no_index() {
        assert_eq!(GenericRegister::Rz.index(), None);
        assert_eq!(PointerRegister::Pn.index(), None);
        assert!(Register::Generic(GenericRegister::Rz).is_zero());
    }

    #[test]
    fn pointer_bit_distinguishes_kinds() {
        let r3 = Register::Generic(GenericRegister::R3);
        let p3 = Register::Pointer(PointerRegister::P3);
        assert_ne!(r3.encode(), p3.encode());
        assert_eq!(r3.encode() & 0x7f, p3.encode() & 0x7f);
    }

    #[test]
    #[should_panic(expected = "too many registers")]
    fn arg_vec_overflow_panics() {
        let regs = [Register::Generic(GenericRegister::R0); 9];
        ArgVec::from_regs(&regs);
    }

    #[test]
    fn branch_target_slots_round_trip() {
        let mut op = Op::Bsw {
            rx: GenericRegister::R0,
            targets: SmallVec::from_slice(&[None, Some(InstrId(3)), None]),
        };
        let slots = op.branch_targets();
        assert_eq!(slots.len(), 3);
        op.set_branch_targets(&[Some(InstrId(1)), Some(InstrId(2)), None]);
        assert_eq!(
            op.branch_targets().as_slice(),
            &[Some(InstrId(1)), Some(InstrId(2)), None]
        );
    }
}
