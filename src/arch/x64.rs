//! amd64 assembler surface.
//!
//! The code generator emits through the [`Asm`] trait rather than calling
//! dynasm directly: [`X64Assembler`] is the production implementation,
//! [`crate::arch::trace::TraceAsm`] records operations for tests. The trait
//! carries exactly the instruction forms the backend needs — it is a seam,
//! not a general assembler.
//!
//! Operand order follows AT&T convention (source first), matching the
//! mnemonic suffixes (`movq`, `cmpq`, …) the backend is written against.

use std::fmt;

use dynasmrt::{AssemblyOffset, DynamicLabel, DynasmApi, DynasmLabelApi, dynasm};

/// A physical general-purpose register. Discriminants are the hardware
/// encoding, so `code()` feeds dynasm's dynamic register forms directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}

/// A base + displacement memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    pub disp: i32,
}

/// Shorthand for a [`Mem`] operand.
pub fn ptr(base: Gpr, disp: i32) -> Mem {
    Mem { base, disp }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.disp, self.base)
    }
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Gpr),
    Imm(i64),
    Mem(Mem),
}

impl From<Gpr> for Operand {
    fn from(r: Gpr) -> Operand {
        Operand::Reg(r)
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Operand {
        Operand::Imm(v)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Operand {
        Operand::Mem(m)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => r.fmt(f),
            Operand::Imm(v) => write!(f, "${v}"),
            Operand::Mem(m) => m.fmt(f),
        }
    }
}

/// Condition codes used by the backend's `jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Equal.
    E,
    /// Not equal.
    Ne,
    /// Signed less-than.
    L,
    /// Unsigned below.
    B,
    /// Unsigned above-or-equal.
    Ae,
    /// Unsigned below-or-equal.
    Be,
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::L => "l",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::Be => "be",
        };
        f.write_str(name)
    }
}

/// An assembler-local label. Indexes whatever label store the
/// implementation keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmLabel(pub(crate) u32);

impl fmt::Display for AsmLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// The assembler seam the code generator emits through.
///
/// `cmpq(lhs, rhs)` sets flags from `rhs - lhs` (AT&T order). `movq`
/// supports reg/imm/mem sources against reg/mem destinations; unsupported
/// combinations are a construction-time failure in the production
/// implementation.
pub trait Asm {
    fn new_label(&mut self) -> AsmLabel;
    fn bind(&mut self, label: AsmLabel);
    /// Emit literal instruction bytes.
    fn raw(&mut self, bytes: &[u8]);

    fn movq(&mut self, src: Operand, dst: Operand);
    fn leaq(&mut self, src: Mem, dst: Gpr);
    /// `lea` of a label address, for return-address capture.
    fn leaq_label(&mut self, label: AsmLabel, dst: Gpr);

    fn movb(&mut self, src: Gpr, dst: Mem);
    fn movw(&mut self, src: Gpr, dst: Mem);
    fn movl(&mut self, src: Gpr, dst: Mem);
    fn movzbq(&mut self, src: Mem, dst: Gpr);
    fn movzwq(&mut self, src: Mem, dst: Gpr);
    /// 32-bit load; the upper half of `dst` is zeroed.
    fn movzlq(&mut self, src: Mem, dst: Gpr);

    fn addq(&mut self, src: Operand, dst: Gpr);
    fn subq(&mut self, src: Operand, dst: Gpr);
    /// Three-operand immediate multiply: `dst = src * iv`.
    fn imulq(&mut self, iv: i32, src: Gpr, dst: Gpr);
    fn andq(&mut self, src: Operand, dst: Gpr);
    fn xorq(&mut self, src: Operand, dst: Gpr);
    fn btsq(&mut self, bit: u8, dst: Gpr);
    fn negq(&mut self, dst: Gpr);
    /// 32-bit xor; `xorl r, r` is the canonical zeroing idiom.
    fn xorl(&mut self, a: Gpr, b: Gpr);
    fn xchgq(&mut self, a: Gpr, b: Gpr);
    /// Rotate the low 16 bits.
    fn rolw(&mut self, bits: u8, dst: Gpr);
    fn bswapl(&mut self, dst: Gpr);
    fn bswapq(&mut self, dst: Gpr);

    fn cmpq(&mut self, lhs: Operand, rhs: Operand);
    fn testq(&mut self, a: Gpr, b: Gpr);
    fn jmp(&mut self, label: AsmLabel);
    fn jcc(&mut self, cc: Cond, label: AsmLabel);
    /// Call through a register or a memory slot.
    fn callq(&mut self, target: Operand);
    fn ret(&mut self);
}

// ─── Production assembler ───────────────────────────────────────────────────

/// dynasmrt-backed [`Asm`] implementation producing executable memory.
pub struct X64Assembler {
    ops: dynasmrt::x64::Assembler,
    labels: Vec<DynamicLabel>,
}

impl X64Assembler {
    pub fn new() -> X64Assembler {
        X64Assembler {
            ops: dynasmrt::x64::Assembler::new().expect("failed to create assembler"),
            labels: Vec::new(),
        }
    }

    /// Current emission offset; the entry point when captured before any
    /// code is emitted.
    pub fn offset(&self) -> AssemblyOffset {
        self.ops.offset()
    }

    pub fn finalize(mut self) -> dynasmrt::ExecutableBuffer {
        self.ops.commit().expect("failed to commit assembly");
        self.ops.finalize().expect("failed to finalize assembly")
    }

    fn dyn_label(&self, label: AsmLabel) -> DynamicLabel {
        self.labels[label.0 as usize]
    }
}

impl Default for X64Assembler {
    fn default() -> Self {
        X64Assembler::new()
    }
}

impl Asm for X64Assembler {
    fn new_label(&mut self) -> AsmLabel {
        let label = AsmLabel(self.labels.len() as u32);
        self.labels.push(self.ops.new_dynamic_label());
        label
    }

    fn bind(&mut self, label: AsmLabel) {
        let l = self.dyn_label(label);
        dynasm!(self.ops ; .arch x64 ; =>l);
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.ops.extend(bytes.iter().copied());
    }

    fn movq(&mut self, src: Operand, dst: Operand) {
        match (src, dst) {
            (Operand::Reg(s), Operand::Reg(d)) => {
                dynasm!(self.ops ; .arch x64 ; mov Rq(d.code()), Rq(s.code()));
            }
            (Operand::Imm(v), Operand::Reg(d)) => {
                dynasm!(self.ops ; .arch x64 ; mov Rq(d.code()), QWORD v);
            }
            (Operand::Mem(m), Operand::Reg(d)) => {
                dynasm!(self.ops ; .arch x64 ; mov Rq(d.code()), QWORD [Rq(m.base.code()) + m.disp]);
            }
            (Operand::Reg(s), Operand::Mem(m)) => {
                dynasm!(self.ops ; .arch x64 ; mov QWORD [Rq(m.base.code()) + m.disp], Rq(s.code()));
            }
            (Operand::Imm(v), Operand::Mem(m)) => {
                let v = i32::try_from(v).expect("movq: immediate store must fit 32 bits");
                dynasm!(self.ops ; .arch x64 ; mov QWORD [Rq(m.base.code()) + m.disp], v);
            }
            (src, dst) => panic!("movq: unsupported operand combination {src:?} -> {dst:?}"),
        }
    }

    fn leaq(&mut self, src: Mem, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; lea Rq(dst.code()), [Rq(src.base.code()) + src.disp]);
    }

    fn leaq_label(&mut self, label: AsmLabel, dst: Gpr) {
        let l = self.dyn_label(label);
        dynasm!(self.ops ; .arch x64 ; lea Rq(dst.code()), [=>l]);
    }

    fn movb(&mut self, src: Gpr, dst: Mem) {
        dynasm!(self.ops ; .arch x64 ; mov BYTE [Rq(dst.base.code()) + dst.disp], Rb(src.code()));
    }

    fn movw(&mut self, src: Gpr, dst: Mem) {
        dynasm!(self.ops ; .arch x64 ; mov WORD [Rq(dst.base.code()) + dst.disp], Rw(src.code()));
    }

    fn movl(&mut self, src: Gpr, dst: Mem) {
        dynasm!(self.ops ; .arch x64 ; mov DWORD [Rq(dst.base.code()) + dst.disp], Rd(src.code()));
    }

    fn movzbq(&mut self, src: Mem, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; movzx Rq(dst.code()), BYTE [Rq(src.base.code()) + src.disp]);
    }

    fn movzwq(&mut self, src: Mem, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; movzx Rq(dst.code()), WORD [Rq(src.base.code()) + src.disp]);
    }

    fn movzlq(&mut self, src: Mem, dst: Gpr) {
        // 32-bit mov zero-extends into the full register.
        dynasm!(self.ops ; .arch x64 ; mov Rd(dst.code()), DWORD [Rq(src.base.code()) + src.disp]);
    }

    fn addq(&mut self, src: Operand, dst: Gpr) {
        match src {
            Operand::Reg(s) => dynasm!(self.ops ; .arch x64 ; add Rq(dst.code()), Rq(s.code())),
            Operand::Imm(v) => {
                let v = i32::try_from(v).expect("addq: immediate must fit 32 bits");
                dynasm!(self.ops ; .arch x64 ; add Rq(dst.code()), v);
            }
            Operand::Mem(m) => {
                dynasm!(self.ops ; .arch x64 ; add Rq(dst.code()), QWORD [Rq(m.base.code()) + m.disp]);
            }
        }
    }

    fn subq(&mut self, src: Operand, dst: Gpr) {
        match src {
            Operand::Reg(s) => dynasm!(self.ops ; .arch x64 ; sub Rq(dst.code()), Rq(s.code())),
            Operand::Imm(v) => {
                let v = i32::try_from(v).expect("subq: immediate must fit 32 bits");
                dynasm!(self.ops ; .arch x64 ; sub Rq(dst.code()), v);
            }
            Operand::Mem(m) => {
                dynasm!(self.ops ; .arch x64 ; sub Rq(dst.code()), QWORD [Rq(m.base.code()) + m.disp]);
            }
        }
    }

    fn imulq(&mut self, iv: i32, src: Gpr, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; imul Rq(dst.code()), Rq(src.code()), iv);
    }

    fn andq(&mut self, src: Operand, dst: Gpr) {
        match src {
            Operand::Reg(s) => dynasm!(self.ops ; .arch x64 ; and Rq(dst.code()), Rq(s.code())),
            Operand::Imm(v) => {
                let v = i32::try_from(v).expect("andq: immediate must fit 32 bits");
                dynasm!(self.ops ; .arch x64 ; and Rq(dst.code()), v);
            }
            Operand::Mem(m) => {
                dynasm!(self.ops ; .arch x64 ; and Rq(dst.code()), QWORD [Rq(m.base.code()) + m.disp]);
            }
        }
    }

    fn xorq(&mut self, src: Operand, dst: Gpr) {
        match src {
            Operand::Reg(s) => dynasm!(self.ops ; .arch x64 ; xor Rq(dst.code()), Rq(s.code())),
            Operand::Imm(v) => {
                let v = i32::try_from(v).expect("xorq: immediate must fit 32 bits");
                dynasm!(self.ops ; .arch x64 ; xor Rq(dst.code()), v);
            }
            Operand::Mem(m) => {
                dynasm!(self.ops ; .arch x64 ; xor Rq(dst.code()), QWORD [Rq(m.base.code()) + m.disp]);
            }
        }
    }

    fn btsq(&mut self, bit: u8, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; bts Rq(dst.code()), BYTE bit as i8);
    }

    fn negq(&mut self, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; neg Rq(dst.code()));
    }

    fn xorl(&mut self, a: Gpr, b: Gpr) {
        dynasm!(self.ops ; .arch x64 ; xor Rd(b.code()), Rd(a.code()));
    }

    fn xchgq(&mut self, a: Gpr, b: Gpr) {
        dynasm!(self.ops ; .arch x64 ; xchg Rq(a.code()), Rq(b.code()));
    }

    fn rolw(&mut self, bits: u8, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; rol Rw(dst.code()), bits as i8);
    }

    fn bswapl(&mut self, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; bswap Rd(dst.code()));
    }

    fn bswapq(&mut self, dst: Gpr) {
        dynasm!(self.ops ; .arch x64 ; bswap Rq(dst.code()));
    }

    fn cmpq(&mut self, lhs: Operand, rhs: Operand) {
        match (lhs, rhs) {
            (Operand::Reg(l), Operand::Reg(r)) => {
                dynasm!(self.ops ; .arch x64 ; cmp Rq(r.code()), Rq(l.code()));
            }
            (Operand::Imm(v), Operand::Reg(r)) => {
                let v = i32::try_from(v).expect("cmpq: immediate must fit 32 bits");
                dynasm!(self.ops ; .arch x64 ; cmp Rq(r.code()), v);
            }
            (Operand::Mem(m), Operand::Reg(r)) => {
                dynasm!(self.ops ; .arch x64 ; cmp Rq(r.code()), QWORD [Rq(m.base.code()) + m.disp]);
            }
            (Operand::Reg(l), Operand::Mem(m)) => {
                dynasm!(self.ops ; .arch x64 ; cmp QWORD [Rq(m.base.code()) + m.disp], Rq(l.code()));
            }
            (lhs, rhs) => panic!("cmpq: unsupported operand combination {lhs:?} vs {rhs:?}"),
        }
    }

    fn testq(&mut self, a: Gpr, b: Gpr) {
        dynasm!(self.ops ; .arch x64 ; test Rq(b.code()), Rq(a.code()));
    }

    fn jmp(&mut self, label: AsmLabel) {
        let l = self.dyn_label(label);
        dynasm!(self.ops ; .arch x64 ; jmp =>l);
    }

    fn jcc(&mut self, cc: Cond, label: AsmLabel) {
        let l = self.dyn_label(label);
        match cc {
            Cond::E => dynasm!(self.ops ; .arch x64 ; je =>l),
            Cond::Ne => dynasm!(self.ops ; .arch x64 ; jne =>l),
            Cond::L => dynasm!(self.ops ; .arch x64 ; jl =>l),
            Cond::B => dynasm!(self.ops ; .arch x64 ; jb =>l),
            Cond::Ae => dynasm!(self.ops ; .arch x64 ; jae =>l),
            Cond::Be => dynasm!(self.ops ; .arch x64 ; jbe =>l),
        }
    }

    fn callq(&mut self, target: Operand) {
        match target {
            Operand::Reg(r) => dynasm!(self.ops ; .arch x64 ; call Rq(r.code())),
            Operand::Mem(m) => {
                dynasm!(self.ops ; .arch x64 ; call QWORD [Rq(m.base.code()) + m.disp]);
            }
            Operand::Imm(_) => panic!("callq: immediate targets go through a register"),
        }
    }

    fn ret(&mut self) {
        dynasm!(self.ops ; .arch x64 ; ret);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_codes_match_hardware_encoding() {
        assert_eq!(Gpr::Rax.code(), 0);
        assert_eq!(Gpr::Rsp.code(), 4);
        assert_eq!(Gpr::R8.code(), 8);
        assert_eq!(Gpr::R15.code(), 15);
    }

    #[test]
    fn assembler_emits_and_finalizes() {
        let mut asm = X64Assembler::new();
        let l = asm.new_label();
        asm.movq(Operand::Imm(7), Operand::Reg(Gpr::Rax));
        asm.movq(Operand::Reg(Gpr::Rax), Operand::Mem(ptr(Gpr::Rsp, -8)));
        asm.cmpq(Operand::Imm(0), Operand::Reg(Gpr::Rax));
        asm.jcc(Cond::E, l);
        asm.xorl(Gpr::Rax, Gpr::Rax);
        asm.bind(l);
        asm.ret();
        let buf = asm.finalize();
        assert!(!buf.is_empty());
    }

    #[test]
    fn raw_bytes_pass_through() {
        let mut asm = X64Assembler::new();
        // int3; ret
        asm.raw(&[0xcc]);
        asm.ret();
        let buf = asm.finalize();
        assert_eq!(buf[0], 0xcc);
        assert_eq!(buf[1], 0xc3);
    }
}
