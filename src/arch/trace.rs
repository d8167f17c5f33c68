//! Recording assembler.
//!
//! Captures every operation emitted through the [`Asm`] seam as a typed
//! [`TraceOp`]. The backend tests assert on these directly — spill ordering,
//! marshaling sources, swap sequences — without depending on instruction
//! encodings or disassembler formatting. Also handy for eyeballing a
//! lowering: the `Display` impl prints one operation per line.

use std::fmt;

use crate::arch::x64::{Asm, AsmLabel, Cond, Gpr, Mem, Operand};

/// One recorded assembler operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOp {
    Bind(AsmLabel),
    Raw(Vec<u8>),
    Movq(Operand, Operand),
    Leaq(Mem, Gpr),
    LeaqLabel(AsmLabel, Gpr),
    Movb(Gpr, Mem),
    Movw(Gpr, Mem),
    Movl(Gpr, Mem),
    Movzbq(Mem, Gpr),
    Movzwq(Mem, Gpr),
    Movzlq(Mem, Gpr),
    Addq(Operand, Gpr),
    Subq(Operand, Gpr),
    Imulq(i32, Gpr, Gpr),
    Andq(Operand, Gpr),
    Xorq(Operand, Gpr),
    Btsq(u8, Gpr),
    Negq(Gpr),
    Xorl(Gpr, Gpr),
    Xchgq(Gpr, Gpr),
    Rolw(u8, Gpr),
    Bswapl(Gpr),
    Bswapq(Gpr),
    Cmpq(Operand, Operand),
    Testq(Gpr, Gpr),
    Jmp(AsmLabel),
    Jcc(Cond, AsmLabel),
    Callq(Operand),
    Ret,
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceOp::Bind(l) => write!(f, "{l}:"),
            TraceOp::Raw(bytes) => {
                write!(f, ".byte")?;
                for b in bytes {
                    write!(f, " {b:#04x}")?;
                }
                Ok(())
            }
            TraceOp::Movq(s, d) => write!(f, "movq   {s}, {d}"),
            TraceOp::Leaq(s, d) => write!(f, "leaq   {s}, {d}"),
            TraceOp::LeaqLabel(l, d) => write!(f, "leaq   {l}, {d}"),
            TraceOp::Movb(s, d) => write!(f, "movb   {s}, {d}"),
            TraceOp::Movw(s, d) => write!(f, "movw   {s}, {d}"),
            TraceOp::Movl(s, d) => write!(f, "movl   {s}, {d}"),
            TraceOp::Movzbq(s, d) => write!(f, "movzbq {s}, {d}"),
            TraceOp::Movzwq(s, d) => write!(f, "movzwq {s}, {d}"),
            TraceOp::Movzlq(s, d) => write!(f, "movzlq {s}, {d}"),
            TraceOp::Addq(s, d) => write!(f, "addq   {s}, {d}"),
            TraceOp::Subq(s, d) => write!(f, "subq   {s}, {d}"),
            TraceOp::Imulq(v, s, d) => write!(f, "imulq  ${v}, {s}, {d}"),
            TraceOp::Andq(s, d) => write!(f, "andq   {s}, {d}"),
            TraceOp::Xorq(s, d) => write!(f, "xorq   {s}, {d}"),
            TraceOp::Btsq(b, d) => write!(f, "btsq   ${b}, {d}"),
            TraceOp::Negq(d) => write!(f, "negq   {d}"),
            TraceOp::Xorl(a, b) => write!(f, "xorl   {a}, {b}"),
            TraceOp::Xchgq(a, b) => write!(f, "xchgq  {a}, {b}"),
            TraceOp::Rolw(n, d) => write!(f, "rolw   ${n}, {d}"),
            TraceOp::Bswapl(d) => write!(f, "bswapl {d}"),
            TraceOp::Bswapq(d) => write!(f, "bswapq {d}"),
            TraceOp::Cmpq(a, b) => write!(f, "cmpq   {a}, {b}"),
            TraceOp::Testq(a, b) => write!(f, "testq  {a}, {b}"),
            TraceOp::Jmp(l) => write!(f, "jmp    {l}"),
            TraceOp::Jcc(cc, l) => write!(f, "j{cc}    {l}"),
            TraceOp::Callq(t) => write!(f, "callq  *{t}"),
            TraceOp::Ret => write!(f, "ret"),
        }
    }
}

/// [`Asm`] implementation that records instead of encoding.
#[derive(Debug, Default)]
pub struct TraceAsm {
    pub ops: Vec<TraceOp>,
    next_label: u32,
}

impl TraceAsm {
    pub fn new() -> TraceAsm {
        TraceAsm::default()
    }

    /// Recorded operations matching `pred`, in emission order.
    pub fn find(&self, pred: impl Fn(&TraceOp) -> bool) -> Vec<(usize, &TraceOp)> {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, op)| pred(op))
            .collect()
    }

    /// Position of the first `callq`, for before/after-the-call assertions.
    pub fn call_position(&self) -> Option<usize> {
        self.ops
            .iter()
            .position(|op| matches!(op, TraceOp::Callq(_)))
    }
}

impl fmt::Display for TraceAsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.ops {
            writeln!(f, "{op}")?;
        }
        Ok(())
    }
}

impl Asm for TraceAsm {
    fn new_label(&mut self) -> AsmLabel {
        let l = AsmLabel(self.next_label);
        self.next_label += 1;
        l
    }

    fn bind(&mut self, label: AsmLabel) {
        self.ops.push(TraceOp::Bind(label));
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.ops.push(TraceOp::Raw(bytes.to_vec()));
    }

    fn movq(&mut self, src: Operand, dst: Operand) {
        self.ops.push(TraceOp::Movq(src, dst));
    }

    fn leaq(&mut self, src: Mem, dst: Gpr) {
        self.ops.push(TraceOp::Leaq(src, dst));
    }

    fn leaq_label(&mut self, label: AsmLabel, dst: Gpr) {
        self.ops.push(TraceOp::LeaqLabel(label, dst));
    }

    fn movb(&mut self, src: Gpr, dst: Mem) {
        self.ops.push(TraceOp::Movb(src, dst));
    }

    fn movw(&mut self, src: Gpr, dst: Mem) {
        self.ops.push(TraceOp::Movw(src, dst));
    }

    fn movl(&mut self, src: Gpr, dst: Mem) {
        self.ops.push(TraceOp::Movl(src, dst));
    }

    fn movzbq(&mut self, src: Mem, dst: Gpr) {
        self.ops.push(TraceOp::Movzbq(src, dst));
    }

    fn movzwq(&mut self, src: Mem, dst: Gpr) {
        self.ops.push(TraceOp::Movzwq(src, dst));
    }

    fn movzlq(&mut self, src: Mem, dst: Gpr) {
        self.ops.push(TraceOp::Movzlq(src, dst));
    }

    fn addq(&mut self, src: Operand, dst: Gpr) {
        self.ops.push(TraceOp::Addq(src, dst));
    }

    fn subq(&mut self, src: Operand, dst: Gpr) {
        self.ops.push(TraceOp::Subq(src, dst));
    }

    fn imulq(&mut self, iv: i32, src: Gpr, dst: Gpr) {
        self.ops.push(TraceOp::Imulq(iv, src, dst));
    }

    fn andq(&mut self, src: Operand, dst: Gpr) {
        self.ops.push(TraceOp::Andq(src, dst));
    }

    fn xorq(&mut self, src: Operand, dst: Gpr) {
        self.ops.push(TraceOp::Xorq(src, dst));
    }

    fn btsq(&mut self, bit: u8, dst: Gpr) {
        self.ops.push(TraceOp::Btsq(bit, dst));
    }

    fn negq(&mut self, dst: Gpr) {
        self.ops.push(TraceOp::Negq(dst));
    }

    fn xorl(&mut self, a: Gpr, b: Gpr) {
        self.ops.push(TraceOp::Xorl(a, b));
    }

    fn xchgq(&mut self, a: Gpr, b: Gpr) {
        self.ops.push(TraceOp::Xchgq(a, b));
    }

    fn rolw(&mut self, bits: u8, dst: Gpr) {
        self.ops.push(TraceOp::Rolw(bits, dst));
    }

    fn bswapl(&mut self, dst: Gpr) {
        self.ops.push(TraceOp::Bswapl(dst));
    }

    fn bswapq(&mut self, dst: Gpr) {
        self.ops.push(TraceOp::Bswapq(dst));
    }

    fn cmpq(&mut self, lhs: Operand, rhs: Operand) {
        self.ops.push(TraceOp::Cmpq(lhs, rhs));
    }

    fn testq(&mut self, a: Gpr, b: Gpr) {
        self.ops.push(TraceOp::Testq(a, b));
    }

    fn jmp(&mut self, label: AsmLabel) {
        self.ops.push(TraceOp::Jmp(label));
    }

    fn jcc(&mut self, cc: Cond, label: AsmLabel) {
        self.ops.push(TraceOp::Jcc(cc, label));
    }

    fn callq(&mut self, target: Operand) {
        self.ops.push(TraceOp::Callq(target));
    }

    fn ret(&mut self) {
        self.ops.push(TraceOp::Ret);
    }
}
