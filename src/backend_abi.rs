//! The ABI layer of the code generator: everything that touches the host
//! calling convention.
//!
//! Three call lowerings share the register discipline:
//!
//! - `gcall` (runtime-managed): spill all live virtuals, marshal into the
//!   callee's declared homes, restore the reserved registers for the
//!   callee, call, re-save, recover returns, reload.
//! - `icall`: the same template with an implicit receiver prepended and an
//!   indirect target through the method table.
//! - `ccall` (native): leaner — only non-reserved homes spill, arguments go
//!   in the fixed register sequence, the result comes back in `rax`.
//!
//! Return-slot stores (`strq`/`strp`) may swap the virtual→physical map to
//! free the declared return register. That mutation is safe only because
//! translators materialize returns as the last thing before `halt`.

use crate::abi::{CallHandle, FnEntry, ParamKind, Parameter};
use crate::arch::x64::{Asm, Gpr, Operand, ptr};
use crate::backend::CodeGen;
use crate::host::{ARG_ORDER, PTR_SIZE, RESERVED, VTAB_FUNC_BASE};
use crate::ir::{ArgVec, GenericRegister, PointerRegister, Register};

/// How a runtime-managed call reaches its target.
enum CallBody {
    /// Direct: load the address and call through `r12`.
    Direct(usize),
    /// Indirect: load the method table from `vt`'s spill slot and call
    /// through its function array.
    Vtable { vt: PointerRegister, slot: u32 },
}

/// Pointer-kind agreement between an encoded register and a parameter.
fn checkptr(ri: u8, param: &Parameter) -> bool {
    param.pointer == (ri & 0x80 != 0)
}

impl<'r> CodeGen<'r> {
    // ── Prologue & epilogue ─────────────────────────────────────────────

    /// Copy in-register incoming arguments to their argument slots. Stack
    /// arguments already live in the caller's frame.
    pub(crate) fn abi_prologue<A: Asm>(&self, asm: &mut A) {
        for (i, param) in self.layout.args.iter().enumerate() {
            if let ParamKind::InRegister(reg) = param.kind {
                asm.movq(Operand::Reg(reg), Operand::Mem(self.argv(i)));
            }
        }
    }

    /// Nothing to do: `strq`/`strp` lowering already materialized returns
    /// into their declared homes.
    pub(crate) fn abi_epilogue<A: Asm>(&self, _asm: &mut A) {}

    // ── Reserved registers ──────────────────────────────────────────────

    pub(crate) fn abi_save_reserved<A: Asm>(&self, asm: &mut A) {
        for reg in RESERVED {
            asm.movq(Operand::Reg(reg), Operand::Mem(self.rslot(reg)));
        }
    }

    pub(crate) fn abi_load_reserved<A: Asm>(&self, asm: &mut A) {
        for reg in RESERVED {
            asm.movq(Operand::Mem(self.rslot(reg)), Operand::Reg(reg));
        }
    }

    // ── Argument & return bridging ──────────────────────────────────────

    pub(crate) fn abi_load_int<A: Asm>(&self, asm: &mut A, i: usize, d: GenericRegister) {
        asm.movq(Operand::Mem(self.argv(i)), Operand::Reg(self.r(d.into())));
    }

    pub(crate) fn abi_load_ptr<A: Asm>(&self, asm: &mut A, i: usize, d: PointerRegister) {
        asm.movq(Operand::Mem(self.argv(i)), Operand::Reg(self.r(d.into())));
    }

    pub(crate) fn abi_store_int<A: Asm>(&mut self, asm: &mut A, s: GenericRegister, i: usize) {
        self.store_ret(asm, s.into(), i);
    }

    pub(crate) fn abi_store_ptr<A: Asm>(&mut self, asm: &mut A, s: PointerRegister, i: usize) {
        self.store_ret(asm, s.into(), i);
    }

    /// Store `s` into return slot `i`. A declared return register held by
    /// another live virtual is freed with a single `xchg`, swapping the two
    /// virtuals' homes in the allocation map.
    fn store_ret<A: Asm>(&mut self, asm: &mut A, s: Register, i: usize) {
        let m = match self.layout.rets.get(i) {
            Some(p) => *p,
            None => panic!("return slot {i} out of range"),
        };

        // Zero-register source: a literal zero return.
        if s.is_zero() {
            match m.kind {
                ParamKind::OnStack(_) => asm.movq(Operand::Imm(0), Operand::Mem(self.retv(i))),
                ParamKind::InRegister(reg) => asm.xorl(reg, reg),
            }
            return;
        }

        let rs = self.r(s);
        let reg = match m.kind {
            ParamKind::OnStack(_) => {
                asm.movq(Operand::Reg(rs), Operand::Mem(self.retv(i)));
                return;
            }
            ParamKind::InRegister(reg) => reg,
        };

        // Already in the declared register.
        if rs == reg {
            return;
        }

        match self.homes.iter().position(|&h| h == reg) {
            // Return register is free: plain move.
            None => asm.movq(Operand::Reg(rs), Operand::Reg(reg)),
            // Occupied: swap values and homes.
            Some(other) => {
                asm.xchgq(rs, reg);
                let si = self
                    .live
                    .iter()
                    .position(|&v| v == s)
                    .expect("source register is live");
                self.homes.swap(si, other);
            }
        }
    }

    // ── Marshaling into a callee's parameter homes ──────────────────────

    fn set_arg<A: Asm>(&self, asm: &mut A, ri: u8, param: &Parameter) {
        if !checkptr(ri, param) {
            panic!("passing arguments in different kind of registers");
        }
        let rr = Register::decode(ri);
        match param.kind {
            ParamKind::OnStack(off) => self.set_arg_stack(asm, rr, off),
            ParamKind::InRegister(reg) => self.set_arg_register(asm, rr, reg),
        }
    }

    fn set_arg_stack<A: Asm>(&self, asm: &mut A, rr: Register, off: u32) {
        if rr.is_zero() {
            asm.movq(Operand::Imm(0), Operand::Mem(ptr(Gpr::Rsp, off as i32)));
        } else {
            asm.movq(
                Operand::Reg(self.r(rr)),
                Operand::Mem(ptr(Gpr::Rsp, off as i32)),
            );
        }
    }

    fn set_arg_register<A: Asm>(&self, asm: &mut A, rr: Register, reg: Gpr) {
        if rr.is_zero() {
            asm.xorl(reg, reg);
        } else if self.is_reg_used(reg) {
            // The destination still holds a live virtual; read the source's
            // spilled copy so earlier marshaling can't have clobbered it.
            asm.movq(Operand::Mem(self.slot(rr)), Operand::Reg(reg));
        } else {
            asm.movq(Operand::Reg(self.r(rr)), Operand::Reg(reg));
        }
    }

    // ── Runtime-managed calls ───────────────────────────────────────────

    pub(crate) fn abi_call_func<A: Asm>(
        &mut self,
        asm: &mut A,
        func: CallHandle,
        args: &ArgVec,
        rets: &ArgVec,
    ) {
        let addr = self.fn_addr(func);
        self.call_function(asm, func, None, args, rets, CallBody::Direct(addr));
    }

    pub(crate) fn abi_call_method<A: Asm>(
        &mut self,
        asm: &mut A,
        vt: PointerRegister,
        vp: PointerRegister,
        method: CallHandle,
        args: &ArgVec,
        rets: &ArgVec,
    ) {
        let slot = match self.registry.entry(method).target {
            crate::abi::CallTarget::Slot(slot) => slot,
            crate::abi::CallTarget::Addr(_) => {
                panic!("{method} names a function address, not a method slot")
            }
        };
        self.call_function(
            asm,
            method,
            Some(vp.into()),
            args,
            rets,
            CallBody::Vtable { vt, slot },
        );
    }

    /// The common call template. `this` is the implicit receiver for
    /// method calls, consuming the callee's first declared argument.
    fn call_function<A: Asm>(
        &mut self,
        asm: &mut A,
        func: CallHandle,
        this: Option<Register>,
        args: &ArgVec,
        rets: &ArgVec,
        body: CallBody,
    ) {
        let entry: FnEntry = self.registry.entry(func).clone();
        let ac = this.is_some() as usize;

        if rets.len() != entry.layout.rets.len()
            || entry.layout.args.len() < ac
            || args.len() != entry.layout.args.len() - ac
        {
            panic!("argument or return value count mismatch for {func}");
        }

        // Spill every live virtual; marshaling below reads spilled copies
        // where homes alias parameter registers.
        for (i, &v) in self.live.iter().enumerate() {
            asm.movq(Operand::Reg(self.homes[i]), Operand::Mem(self.slot(v)));
        }

        for (i, param) in entry.layout.args.iter().enumerate() {
            match (i, this) {
                (0, Some(receiver)) => self.set_arg(asm, receiver.encode(), param),
                _ => self.set_arg(asm, args.raw(i - ac), param),
            }
        }

        // The callee sees the host's reserved-register values.
        self.abi_load_reserved(asm);
        match body {
            CallBody::Direct(addr) => {
                asm.movq(Operand::Imm(addr as i64), Operand::Reg(Gpr::R12));
                asm.callq(Operand::Reg(Gpr::R12));
            }
            CallBody::Vtable { vt, slot } => {
                asm.movq(
                    Operand::Mem(self.slot(vt.into())),
                    Operand::Reg(Gpr::R12),
                );
                asm.callq(Operand::Mem(ptr(
                    Gpr::R12,
                    VTAB_FUNC_BASE + slot as i32 * PTR_SIZE,
                )));
            }
        }
        self.abi_save_reserved(asm);

        // Returns whose declared register is occupied park in the
        // receiving virtual's spill slot; stack returns defer until after
        // the reload below.
        let mut deferred: Vec<(Register, u32)> = Vec::new();
        let mut direct: Vec<Register> = Vec::new();
        for (i, retv) in entry.layout.rets.iter().enumerate() {
            let rr = rets.get(i);
            if rr.is_zero() {
                continue;
            }
            match retv.kind {
                ParamKind::OnStack(off) => deferred.push((rr, off)),
                ParamKind::InRegister(reg) => {
                    if self.is_reg_used(reg) {
                        asm.movq(Operand::Reg(reg), Operand::Mem(self.slot(rr)));
                    }
                }
            }
        }
        for (i, retv) in entry.layout.rets.iter().enumerate() {
            let rr = rets.get(i);
            if rr.is_zero() {
                continue;
            }
            if let ParamKind::InRegister(reg) = retv.kind {
                if !self.is_reg_used(reg) {
                    asm.movq(Operand::Reg(reg), Operand::Reg(self.r(rr)));
                    direct.push(rr);
                }
            }
        }

        // Reload everything except the virtuals now holding return values.
        for (i, &v) in self.live.iter().enumerate() {
            if deferred.iter().any(|&(r, _)| r == v) || direct.contains(&v) {
                continue;
            }
            asm.movq(Operand::Mem(self.slot(v)), Operand::Reg(self.homes[i]));
        }

        for (rr, off) in deferred {
            asm.movq(
                Operand::Mem(ptr(Gpr::Rsp, off as i32)),
                Operand::Reg(self.r(rr)),
            );
        }
    }

    // ── Native calls ────────────────────────────────────────────────────

    /// C-ABI call: at most six register arguments, at most one return.
    pub(crate) fn abi_call_native<A: Asm>(
        &mut self,
        asm: &mut A,
        func: CallHandle,
        args: &ArgVec,
        rets: &ArgVec,
    ) {
        let addr = self.fn_addr(func);

        if rets.len() > 1 {
            panic!("native functions can only have at most 1 return value");
        }
        if args.len() > ARG_ORDER.len() {
            panic!("not implemented: passing arguments on stack for native functions");
        }

        // Reserved homes survive a C call; everything else spills.
        for (i, &v) in self.live.iter().enumerate() {
            if !RESERVED.contains(&self.homes[i]) {
                asm.movq(Operand::Reg(self.homes[i]), Operand::Mem(self.slot(v)));
            }
        }

        for i in 0..args.len() {
            let rr = args.get(i);
            let rd = ARG_ORDER[i];
            if rr.is_zero() {
                asm.xorl(rd, rd);
            } else {
                let rs = self.r(rr);
                if ARG_ORDER.contains(&rs) {
                    // An earlier argument move may have overwritten rs.
                    asm.movq(Operand::Mem(self.slot(rr)), Operand::Reg(rd));
                } else {
                    asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                }
            }
        }

        asm.movq(Operand::Imm(addr as i64), Operand::Reg(Gpr::Rax));
        asm.callq(Operand::Reg(Gpr::Rax));

        let mut rv: Option<Register> = None;
        if rets.len() == 1 {
            let rr = rets.get(0);
            if !rr.is_zero() {
                asm.movq(Operand::Reg(Gpr::Rax), Operand::Reg(self.r(rr)));
                rv = Some(rr);
            }
        }

        for (i, &v) in self.live.iter().enumerate() {
            if Some(v) == rv || RESERVED.contains(&self.homes[i]) {
                continue;
            }
            asm.movq(Operand::Mem(self.slot(v)), Operand::Reg(self.homes[i]));
        }
    }
}
