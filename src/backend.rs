//! amd64 code generator.
//!
//! Walks a [`Program`] in chain order and lowers each instruction through
//! the [`Asm`] seam. Virtual registers are bound to physical homes up
//! front from a fixed allocation order — there is no general register
//! allocator; the interesting contract is the spill discipline around
//! calls, which lives in `backend_abi`.
//!
//! Frame layout, growing upward from `rsp` after the prologue:
//!
//! ```text
//! rsp + 0                outgoing call arguments / memmove staging
//! rsp + spill_base       one 8-byte spill slot per live virtual
//! rsp + rslot_base       save slots for the reserved registers
//! rsp + argsave_base     save slots for in-register incoming arguments
//! rsp + frame            return address, then the incoming argument block
//! ```

use std::collections::HashMap;

use crate::abi::{CallTarget, FnLayout, ParamKind, Registry};
use crate::arch::x64::{Asm, AsmLabel, Cond, Gpr, Mem, Operand, ptr};
use crate::host::{ALLOC_ORDER, MEMMOVE_ARGS, RESERVED};
use crate::ir::{GenericRegister, InstrId, Op, PointerRegister, Program, Register};

/// Compiles one program against one function layout. Create with
/// [`CodeGen::new`], optionally attach the stack-guard and block-copy
/// handles, then call [`CodeGen::compile`].
pub struct CodeGen<'r> {
    pub(crate) registry: &'r Registry,
    pub(crate) layout: FnLayout,
    pub(crate) stack_guard: Option<crate::abi::CallHandle>,
    pub(crate) block_copy: Option<crate::abi::CallHandle>,

    // Bound by analyze().
    pub(crate) live: Vec<Register>,
    pub(crate) homes: Vec<Gpr>,
    pub(crate) spill_base: u32,
    pub(crate) rslot_base: u32,
    pub(crate) argsave_base: u32,
    /// Per incoming argument: offset of its save slot, for in-register
    /// arguments only.
    pub(crate) arg_save: Vec<Option<u32>>,
    pub(crate) frame: u32,
}

impl<'r> CodeGen<'r> {
    pub fn new(registry: &'r Registry, layout: FnLayout) -> CodeGen<'r> {
        CodeGen {
            registry,
            layout,
            stack_guard: None,
            block_copy: None,
            live: Vec::new(),
            homes: Vec::new(),
            spill_base: 0,
            rslot_base: 0,
            argsave_base: 0,
            arg_save: Vec::new(),
            frame: 0,
        }
    }

    /// Emit an entry stack check that calls this handle to grow the stack.
    pub fn with_stack_guard(mut self, handle: crate::abi::CallHandle) -> Self {
        self.stack_guard = Some(handle);
        self
    }

    /// Route `bcopy` through this handle (the host memmove).
    pub fn with_block_copy(mut self, handle: crate::abi::CallHandle) -> Self {
        self.block_copy = Some(handle);
        self
    }

    // ── Register and frame queries ──────────────────────────────────────

    /// Physical home of a live virtual register.
    pub(crate) fn r(&self, v: Register) -> Gpr {
        if v.is_zero() {
            panic!("the zero register has no physical home");
        }
        match self.live.iter().position(|&lv| lv == v) {
            Some(i) => self.homes[i],
            None => panic!("virtual register {v} is not live in this program"),
        }
    }

    pub(crate) fn is_reg_used(&self, reg: Gpr) -> bool {
        self.homes.contains(&reg)
    }

    /// Spill slot of a live virtual register.
    pub(crate) fn slot(&self, v: Register) -> Mem {
        match self.live.iter().position(|&lv| lv == v) {
            Some(i) => ptr(Gpr::Rsp, (self.spill_base + 8 * i as u32) as i32),
            None => panic!("virtual register {v} has no spill slot"),
        }
    }

    /// Save slot of a reserved register.
    pub(crate) fn rslot(&self, reg: Gpr) -> Mem {
        match RESERVED.iter().position(|&r| r == reg) {
            Some(i) => ptr(Gpr::Rsp, (self.rslot_base + 8 * i as u32) as i32),
            None => panic!("{reg} is not a reserved register"),
        }
    }

    /// Home slot of incoming argument `i`: the save slot for in-register
    /// arguments, the caller's stack slot otherwise.
    pub(crate) fn argv(&self, i: usize) -> Mem {
        let param = match self.layout.args.get(i) {
            Some(p) => p,
            None => panic!("argument slot {i} out of range"),
        };
        match param.kind {
            ParamKind::InRegister(_) => {
                let off = self.arg_save[i].expect("in-register argument has a save slot");
                ptr(Gpr::Rsp, off as i32)
            }
            ParamKind::OnStack(off) => ptr(Gpr::Rsp, (self.frame + 8 + off) as i32),
        }
    }

    /// Caller-owned slot of stack return `i`.
    pub(crate) fn retv(&self, i: usize) -> Mem {
        let param = match self.layout.rets.get(i) {
            Some(p) => p,
            None => panic!("return slot {i} out of range"),
        };
        match param.kind {
            ParamKind::OnStack(off) => ptr(Gpr::Rsp, (self.frame + 8 + off) as i32),
            ParamKind::InRegister(_) => panic!("return slot {i} is not on the stack"),
        }
    }

    pub(crate) fn fn_addr(&self, handle: crate::abi::CallHandle) -> usize {
        match self.registry.entry(handle).target {
            CallTarget::Addr(addr) => addr,
            CallTarget::Slot(_) => panic!("{handle} names a method slot, not an address"),
        }
    }

    // ── Analysis ────────────────────────────────────────────────────────

    /// Collect live virtual registers in first-use order, bind physical
    /// homes, and size the frame.
    fn analyze(&mut self, prog: &Program) {
        let mut live: Vec<Register> = Vec::new();
        let mut touch = |r: Register| {
            if !r.is_zero() && !live.contains(&r) {
                live.push(r);
            }
        };
        let mut stack_args = 0u32;

        for (_, ins) in prog.iter() {
            visit_registers(&ins.op, &mut touch);
            match &ins.op {
                Op::Gcall { func, .. } => {
                    stack_args = stack_args.max(self.registry.entry(*func).layout.stack_extent());
                }
                Op::Icall { method, .. } => {
                    stack_args = stack_args.max(self.registry.entry(*method).layout.stack_extent());
                }
                Op::Bcopy { .. } => stack_args = stack_args.max(MEMMOVE_ARGS),
                _ => {}
            }
        }

        if live.len() > ALLOC_ORDER.len() {
            panic!(
                "too many live virtual registers: {} exceed the {} physical homes",
                live.len(),
                ALLOC_ORDER.len()
            );
        }
        self.homes = ALLOC_ORDER[..live.len()].to_vec();
        self.live = live;

        self.spill_base = stack_args;
        self.rslot_base = self.spill_base + 8 * self.live.len() as u32;
        self.argsave_base = self.rslot_base + 8 * RESERVED.len() as u32;

        let mut save_off = self.argsave_base;
        self.arg_save = self
            .layout
            .args
            .iter()
            .map(|p| {
                p.in_register().then(|| {
                    let off = save_off;
                    save_off += 8;
                    off
                })
            })
            .collect();

        self.frame = (save_off + 15) & !15;
    }

    // ── Compilation ─────────────────────────────────────────────────────

    /// Lower `prog` through `asm`. Emits the stack check (when configured),
    /// frame setup, reserved-register saves, the argument prologue, then
    /// every instruction in chain order.
    pub fn compile<A: Asm>(&mut self, asm: &mut A, prog: &Program) {
        self.analyze(prog);

        let mut labels: HashMap<InstrId, AsmLabel> = HashMap::new();
        for (_, ins) in prog.iter() {
            for t in ins.op.branch_targets().iter().flatten() {
                labels.entry(*t).or_insert_with(|| asm.new_label());
            }
        }

        let entry = asm.new_label();
        let grow = self.stack_guard.map(|handle| (handle, asm.new_label()));

        asm.bind(entry);
        if let Some((_, stub)) = grow {
            self.abi_stack_check(asm, stub, 0);
        }
        if self.frame > 0 {
            asm.subq(Operand::Imm(self.frame as i64), Gpr::Rsp);
        }
        self.abi_save_reserved(asm);
        self.abi_prologue(asm);

        for (id, ins) in prog.iter() {
            if let Some(&l) = labels.get(&id) {
                asm.bind(l);
            }
            self.lower(asm, &ins.op, &labels);
        }

        // Grow-stack stub: runs with the frame not yet allocated, so it may
        // call out and retry from the top.
        if let Some((handle, stub)) = grow {
            let addr = self.fn_addr(handle);
            asm.bind(stub);
            asm.movq(Operand::Imm(addr as i64), Operand::Reg(Gpr::Rax));
            asm.callq(Operand::Reg(Gpr::Rax));
            asm.jmp(entry);
        }
    }

    fn target(&self, labels: &HashMap<InstrId, AsmLabel>, to: Option<InstrId>) -> AsmLabel {
        let id = to.expect("branch without a resolved target");
        labels[&id]
    }

    /// Materialize a generic source: its home, or `scratch` zeroed for the
    /// zero register.
    fn gen_src<A: Asm>(&self, asm: &mut A, rx: GenericRegister, scratch: Gpr) -> Gpr {
        if rx.is_zero() {
            asm.xorl(scratch, scratch);
            scratch
        } else {
            self.r(rx.into())
        }
    }

    /// Add an immediate of any width to a register, routing wide values
    /// through `rax`.
    fn addq_imm<A: Asm>(&self, asm: &mut A, iv: i64, dst: Gpr) {
        if iv == 0 {
            return;
        }
        if i32::try_from(iv).is_ok() {
            asm.addq(Operand::Imm(iv), dst);
        } else {
            asm.movq(Operand::Imm(iv), Operand::Reg(Gpr::Rax));
            asm.addq(Operand::Reg(Gpr::Rax), dst);
        }
    }

    fn lower<A: Asm>(&mut self, asm: &mut A, op: &Op, labels: &HashMap<InstrId, AsmLabel>) {
        match *op {
            Op::Nop => {}

            // ── Immediates ──
            Op::Ip { pr, pd } => {
                if !pd.is_zero() {
                    asm.movq(Operand::Imm(pr as i64), Operand::Reg(self.r(pd.into())));
                }
            }

            // ── Integer arithmetic ──
            Op::Addi { rx, iv, ry } => {
                if ry.is_zero() {
                    return;
                }
                let rd = self.r(ry.into());
                if rx.is_zero() {
                    if iv == 0 {
                        asm.xorl(rd, rd);
                    } else {
                        asm.movq(Operand::Imm(iv), Operand::Reg(rd));
                    }
                    return;
                }
                let rs = self.r(rx.into());
                if rs != rd {
                    asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                }
                self.addq_imm(asm, iv, rd);
            }
            Op::Muli { rx, iv, ry } => {
                if ry.is_zero() {
                    return;
                }
                let rd = self.r(ry.into());
                if rx.is_zero() {
                    asm.xorl(rd, rd);
                    return;
                }
                let iv = i32::try_from(iv)
                    .unwrap_or_else(|_| panic!("muli immediate {iv} out of 32-bit range"));
                asm.imulq(iv, self.r(rx.into()), rd);
            }
            Op::Andi { rx, iv, ry } => {
                if ry.is_zero() {
                    return;
                }
                let rd = self.r(ry.into());
                if rx.is_zero() {
                    asm.xorl(rd, rd);
                    return;
                }
                let rs = self.r(rx.into());
                if rs != rd {
                    asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                }
                if i32::try_from(iv).is_ok() {
                    asm.andq(Operand::Imm(iv), rd);
                } else {
                    asm.movq(Operand::Imm(iv), Operand::Reg(Gpr::Rax));
                    asm.andq(Operand::Reg(Gpr::Rax), rd);
                }
            }
            Op::Xori { rx, iv, ry } => {
                if ry.is_zero() {
                    return;
                }
                let rd = self.r(ry.into());
                if rx.is_zero() {
                    if iv == 0 {
                        asm.xorl(rd, rd);
                    } else {
                        asm.movq(Operand::Imm(iv), Operand::Reg(rd));
                    }
                    return;
                }
                let rs = self.r(rx.into());
                if rs != rd {
                    asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                }
                if iv == 0 {
                    return;
                }
                if i32::try_from(iv).is_ok() {
                    asm.xorq(Operand::Imm(iv), rd);
                } else {
                    asm.movq(Operand::Imm(iv), Operand::Reg(Gpr::Rax));
                    asm.xorq(Operand::Reg(Gpr::Rax), rd);
                }
            }
            Op::Sbiti { rx, iv, ry } => {
                if ry.is_zero() {
                    return;
                }
                let rd = self.r(ry.into());
                let bit = u8::try_from(iv)
                    .ok()
                    .filter(|&b| b < 64)
                    .unwrap_or_else(|| panic!("sbiti bit index {iv} out of range"));
                if rx.is_zero() {
                    asm.movq(Operand::Imm(1i64 << bit), Operand::Reg(rd));
                    return;
                }
                let rs = self.r(rx.into());
                if rs != rd {
                    asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                }
                asm.btsq(bit, rd);
            }
            Op::Add { rx, ry, rz } => {
                if rz.is_zero() {
                    return;
                }
                let rd = self.r(rz.into());
                match (rx.index(), ry.index()) {
                    (None, None) => asm.xorl(rd, rd),
                    (None, Some(_)) => {
                        let rs = self.r(ry.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    (Some(_), None) => {
                        let rs = self.r(rx.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    (Some(_), Some(_)) => {
                        let ra = self.r(rx.into());
                        let rb = self.r(ry.into());
                        if rd == ra {
                            asm.addq(Operand::Reg(rb), rd);
                        } else if rd == rb {
                            asm.addq(Operand::Reg(ra), rd);
                        } else {
                            asm.movq(Operand::Reg(ra), Operand::Reg(rd));
                            asm.addq(Operand::Reg(rb), rd);
                        }
                    }
                }
            }
            Op::Sub { rx, ry, rz } => {
                if rz.is_zero() {
                    return;
                }
                let rd = self.r(rz.into());
                match (rx.index(), ry.index()) {
                    (None, None) => asm.xorl(rd, rd),
                    (Some(_), None) => {
                        let rs = self.r(rx.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    (None, Some(_)) => {
                        let rs = self.r(ry.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                        asm.negq(rd);
                    }
                    (Some(_), Some(_)) => {
                        let ra = self.r(rx.into());
                        let rb = self.r(ry.into());
                        if rd == ra {
                            asm.subq(Operand::Reg(rb), rd);
                        } else {
                            asm.movq(Operand::Reg(ra), Operand::Reg(Gpr::Rax));
                            asm.subq(Operand::Reg(rb), Gpr::Rax);
                            asm.movq(Operand::Reg(Gpr::Rax), Operand::Reg(rd));
                        }
                    }
                }
            }

            // ── Loads ──
            Op::Lb { ps, rx } => {
                if rx.is_zero() {
                    return;
                }
                asm.movzbq(self.mem_at(ps), self.r(rx.into()));
            }
            Op::Lw { ps, rx } => {
                if rx.is_zero() {
                    return;
                }
                asm.movzwq(self.mem_at(ps), self.r(rx.into()));
            }
            Op::Ll { ps, rx } => {
                if rx.is_zero() {
                    return;
                }
                asm.movzlq(self.mem_at(ps), self.r(rx.into()));
            }
            Op::Lq { ps, rx } => {
                if rx.is_zero() {
                    return;
                }
                asm.movq(Operand::Mem(self.mem_at(ps)), Operand::Reg(self.r(rx.into())));
            }
            Op::Lp { ps, pd } => {
                if pd.is_zero() {
                    return;
                }
                asm.movq(Operand::Mem(self.mem_at(ps)), Operand::Reg(self.r(pd.into())));
            }

            // ── Stores ──
            Op::Sb { rx, pd } => {
                let dst = self.mem_at(pd);
                let rs = self.gen_src(asm, rx, Gpr::Rax);
                asm.movb(rs, dst);
            }
            Op::Sw { rx, pd } => {
                let dst = self.mem_at(pd);
                let rs = self.gen_src(asm, rx, Gpr::Rax);
                asm.movw(rs, dst);
            }
            Op::Sl { rx, pd } => {
                let dst = self.mem_at(pd);
                let rs = self.gen_src(asm, rx, Gpr::Rax);
                asm.movl(rs, dst);
            }
            Op::Sq { rx, pd } => {
                let dst = self.mem_at(pd);
                if rx.is_zero() {
                    asm.movq(Operand::Imm(0), Operand::Mem(dst));
                } else {
                    asm.movq(Operand::Reg(self.r(rx.into())), Operand::Mem(dst));
                }
            }
            Op::Sp { ps, pd } => {
                let dst = self.mem_at(pd);
                if ps.is_zero() {
                    asm.movq(Operand::Imm(0), Operand::Mem(dst));
                } else {
                    asm.movq(Operand::Reg(self.r(ps.into())), Operand::Mem(dst));
                }
            }

            // ── Pointer arithmetic ──
            Op::Addp { ps, rx, pd } => {
                if pd.is_zero() {
                    return;
                }
                let rd = self.r(pd.into());
                match (ps.index(), rx.index()) {
                    (None, None) => asm.xorl(rd, rd),
                    (Some(_), None) => {
                        let rs = self.r(ps.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    (None, Some(_)) => {
                        let rs = self.r(rx.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    (Some(_), Some(_)) => {
                        let ra = self.r(ps.into());
                        let rb = self.r(rx.into());
                        if rd != ra {
                            asm.movq(Operand::Reg(ra), Operand::Reg(rd));
                        }
                        asm.addq(Operand::Reg(rb), rd);
                    }
                }
            }
            Op::Subp { ps, rx, pd } => {
                if pd.is_zero() {
                    return;
                }
                let rd = self.r(pd.into());
                match (ps.index(), rx.index()) {
                    (None, None) => asm.xorl(rd, rd),
                    (Some(_), None) => {
                        let rs = self.r(ps.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    (None, Some(_)) => {
                        let rs = self.r(rx.into());
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                        asm.negq(rd);
                    }
                    (Some(_), Some(_)) => {
                        let ra = self.r(ps.into());
                        let rb = self.r(rx.into());
                        if rd != ra {
                            asm.movq(Operand::Reg(ra), Operand::Reg(rd));
                        }
                        asm.subq(Operand::Reg(rb), rd);
                    }
                }
            }
            Op::Addpi { ps, iv, pd } => {
                if pd.is_zero() {
                    return;
                }
                let rd = self.r(pd.into());
                if ps.is_zero() {
                    asm.movq(Operand::Imm(iv), Operand::Reg(rd));
                    return;
                }
                let rs = self.r(ps.into());
                match i32::try_from(iv) {
                    Ok(disp) if disp != 0 => asm.leaq(ptr(rs, disp), rd),
                    Ok(_) => {
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                    }
                    Err(_) => {
                        if rs != rd {
                            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
                        }
                        self.addq_imm(asm, iv, rd);
                    }
                }
            }

            // ── Byte swaps ──
            Op::Swapw { rx, ry } => {
                if let Some(rd) = self.swap_setup(asm, rx, ry) {
                    asm.rolw(8, rd);
                }
            }
            Op::Swapl { rx, ry } => {
                if let Some(rd) = self.swap_setup(asm, rx, ry) {
                    asm.bswapl(rd);
                }
            }
            Op::Swapq { rx, ry } => {
                if let Some(rd) = self.swap_setup(asm, rx, ry) {
                    asm.bswapq(rd);
                }
            }

            // ── Parameter bridge ──
            Op::Ldaq { id, rx } => {
                if !rx.is_zero() {
                    self.abi_load_int(asm, id, rx);
                }
            }
            Op::Ldap { id, pd } => {
                if !pd.is_zero() {
                    self.abi_load_ptr(asm, id, pd);
                }
            }
            Op::Strq { rx, id } => self.abi_store_int(asm, rx, id),
            Op::Strp { ps, id } => self.abi_store_ptr(asm, ps, id),

            // ── Branches ──
            Op::Beq { rx, ry, to } => self.lower_cmp(asm, rx, ry, Cond::E, to, labels),
            Op::Bne { rx, ry, to } => self.lower_cmp(asm, rx, ry, Cond::Ne, to, labels),
            Op::Blt { rx, ry, to } => self.lower_cmp(asm, rx, ry, Cond::L, to, labels),
            Op::Bltu { rx, ry, to } => self.lower_cmp(asm, rx, ry, Cond::B, to, labels),
            Op::Bgeu { rx, ry, to } => self.lower_cmp(asm, rx, ry, Cond::Ae, to, labels),
            Op::Beqn { ps, to } => {
                let l = self.target(labels, to);
                if ps.is_zero() {
                    asm.jmp(l);
                } else {
                    asm.cmpq(Operand::Imm(0), Operand::Reg(self.r(ps.into())));
                    asm.jcc(Cond::E, l);
                }
            }
            Op::Bnen { ps, to } => {
                // The null register is never non-null; nothing to emit.
                if !ps.is_zero() {
                    let l = self.target(labels, to);
                    asm.cmpq(Operand::Imm(0), Operand::Reg(self.r(ps.into())));
                    asm.jcc(Cond::Ne, l);
                }
            }
            Op::Jal { pd, to } => {
                let l = self.target(labels, to);
                if pd.is_zero() {
                    asm.jmp(l);
                } else {
                    let ret = asm.new_label();
                    asm.leaq_label(ret, self.r(pd.into()));
                    asm.jmp(l);
                    asm.bind(ret);
                }
            }
            Op::Bsw { rx, ref targets } => {
                if rx.is_zero() {
                    if let Some(Some(t)) = targets.first() {
                        asm.jmp(labels[t]);
                    }
                    return;
                }
                let rs = self.r(rx.into());
                for (i, t) in targets.iter().enumerate() {
                    if let Some(t) = t {
                        asm.cmpq(Operand::Imm(i as i64), Operand::Reg(rs));
                        asm.jcc(Cond::E, labels[t]);
                    }
                }
            }

            // ── Bulk memory ──
            Op::Bzero { nb, pd } => self.lower_bzero(asm, nb, pd),
            Op::Bcopy { ps, rx, pd } => self.abi_block_copy(asm, pd, ps, rx),

            // ── Calls ──
            Op::Ccall {
                func,
                ref args,
                ref rets,
            } => self.abi_call_native(asm, func, args, rets),
            Op::Gcall {
                func,
                ref args,
                ref rets,
            } => self.abi_call_func(asm, func, args, rets),
            Op::Icall {
                vt,
                vp,
                method,
                ref args,
                ref rets,
            } => self.abi_call_method(asm, vt, vp, method, args, rets),

            // ── Terminators ──
            Op::Halt => {
                self.abi_epilogue(asm);
                self.abi_load_reserved(asm);
                if self.frame > 0 {
                    asm.addq(Operand::Imm(self.frame as i64), Gpr::Rsp);
                }
                asm.ret();
            }
            Op::Break => asm.raw(&[0xcc]),
        }
    }

    /// Dereference base for memory ops. Loading or storing through the
    /// null register is a translator bug, caught here.
    fn mem_at(&self, ps: PointerRegister) -> Mem {
        if ps.is_zero() {
            panic!("memory access through the null register");
        }
        ptr(self.r(ps.into()), 0)
    }

    /// Common swap-op setup: move the source into the destination home.
    /// Returns `None` when the op is a no-op (zero destination) or fully
    /// resolved (zero source).
    fn swap_setup<A: Asm>(
        &self,
        asm: &mut A,
        rx: GenericRegister,
        ry: GenericRegister,
    ) -> Option<Gpr> {
        ry.index()?;
        let rd = self.r(ry.into());
        if rx.is_zero() {
            asm.xorl(rd, rd);
            return None;
        }
        let rs = self.r(rx.into());
        if rs != rd {
            asm.movq(Operand::Reg(rs), Operand::Reg(rd));
        }
        Some(rd)
    }

    fn lower_cmp<A: Asm>(
        &self,
        asm: &mut A,
        rx: GenericRegister,
        ry: GenericRegister,
        cc: Cond,
        to: Option<InstrId>,
        labels: &HashMap<InstrId, AsmLabel>,
    ) {
        let l = self.target(labels, to);
        match (rx.index(), ry.index()) {
            (None, None) => {
                // Constant compare of zero against zero.
                let taken = matches!(cc, Cond::E | Cond::Ae | Cond::Be);
                if taken {
                    asm.jmp(l);
                }
            }
            (Some(_), None) => {
                asm.cmpq(Operand::Imm(0), Operand::Reg(self.r(rx.into())));
                asm.jcc(cc, l);
            }
            (None, Some(_)) => {
                asm.xorl(Gpr::Rax, Gpr::Rax);
                asm.cmpq(Operand::Reg(self.r(ry.into())), Operand::Reg(Gpr::Rax));
                asm.jcc(cc, l);
            }
            (Some(_), Some(_)) => {
                asm.cmpq(
                    Operand::Reg(self.r(ry.into())),
                    Operand::Reg(self.r(rx.into())),
                );
                asm.jcc(cc, l);
            }
        }
    }

    fn lower_bzero<A: Asm>(&self, asm: &mut A, nb: i64, pd: PointerRegister) {
        if nb <= 0 {
            return;
        }
        if pd.is_zero() {
            panic!("memory access through the null register");
        }
        let rd = self.r(pd.into());
        asm.xorl(Gpr::Rax, Gpr::Rax);
        let mut off: i64 = 0;
        while nb - off >= 8 {
            asm.movq(Operand::Reg(Gpr::Rax), Operand::Mem(ptr(rd, off as i32)));
            off += 8;
        }
        if nb - off >= 4 {
            asm.movl(Gpr::Rax, ptr(rd, off as i32));
            off += 4;
        }
        if nb - off >= 2 {
            asm.movw(Gpr::Rax, ptr(rd, off as i32));
            off += 2;
        }
        if nb - off >= 1 {
            asm.movb(Gpr::Rax, ptr(rd, off as i32));
        }
    }
}

/// Feed every virtual register an operation touches to `f`.
fn visit_registers(op: &Op, f: &mut impl FnMut(Register)) {
    match *op {
        Op::Nop | Op::Halt | Op::Break => {}
        Op::Ip { pd, .. } => f(pd.into()),
        Op::Addi { rx, ry, .. }
        | Op::Muli { rx, ry, .. }
        | Op::Andi { rx, ry, .. }
        | Op::Xori { rx, ry, .. }
        | Op::Sbiti { rx, ry, .. }
        | Op::Swapw { rx, ry }
        | Op::Swapl { rx, ry }
        | Op::Swapq { rx, ry } => {
            f(rx.into());
            f(ry.into());
        }
        Op::Add { rx, ry, rz } | Op::Sub { rx, ry, rz } => {
            f(rx.into());
            f(ry.into());
            f(rz.into());
        }
        Op::Lb { ps, rx } | Op::Lw { ps, rx } | Op::Ll { ps, rx } | Op::Lq { ps, rx } => {
            f(ps.into());
            f(rx.into());
        }
        Op::Lp { ps, pd } | Op::Sp { ps, pd } => {
            f(ps.into());
            f(pd.into());
        }
        Op::Sb { rx, pd } | Op::Sw { rx, pd } | Op::Sl { rx, pd } | Op::Sq { rx, pd } => {
            f(rx.into());
            f(pd.into());
        }
        Op::Addp { ps, rx, pd } | Op::Subp { ps, rx, pd } | Op::Bcopy { ps, rx, pd } => {
            f(ps.into());
            f(rx.into());
            f(pd.into());
        }
        Op::Addpi { ps, pd, .. } => {
            f(ps.into());
            f(pd.into());
        }
        Op::Ldaq { rx, .. } => f(rx.into()),
        Op::Ldap { pd, .. } => f(pd.into()),
        Op::Strq { rx, .. } => f(rx.into()),
        Op::Strp { ps, .. } => f(ps.into()),
        Op::Beq { rx, ry, .. }
        | Op::Bne { rx, ry, .. }
        | Op::Blt { rx, ry, .. }
        | Op::Bltu { rx, ry, .. }
        | Op::Bgeu { rx, ry, .. } => {
            f(rx.into());
            f(ry.into());
        }
        Op::Beqn { ps, .. } | Op::Bnen { ps, .. } => f(ps.into()),
        Op::Jal { pd, .. } => f(pd.into()),
        Op::Bsw { rx, .. } => f(rx.into()),
        Op::Bzero { pd, .. } => f(pd.into()),
        Op::Ccall {
            ref args, ref rets, ..
        }
        | Op::Gcall {
            ref args, ref rets, ..
        } => {
            for r in args.iter().chain(rets.iter()) {
                f(r);
            }
        }
        Op::Icall {
            vt,
            vp,
            ref args,
            ref rets,
            ..
        } => {
            f(vt.into());
            f(vp.into());
            for r in args.iter().chain(rets.iter()) {
                f(r);
            }
        }
    }
}
