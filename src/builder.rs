//! Assembler-style builder for abstract-machine programs.
//!
//! Translators drive the builder imperatively: one emit method per opcode,
//! plus symbolic labels for control flow. Labels may be referenced before
//! they are bound — unresolved branches are back-patched when the label is
//! bound, and [`Builder::build`] refuses to finish while any reference is
//! still pending.
//!
//! Loop-generating translators reuse label templates across iterations: the
//! substring `{n}` in a label or branch-target name is replaced with the
//! current generation counter, which [`Builder::mark`] advances. Emitting
//! against `"_jump_pc_{n}"` therefore binds to the anchor of the current
//! generation only.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::abi::CallHandle;
use crate::ir::{
    ArgVec, GenericRegister, InstrArena, InstrId, Op, PointerRegister, Program, Register,
    SwitchTargets,
};

const LB_JUMP_PC: &str = "_jump_pc_";

/// A branch slot waiting for a label to be bound: either the single target
/// of a branch instruction or one entry of a `bsw` table.
#[derive(Debug, Clone, Copy)]
enum PatchSite {
    Branch(InstrId),
    BswEntry(InstrId, usize),
}

/// Builds one [`Program`]. Create empty, emit, then consume with
/// [`Builder::build`].
#[derive(Default)]
pub struct Builder {
    /// Generation counter, substituted for `{n}` in label names.
    generation: u32,
    arena: InstrArena,
    head: Option<InstrId>,
    tail: Option<InstrId>,
    /// Bound labels: name → (binding generation, nop anchor). Re-binding a
    /// name is allowed once per generation; branches resolve against the
    /// latest binding.
    refs: HashMap<String, (u32, InstrId)>,
    /// Unbound labels: name → branch slots to patch on binding.
    pends: HashMap<String, SmallVec<[PatchSite; 4]>>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    fn expand(&self, name: &str) -> String {
        name.replace("{n}", &self.generation.to_string())
    }

    fn push(&mut self, op: Op) -> InstrId {
        let id = self.arena.push(op);
        match self.tail {
            None => self.head = Some(id),
            Some(t) => self.arena[t].next = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Emit a single-target branch. `make` receives the resolved target if
    /// the label is already bound.
    fn jmp(&mut self, to: &str, make: impl FnOnce(Option<InstrId>) -> Op) -> InstrId {
        let lb = self.expand(to);
        let target = self.refs.get(&lb).map(|&(_, anchor)| anchor);
        let id = self.push(make(target));
        if target.is_none() {
            self.pends.entry(lb).or_default().push(PatchSite::Branch(id));
        }
        id
    }

    /// Emit a branch table. Empty case names fall through.
    fn tab(&mut self, rx: GenericRegister, cases: &[&str]) -> InstrId {
        let mut targets = SwitchTargets::new();
        let mut pending: SmallVec<[(String, usize); 8]> = SmallVec::new();

        for (i, to) in cases.iter().enumerate() {
            if to.is_empty() {
                targets.push(None);
                continue;
            }
            let lb = self.expand(to);
            match self.refs.get(&lb) {
                Some(&(_, anchor)) => targets.push(Some(anchor)),
                None => {
                    targets.push(None);
                    pending.push((lb, i));
                }
            }
        }

        let id = self.push(Op::Bsw { rx, targets });
        for (lb, i) in pending {
            self.pends.entry(lb).or_default().push(PatchSite::BswEntry(id, i));
        }
        id
    }

    fn patch(&mut self, site: PatchSite, anchor: InstrId) {
        match site {
            PatchSite::Branch(id) => {
                self.arena[id].op.set_branch_targets(&[Some(anchor)]);
            }
            PatchSite::BswEntry(id, i) => match &mut self.arena[id].op {
                Op::Bsw { targets, .. } => targets[i] = Some(anchor),
                other => panic!("switch patch site points at {other:?}"),
            },
        }
    }

    // ── Labels ──────────────────────────────────────────────────────────

    /// The conventional label name for an integer pc.
    pub fn at(&self, pc: usize) -> String {
        format!("{LB_JUMP_PC}{pc}")
    }

    /// Advance the generation counter and bind the conventional label for
    /// `pc` at the current position.
    pub fn mark(&mut self, pc: usize) {
        self.generation += 1;
        let name = self.at(pc);
        self.label(&name);
    }

    /// Bind `name` at the current position by inserting a nop anchor and
    /// patching every pending reference. Binding the same name twice within
    /// one generation is a construction-time failure; a later generation
    /// (see [`Builder::mark`]) may rebind it, and branches emitted after
    /// the rebinding resolve to the new anchor.
    pub fn label(&mut self, name: &str) {
        let lb = self.expand(name);
        if let Some(&(generation, _)) = self.refs.get(&lb) {
            if generation == self.generation {
                panic!("label {lb} has already been linked");
            }
        }

        let anchor = self.nop();
        if let Some(sites) = self.pends.remove(&lb) {
            for site in sites {
                self.patch(site, anchor);
            }
        }
        self.refs.insert(lb, (self.generation, anchor));
    }

    // ── Emitters ────────────────────────────────────────────────────────

    pub fn nop(&mut self) -> InstrId {
        self.push(Op::Nop)
    }

    /// Load a byte-sized immediate. Canonical form: `addi rz, v, rx`.
    pub fn ib(&mut self, v: i8, rx: GenericRegister) -> InstrId {
        self.addi(GenericRegister::Rz, v as i64, rx)
    }

    /// Load a word-sized immediate.
    pub fn iw(&mut self, v: i16, rx: GenericRegister) -> InstrId {
        self.addi(GenericRegister::Rz, v as i64, rx)
    }

    /// Load a long-sized immediate.
    pub fn il(&mut self, v: i32, rx: GenericRegister) -> InstrId {
        self.addi(GenericRegister::Rz, v as i64, rx)
    }

    /// Load a quad-sized immediate.
    pub fn iq(&mut self, v: i64, rx: GenericRegister) -> InstrId {
        self.addi(GenericRegister::Rz, v, rx)
    }

    /// Load a pointer immediate.
    pub fn ip<T>(&mut self, v: *const T, pd: PointerRegister) -> InstrId {
        self.push(Op::Ip { pr: v as usize, pd })
    }

    pub fn lb(&mut self, ps: PointerRegister, rx: GenericRegister) -> InstrId {
        self.push(Op::Lb { ps, rx })
    }

    pub fn lw(&mut self, ps: PointerRegister, rx: GenericRegister) -> InstrId {
        self.push(Op::Lw { ps, rx })
    }

    pub fn ll(&mut self, ps: PointerRegister, rx: GenericRegister) -> InstrId {
        self.push(Op::Ll { ps, rx })
    }

    pub fn lq(&mut self, ps: PointerRegister, rx: GenericRegister) -> InstrId {
        self.push(Op::Lq { ps, rx })
    }

    pub fn lp(&mut self, ps: PointerRegister, pd: PointerRegister) -> InstrId {
        self.push(Op::Lp { ps, pd })
    }

    pub fn sb(&mut self, rx: GenericRegister, pd: PointerRegister) -> InstrId {
        self.push(Op::Sb { rx, pd })
    }

    pub fn sw(&mut self, rx: GenericRegister, pd: PointerRegister) -> InstrId {
        self.push(Op::Sw { rx, pd })
    }

    pub fn sl(&mut self, rx: GenericRegister, pd: PointerRegister) -> InstrId {
        self.push(Op::Sl { rx, pd })
    }

    pub fn sq(&mut self, rx: GenericRegister, pd: PointerRegister) -> InstrId {
        self.push(Op::Sq { rx, pd })
    }

    pub fn sp(&mut self, ps: PointerRegister, pd: PointerRegister) -> InstrId {
        self.push(Op::Sp { ps, pd })
    }

    /// Register move. Canonical form: `addi rx, 0, ry`.
    pub fn mov(&mut self, rx: GenericRegister, ry: GenericRegister) -> InstrId {
        self.addi(rx, 0, ry)
    }

    /// Pointer move. Canonical form: `addpi ps, 0, pd`.
    pub fn movp(&mut self, ps: PointerRegister, pd: PointerRegister) -> InstrId {
        self.addpi(ps, 0, pd)
    }

    pub fn ldaq(&mut self, id: usize, rx: GenericRegister) -> InstrId {
        self.push(Op::Ldaq { id, rx })
    }

    pub fn ldap(&mut self, id: usize, pd: PointerRegister) -> InstrId {
        self.push(Op::Ldap { id, pd })
    }

    pub fn strq(&mut self, rx: GenericRegister, id: usize) -> InstrId {
        self.push(Op::Strq { rx, id })
    }

    pub fn strp(&mut self, ps: PointerRegister, id: usize) -> InstrId {
        self.push(Op::Strp { ps, id })
    }

    pub fn addp(
        &mut self,
        ps: PointerRegister,
        rx: GenericRegister,
        pd: PointerRegister,
    ) -> InstrId {
        self.push(Op::Addp { ps, rx, pd })
    }

    pub fn subp(
        &mut self,
        ps: PointerRegister,
        rx: GenericRegister,
        pd: PointerRegister,
    ) -> InstrId {
        self.push(Op::Subp { ps, rx, pd })
    }

    pub fn addpi(&mut self, ps: PointerRegister, iv: i64, pd: PointerRegister) -> InstrId {
        self.push(Op::Addpi { ps, iv, pd })
    }

    /// Canonical form: `addpi ps, -iv, pd`.
    pub fn subpi(&mut self, ps: PointerRegister, iv: i64, pd: PointerRegister) -> InstrId {
        self.addpi(ps, iv.wrapping_neg(), pd)
    }

    pub fn add(
        &mut self,
        rx: GenericRegister,
        ry: GenericRegister,
        rz: GenericRegister,
    ) -> InstrId {
        self.push(Op::Add { rx, ry, rz })
    }

    pub fn sub(
        &mut self,
        rx: GenericRegister,
        ry: GenericRegister,
        rz: GenericRegister,
    ) -> InstrId {
        self.push(Op::Sub { rx, ry, rz })
    }

    pub fn addi(&mut self, rx: GenericRegister, iv: i64, ry: GenericRegister) -> InstrId {
        self.push(Op::Addi { rx, iv, ry })
    }

    /// Canonical form: `addi rx, -iv, ry`.
    pub fn subi(&mut self, rx: GenericRegister, iv: i64, ry: GenericRegister) -> InstrId {
        self.addi(rx, iv.wrapping_neg(), ry)
    }

    pub fn muli(&mut self, rx: GenericRegister, iv: i64, ry: GenericRegister) -> InstrId {
        self.push(Op::Muli { rx, iv, ry })
    }

    pub fn andi(&mut self, rx: GenericRegister, iv: i64, ry: GenericRegister) -> InstrId {
        self.push(Op::Andi { rx, iv, ry })
    }

    pub fn xori(&mut self, rx: GenericRegister, iv: i64, ry: GenericRegister) -> InstrId {
        self.push(Op::Xori { rx, iv, ry })
    }

    pub fn sbiti(&mut self, rx: GenericRegister, iv: i64, ry: GenericRegister) -> InstrId {
        self.push(Op::Sbiti { rx, iv, ry })
    }

    pub fn swapw(&mut self, rx: GenericRegister, ry: GenericRegister) -> InstrId {
        self.push(Op::Swapw { rx, ry })
    }

    pub fn swapl(&mut self, rx: GenericRegister, ry: GenericRegister) -> InstrId {
        self.push(Op::Swapl { rx, ry })
    }

    pub fn swapq(&mut self, rx: GenericRegister, ry: GenericRegister) -> InstrId {
        self.push(Op::Swapq { rx, ry })
    }

    pub fn beq(&mut self, rx: GenericRegister, ry: GenericRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Beq { rx, ry, to })
    }

    pub fn bne(&mut self, rx: GenericRegister, ry: GenericRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Bne { rx, ry, to })
    }

    pub fn blt(&mut self, rx: GenericRegister, ry: GenericRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Blt { rx, ry, to })
    }

    pub fn bltu(&mut self, rx: GenericRegister, ry: GenericRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Bltu { rx, ry, to })
    }

    pub fn bgeu(&mut self, rx: GenericRegister, ry: GenericRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Bgeu { rx, ry, to })
    }

    /// Branch table on `rx`. Empty names fall through, like a missing
    /// switch case.
    pub fn bsw(&mut self, rx: GenericRegister, cases: &[&str]) -> InstrId {
        self.tab(rx, cases)
    }

    pub fn beqn(&mut self, ps: PointerRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Beqn { ps, to })
    }

    pub fn bnen(&mut self, ps: PointerRegister, to: &str) -> InstrId {
        self.jmp(to, |to| Op::Bnen { ps, to })
    }

    pub fn jal(&mut self, to: &str, pd: PointerRegister) -> InstrId {
        self.jmp(to, |to| Op::Jal { pd, to })
    }

    pub fn bzero(&mut self, nb: i64, pd: PointerRegister) -> InstrId {
        self.push(Op::Bzero { nb, pd })
    }

    pub fn bcopy(
        &mut self,
        ps: PointerRegister,
        rx: GenericRegister,
        pd: PointerRegister,
    ) -> InstrId {
        self.push(Op::Bcopy { ps, rx, pd })
    }

    pub fn ccall(&mut self, func: CallHandle, args: &[Register], rets: &[Register]) -> InstrId {
        self.push(Op::Ccall {
            func,
            args: ArgVec::from_regs(args),
            rets: ArgVec::from_regs(rets),
        })
    }

    pub fn gcall(&mut self, func: CallHandle, args: &[Register], rets: &[Register]) -> InstrId {
        self.push(Op::Gcall {
            func,
            args: ArgVec::from_regs(args),
            rets: ArgVec::from_regs(rets),
        })
    }

    pub fn icall(
        &mut self,
        vt: PointerRegister,
        vp: PointerRegister,
        method: CallHandle,
        args: &[Register],
        rets: &[Register],
    ) -> InstrId {
        self.push(Op::Icall {
            vt,
            vp,
            method,
            args: ArgVec::from_regs(args),
            rets: ArgVec::from_regs(rets),
        })
    }

    pub fn halt(&mut self) -> InstrId {
        self.push(Op::Halt)
    }

    pub fn brk(&mut self) -> InstrId {
        self.push(Op::Break)
    }

    // ── Finalization ────────────────────────────────────────────────────

    /// Follow a branch target through nop chains to the first real
    /// instruction. Stops at a terminal nop, which has nowhere to forward.
    fn thread(&self, mut target: Option<InstrId>) -> Option<InstrId> {
        while let Some(id) = target {
            let ins = &self.arena[id];
            if ins.op == Op::Nop && ins.next.is_some() {
                target = ins.next;
            } else {
                break;
            }
        }
        target
    }

    /// Finalize into a [`Program`]: verify all labels are bound, retarget
    /// branches past nop anchors, then strip every non-terminal nop.
    pub fn build(mut self) -> Program {
        if let Some(name) = self.pends.keys().next() {
            panic!("labels are not fully resolved: {name}");
        }

        // Branch threading. After this pass no branch targets a nop that
        // the sweep below will remove.
        let chain: Vec<InstrId> = {
            let mut ids = Vec::with_capacity(self.arena.len());
            let mut p = self.head;
            while let Some(id) = p {
                ids.push(id);
                p = self.arena[id].next;
            }
            ids
        };
        for &id in &chain {
            let slots = self.arena[id].op.branch_targets();
            if slots.is_empty() {
                continue;
            }
            let threaded: SwitchTargets = slots.iter().map(|&t| self.thread(t)).collect();
            self.arena[id].op.set_branch_targets(&threaded);
        }

        // Strip nops at the front.
        while let Some(id) = self.head {
            if self.arena[id].op == Op::Nop {
                self.head = self.arena[id].next;
            } else {
                break;
            }
        }

        // Unlink interior nops. A trailing nop stays: a branch may still
        // target it.
        let mut p = self.head;
        while let Some(id) = p {
            while let Some(n) = self.arena[id].next {
                let nx = &self.arena[n];
                if nx.op == Op::Nop && nx.next.is_some() {
                    self.arena[id].next = nx.next;
                } else {
                    break;
                }
            }
            p = self.arena[id].next;
        }

        Program {
            arena: self.arena,
            head: self.head,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GenericRegister::*;
    use crate::ir::PointerRegister::*;

    #[test]
    fn forward_jump_threads_to_first_real_instruction() {
        let mut b = Builder::new();
        b.jal("L1", Pn);
        b.nop();
        b.nop();
        b.label("L1");
        b.nop();
        b.halt();
        let p = b.build();

        assert_eq!(p.len(), 2);
        let head = p.head().expect("program should not be empty");
        let (first, second) = {
            let ins = p.instr(head);
            (ins, p.instr(ins.next.expect("halt should follow")))
        };
        match first.op {
            Op::Jal { to, .. } => assert_eq!(to, first.next),
            ref other => panic!("expected jal at head, got {other:?}"),
        }
        assert_eq!(second.op, Op::Halt);
    }

    #[test]
    fn backward_branch_targets_first_instruction_after_anchor() {
        let mut b = Builder::new();
        b.label("top");
        let body = b.addi(Rz, 1, R0);
        b.bne(R0, Rz, "top");
        b.halt();
        let p = b.build();

        let mut iter = p.iter();
        let (addi_id, _) = iter.next().expect("addi");
        assert_eq!(addi_id, body);
        let (_, bne) = iter.next().expect("bne");
        match bne.op {
            Op::Bne { to, .. } => assert_eq!(to, Some(body)),
            ref other => panic!("expected bne, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "labels are not fully resolved: missing")]
    fn unresolved_label_fails_build() {
        let mut b = Builder::new();
        b.jal("missing", Pn);
        b.build();
    }

    #[test]
    #[should_panic(expected = "label x has already been linked")]
    fn duplicate_label_fails() {
        let mut b = Builder::new();
        b.label("x");
        b.label("x");
    }

    #[test]
    fn branch_table_keeps_fallthrough_holes() {
        let mut b = Builder::new();
        b.bsw(R0, &["", "L1", "", "L2"]);
        b.halt();
        b.label("L1");
        let h1 = b.halt();
        b.label("L2");
        let h2 = b.halt();
        let p = b.build();

        let (_, bsw) = p.iter().next().expect("bsw at head");
        match &bsw.op {
            Op::Bsw { targets, .. } => {
                assert_eq!(targets.len(), 4);
                assert_eq!(targets[0], None);
                assert_eq!(targets[1], Some(h1));
                assert_eq!(targets[2], None);
                assert_eq!(targets[3], Some(h2));
            }
            other => panic!("expected bsw, got {other:?}"),
        }
    }

    #[test]
    fn generation_counter_separates_mark_instances() {
        let mut b = Builder::new();

        b.mark(1);
        let first_target = b.addi(Rz, 1, R0);
        b.jal("_jump_pc_1", Pn);

        b.mark(2);
        b.addi(Rz, 2, R0);

        b.mark(1);
        let second_target = b.addi(Rz, 3, R0);
        b.jal("_jump_pc_1", Pn);
        b.halt();

        let p = b.build();
        let jals: Vec<Option<InstrId>> = p
            .iter()
            .filter_map(|(_, ins)| match ins.op {
                Op::Jal { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(jals, vec![Some(first_target), Some(second_target)]);
    }

    #[test]
    fn generation_template_reuses_scratch_labels_per_iteration() {
        // The shape a loop-generating translator produces: one scratch
        // label template, re-instantiated per generation.
        let mut b = Builder::new();
        let mut exits = Vec::new();
        for pc in 0..3 {
            b.mark(pc);
            b.beq(R0, Rz, "_skip_{n}");
            b.addi(R0, 1, R0);
            b.label("_skip_{n}");
            exits.push(b.addi(Rz, 0, R1));
        }
        b.halt();
        let p = b.build();

        let beqs: Vec<Option<InstrId>> = p
            .iter()
            .filter_map(|(_, ins)| match ins.op {
                Op::Beq { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(beqs.len(), 3);
        for (to, exit) in beqs.iter().zip(&exits) {
            assert_eq!(*to, Some(*exit));
        }
    }

    #[test]
    fn all_nop_program_builds_empty() {
        let mut b = Builder::new();
        b.nop();
        b.nop();
        let p = b.build();
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn trailing_nop_survives_for_branch_targets() {
        let mut b = Builder::new();
        b.addi(Rz, 1, R0);
        b.jal("end", Pn);
        b.label("end");
        let p = b.build();

        let last = p.iter().last().expect("non-empty").1;
        assert_eq!(last.op, Op::Nop);
        assert_eq!(last.next, None);
        let jal_to = p
            .iter()
            .find_map(|(_, ins)| match ins.op {
                Op::Jal { to, .. } => Some(to),
                _ => None,
            })
            .expect("jal");
        // The anchor is terminal, so threading must stop at it.
        assert!(jal_to.is_some());
        assert_eq!(p.instr(jal_to.unwrap()).op, Op::Nop);
    }

    #[test]
    fn built_programs_have_no_interior_nops_and_no_nop_targets() {
        let mut b = Builder::new();
        b.label("a");
        b.addi(Rz, 1, R0);
        b.beq(R0, Rz, "c");
        b.label("b");
        b.addi(R0, 2, R1);
        b.bne(R1, Rz, "a");
        b.label("c");
        b.bsw(R1, &["a", "", "b"]);
        b.halt();
        let p = b.build();

        let ids: Vec<InstrId> = p.iter().map(|(id, _)| id).collect();
        for (id, ins) in p.iter() {
            if ins.next.is_some() {
                assert_ne!(ins.op, Op::Nop, "interior nop at {id:?}");
            }
            for t in ins.op.branch_targets().iter().flatten() {
                assert!(ids.contains(t), "branch target {t:?} left the chain");
                assert_ne!(p.instr(*t).op, Op::Nop, "branch targets a nop");
            }
        }
    }

    #[test]
    fn mov_lowers_to_canonical_addi() {
        let mut b = Builder::new();
        b.mov(R0, R1);
        b.iq(9, R2);
        b.subi(R2, 4, R3);
        b.halt();
        let p = b.build();

        let ops: Vec<&Op> = p.iter().map(|(_, ins)| &ins.op).collect();
        assert_eq!(ops[0], &Op::Addi { rx: R0, iv: 0, ry: R1 });
        assert_eq!(ops[1], &Op::Addi { rx: Rz, iv: 9, ry: R2 });
        assert_eq!(ops[2], &Op::Addi { rx: R2, iv: -4, ry: R3 });
    }

    #[test]
    fn movp_and_subpi_lower_to_canonical_addpi() {
        let mut b = Builder::new();
        b.movp(P0, P1);
        b.subpi(P1, 16, P2);
        b.halt();
        let p = b.build();

        let ops: Vec<&Op> = p.iter().map(|(_, ins)| &ins.op).collect();
        assert_eq!(ops[0], &Op::Addpi { ps: P0, iv: 0, pd: P1 });
        assert_eq!(ops[1], &Op::Addpi { ps: P1, iv: -16, pd: P2 });
    }
}
