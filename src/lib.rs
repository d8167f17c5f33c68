//! hopper — abstract-machine IR builder and amd64 code generator.
//!
//! The JIT core of a serialization framework: schema translators emit
//! abstract-machine instructions through [`builder::Builder`], and
//! [`backend::CodeGen`] lowers the finished [`ir::Program`] to native
//! amd64 honoring the host runtime's calling convention, stack guard, and
//! reserved-register contract.
//!
//! ```
//! use hopper::abi::{FnLayout, Registry};
//! use hopper::builder::Builder;
//! use hopper::ir::GenericRegister::*;
//!
//! let mut b = Builder::new();
//! b.label("top");
//! b.addi(R0, -1, R0);
//! b.bne(R0, Rz, "top");
//! b.halt();
//! let program = b.build();
//!
//! let registry = Registry::new();
//! let unit = hopper::compile(&program, &registry, FnLayout::default());
//! assert!(!unit.buf.is_empty());
//! ```
//!
//! The assembler is a seam ([`arch::x64::Asm`]): production code emits
//! through dynasmrt, tests record operations with
//! [`arch::trace::TraceAsm`]. Set `HOPPER_DISASM=1` to dump finalized
//! code.

pub mod abi;
pub mod arch;
pub mod backend;
mod backend_abi;
pub mod builder;
pub mod disasm;
pub mod host;
pub mod ir;

use abi::{FnLayout, Registry};
use arch::x64::X64Assembler;
use backend::CodeGen;
use ir::Program;

/// A finalized native-code unit.
pub struct CompiledUnit {
    pub buf: dynasmrt::ExecutableBuffer,
    pub entry: dynasmrt::AssemblyOffset,
}

impl CompiledUnit {
    /// Entry point of the compiled function.
    pub fn entry_ptr(&self) -> *const u8 {
        self.buf.ptr(self.entry)
    }
}

/// Compile `program` to executable memory with the given function layout.
pub fn compile(program: &Program, registry: &Registry, layout: FnLayout) -> CompiledUnit {
    compile_with(CodeGen::new(registry, layout), program)
}

/// Compile with a configured [`CodeGen`] (stack guard, block copy).
pub fn compile_with(mut cg: CodeGen<'_>, program: &Program) -> CompiledUnit {
    let mut asm = X64Assembler::new();
    let entry = asm.offset();
    cg.compile(&mut asm, program);
    let buf = asm.finalize();
    disasm::maybe_dump("program", &buf);
    CompiledUnit { buf, entry }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{CallTarget, Parameter};
    use crate::arch::trace::{TraceAsm, TraceOp};
    use crate::arch::x64::{Cond, Gpr, Mem, Operand, ptr};
    use crate::host::{MEMMOVE_ARGS, STACK_GUARD_OFFSET, TCB_LOAD};
    use crate::ir::GenericRegister::*;
    use crate::ir::PointerRegister::*;
    use crate::ir::Register;

    fn reg(r: Gpr) -> Operand {
        Operand::Reg(r)
    }

    fn mem(base: Gpr, disp: i32) -> Operand {
        Operand::Mem(ptr(base, disp))
    }

    fn rsp(disp: i32) -> Mem {
        ptr(Gpr::Rsp, disp)
    }

    // ── Runtime-managed call discipline ─────────────────────────────────

    #[test]
    fn gcall_register_return_aliasing_live_virtual_spills_and_reloads() {
        let mut registry = Registry::new();
        // Callee returns in rbx — the home of the first live virtual.
        let callee = registry.register_function(
            0x1000,
            FnLayout::new(vec![], vec![Parameter::in_reg(Gpr::Rbx, false)]),
        );

        let mut b = builder::Builder::new();
        b.ldap(0, P0); // p0 → rbx
        b.gcall(callee, &[], &[R0.into()]); // r0 → r13
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::on_stack(&[true], &[]));
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        let call = asm.call_position().expect("gcall emits a call");
        // stack_args = 0: p0 spills at rsp+0, r0 at rsp+8.
        let spill_p0 = asm
            .find(|op| *op == TraceOp::Movq(reg(Gpr::Rbx), mem(Gpr::Rsp, 0)))
            .first()
            .map(|&(i, _)| i)
            .expect("p0 spilled");
        assert!(spill_p0 < call, "spill must precede the call");

        let reload_p0 = asm
            .find(|op| *op == TraceOp::Movq(mem(Gpr::Rsp, 0), reg(Gpr::Rbx)))
            .last()
            .map(|&(i, _)| i)
            .expect("p0 reloaded");
        assert!(reload_p0 > call, "reload must follow the call");

        // The return value parks in r0's spill slot, then reloads into r13.
        let park = asm
            .find(|op| *op == TraceOp::Movq(reg(Gpr::Rbx), mem(Gpr::Rsp, 8)))
            .iter()
            .map(|&(i, _)| i)
            .find(|&i| i > call)
            .expect("return value parked in r0's slot");
        let recover = asm
            .find(|op| *op == TraceOp::Movq(mem(Gpr::Rsp, 8), reg(Gpr::R13)))
            .last()
            .map(|&(i, _)| i)
            .expect("return value recovered");
        assert!(park < recover);
    }

    #[test]
    fn gcall_restores_reserved_registers_around_the_call_body() {
        let mut registry = Registry::new();
        let callee = registry.register_function(0x1000, FnLayout::default());

        let mut b = builder::Builder::new();
        b.gcall(callee, &[], &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default());
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        let call = asm.call_position().expect("call emitted");
        // Reserved loads immediately precede the call body, re-saves follow.
        let rslot_rbx = cg.rslot(Gpr::Rbx);
        let load = asm
            .find(|op| *op == TraceOp::Movq(Operand::Mem(rslot_rbx), reg(Gpr::Rbx)))
            .iter()
            .map(|&(i, _)| i)
            .find(|&i| i < call)
            .expect("reserved rbx restored before call");
        let resave = asm
            .find(|op| *op == TraceOp::Movq(reg(Gpr::Rbx), Operand::Mem(rslot_rbx)))
            .iter()
            .map(|&(i, _)| i)
            .find(|&i| i > call)
            .expect("reserved rbx saved after call");
        assert!(load < call && call < resave);
    }

    #[test]
    fn gcall_marshals_zero_register_as_literal_zero() {
        let mut registry = Registry::new();
        let callee = registry.register_function(
            0x1000,
            FnLayout::new(
                vec![
                    Parameter::on_stack(0, false),
                    Parameter::in_reg(Gpr::Rcx, false),
                ],
                vec![],
            ),
        );

        let mut b = builder::Builder::new();
        b.gcall(callee, &[Rz.into(), Rz.into()], &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default());
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        assert!(
            asm.ops
                .contains(&TraceOp::Movq(Operand::Imm(0), mem(Gpr::Rsp, 0))),
            "stack zero argument is an immediate store"
        );
        assert!(
            asm.ops.contains(&TraceOp::Xorl(Gpr::Rcx, Gpr::Rcx)),
            "register zero argument is an xor"
        );
    }

    #[test]
    #[should_panic(expected = "argument or return value count mismatch")]
    fn gcall_signature_mismatch_panics() {
        let mut registry = Registry::new();
        let callee = registry.register_function(
            0x1000,
            FnLayout::new(vec![Parameter::on_stack(0, false)], vec![]),
        );

        let mut b = builder::Builder::new();
        b.gcall(callee, &[], &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default());
        cg.compile(&mut TraceAsm::new(), &program);
    }

    #[test]
    #[should_panic(expected = "different kind of registers")]
    fn gcall_kind_mismatch_panics() {
        let mut registry = Registry::new();
        let callee = registry.register_function(
            0x1000,
            FnLayout::new(vec![Parameter::on_stack(0, true)], vec![]),
        );

        let mut b = builder::Builder::new();
        // Generic register against a pointer parameter.
        b.addi(Rz, 1, R0);
        b.gcall(callee, &[R0.into()], &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default());
        cg.compile(&mut TraceAsm::new(), &program);
    }

    // ── Native call discipline ──────────────────────────────────────────

    #[test]
    fn ccall_clobbered_argument_sources_read_their_spill_slots() {
        let mut registry = Registry::new();
        let callee = registry.register_function(0x2000, FnLayout::default());

        let mut b = builder::Builder::new();
        // Pin six generics to the non-argument homes, then two pointers
        // into rsi/rdi.
        b.addi(Rz, 1, R0);
        b.addi(Rz, 1, R1);
        b.addi(Rz, 1, R2);
        b.addi(Rz, 1, R3);
        b.addi(Rz, 1, R4);
        b.addi(Rz, 1, R5);
        b.ldap(0, P0); // → rsi
        b.ldap(1, P1); // → rdi
        b.ccall(callee, &[R0.into(), P1.into()], &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::on_stack(&[true, true], &[]));
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        assert_eq!(cg.r(Register::Pointer(P1)), Gpr::Rdi);
        let p1_slot = cg.slot(P1.into());

        // Argument 0 (r0 → rdi) clobbers p1's home, so argument 1 must come
        // from p1's spill slot, never from rdi.
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(Operand::Mem(p1_slot), reg(Gpr::Rsi))),
            "clobbered source reads its spill slot"
        );
        assert!(
            !asm.ops
                .contains(&TraceOp::Movq(reg(Gpr::Rdi), reg(Gpr::Rsi))),
            "clobbered source must not be read from its live register"
        );
    }

    #[test]
    fn ccall_result_moves_from_rax_and_skips_reload() {
        let mut registry = Registry::new();
        let callee = registry.register_function(0x2000, FnLayout::default());

        let mut b = builder::Builder::new();
        b.addi(Rz, 7, R0); // → rbx (reserved: survives the call in place)
        b.ldap(0, P0); // → r13
        b.addi(Rz, 1, R2); // → r14
        b.addi(Rz, 1, R3); // → r15
        b.ccall(callee, &[R0.into()], &[R1.into()]); // r1 → r10, caller-saved
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::on_stack(&[true], &[]));
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        assert_eq!(cg.r(Register::Generic(R1)), Gpr::R10);
        let call = asm.call_position().expect("call emitted");
        let result = asm
            .find(|op| *op == TraceOp::Movq(reg(Gpr::Rax), reg(Gpr::R10)))
            .iter()
            .map(|&(i, _)| i)
            .find(|&i| i > call)
            .expect("result moved from rax");

        // r1 received the result; the post-call reload must skip it even
        // though its home is caller-saved and was spilled.
        let r1_slot = cg.slot(R1.into());
        assert!(
            !asm.ops[result..]
                .contains(&TraceOp::Movq(Operand::Mem(r1_slot), reg(Gpr::R10))),
            "result register must not be reloaded from its stale slot"
        );
    }

    #[test]
    #[should_panic(expected = "at most 1 return value")]
    fn ccall_with_two_returns_panics() {
        let mut registry = Registry::new();
        let callee = registry.register_function(0x2000, FnLayout::default());

        let mut b = builder::Builder::new();
        b.ccall(callee, &[], &[R0.into(), R1.into()]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default());
        cg.compile(&mut TraceAsm::new(), &program);
    }

    #[test]
    #[should_panic(expected = "passing arguments on stack for native functions")]
    fn ccall_with_seven_arguments_panics() {
        let mut registry = Registry::new();
        let callee = registry.register_function(0x2000, FnLayout::default());

        let mut b = builder::Builder::new();
        let args: Vec<Register> = vec![
            R0.into(),
            R1.into(),
            R2.into(),
            R3.into(),
            R4.into(),
            R5.into(),
            P0.into(),
        ];
        b.ccall(callee, &args, &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default());
        cg.compile(&mut TraceAsm::new(), &program);
    }

    // ── Return-slot stores ──────────────────────────────────────────────

    #[test]
    fn store_ret_swaps_occupied_return_register_with_one_xchg() {
        let registry = Registry::new();
        let layout = FnLayout::new(
            vec![
                Parameter::on_stack(0, true),
                Parameter::on_stack(8, true),
            ],
            vec![Parameter::in_reg(Gpr::Rbx, true)],
        );

        let mut b = builder::Builder::new();
        b.ldap(0, P0); // → rbx
        b.ldap(1, P1); // → r13
        b.strp(P1, 0); // rbx is held by p0: swap
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, layout);
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        let swaps = asm.find(|op| matches!(op, TraceOp::Xchgq(..)));
        assert_eq!(swaps.len(), 1, "exactly one xchg");
        assert_eq!(*swaps[0].1, TraceOp::Xchgq(Gpr::R13, Gpr::Rbx));

        // The allocation map reflects the swap.
        assert_eq!(cg.r(Register::Pointer(P1)), Gpr::Rbx);
        assert_eq!(cg.r(Register::Pointer(P0)), Gpr::R13);
    }

    #[test]
    fn store_ret_to_stack_slot_is_a_direct_move() {
        let registry = Registry::new();
        let layout = FnLayout::on_stack(&[false], &[false]);

        let mut b = builder::Builder::new();
        b.ldaq(0, R0);
        b.strq(R0, 0);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, layout);
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        // ret slot 0 sits at frame + 8 + 8 (after the one argument).
        let ret_slot = (cg.frame + 16) as i32;
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(reg(Gpr::Rbx), mem(Gpr::Rsp, ret_slot))),
            "stack return is one store"
        );
        assert!(asm.find(|op| matches!(op, TraceOp::Xchgq(..))).is_empty());
    }

    #[test]
    fn store_ret_already_in_place_emits_nothing() {
        let registry = Registry::new();
        let layout = FnLayout::new(
            vec![Parameter::on_stack(0, false)],
            vec![Parameter::in_reg(Gpr::Rbx, false)],
        );

        let mut b = builder::Builder::new();
        b.ldaq(0, R0); // → rbx, which is also the declared return home
        b.strq(R0, 0);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, layout);
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        assert!(asm.find(|op| matches!(op, TraceOp::Xchgq(..))).is_empty());
        // Only the ldaq populates rbx from the argument slot; the store is
        // free. (The epilogue's reserved reload reads the save slot, not a
        // return value.)
        let arg_slot = cg.argv(0);
        let loads = asm.find(|op| matches!(op, TraceOp::Movq(Operand::Reg(_), Operand::Reg(Gpr::Rbx))));
        assert!(loads.is_empty(), "no register move materializes the return");
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(Operand::Mem(arg_slot), reg(Gpr::Rbx)))
        );
    }

    // ── Method calls ────────────────────────────────────────────────────

    #[test]
    fn icall_dispatches_through_the_method_table() {
        let mut registry = Registry::new();
        let method = registry.register_method(
            2,
            FnLayout::new(
                vec![
                    Parameter::on_stack(0, true), // receiver
                    Parameter::on_stack(8, false),
                ],
                vec![],
            ),
        );

        let mut b = builder::Builder::new();
        b.ldap(0, P0); // vtable → rbx
        b.ldap(1, P1); // receiver → r13
        b.ldaq(2, R0); // arg → r14
        b.icall(P0, P1, method, &[R0.into()], &[]);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::on_stack(&[true, true, false], &[]));
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        let vt_slot = cg.slot(P0.into());
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(Operand::Mem(vt_slot), reg(Gpr::R12))),
            "method table loads from the vtable register's spill slot"
        );
        // fun[2] at 24 + 2*8.
        assert!(
            asm.ops
                .contains(&TraceOp::Callq(mem(Gpr::R12, 24 + 16))),
            "call goes through the method table entry"
        );

        // The receiver lands in the callee's first parameter slot from p1's
        // spill slot or home; it was spilled, so the marshaled store exists.
        let recv_store = asm.find(|op| matches!(op, TraceOp::Movq(_, Operand::Mem(m)) if *m == rsp(0)));
        assert!(!recv_store.is_empty(), "receiver marshaled to stack slot 0");
    }

    // ── Stack growth and block copy ─────────────────────────────────────

    #[test]
    fn stack_check_emits_guard_compare_and_grow_stub() {
        let mut registry = Registry::new();
        let morestack = registry.register_function(0x3000, FnLayout::default());

        let mut b = builder::Builder::new();
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::default()).with_stack_guard(morestack);
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        assert_eq!(asm.ops[1], TraceOp::Raw(TCB_LOAD.to_vec()));
        assert_eq!(
            asm.ops[2],
            TraceOp::Leaq(rsp(-(cg.frame as i32)), Gpr::Rax)
        );
        assert_eq!(
            asm.ops[3],
            TraceOp::Cmpq(
                Operand::Mem(ptr(Gpr::Rcx, STACK_GUARD_OFFSET)),
                reg(Gpr::Rax)
            )
        );
        assert!(matches!(asm.ops[4], TraceOp::Jcc(Cond::Be, _)));

        // The grow stub calls the morestack routine and retries from entry.
        let tail: Vec<&TraceOp> = asm.ops.iter().rev().take(3).collect();
        assert!(matches!(tail[0], TraceOp::Jmp(_)));
        assert!(matches!(tail[1], TraceOp::Callq(Operand::Reg(Gpr::Rax))));
        assert_eq!(
            *tail[2],
            TraceOp::Movq(Operand::Imm(0x3000), reg(Gpr::Rax))
        );
    }

    #[test]
    fn bcopy_stages_arguments_and_spills_clobbered_homes() {
        let mut registry = Registry::new();
        let memmove = registry.register_function(0x4000, FnLayout::default());

        let mut b = builder::Builder::new();
        b.ldap(0, P0); // dst → rbx
        b.ldap(1, P1); // src → r13
        b.ldaq(2, R0); // len → r14
        b.bcopy(P1, R0, P0);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::on_stack(&[true, true, false], &[]))
            .with_block_copy(memmove);
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        // Outgoing area reserves the memmove footprint.
        assert_eq!(cg.spill_base, MEMMOVE_ARGS);

        assert!(asm.ops.contains(&TraceOp::Movq(reg(Gpr::Rbx), mem(Gpr::Rsp, 0))));
        assert!(asm.ops.contains(&TraceOp::Movq(reg(Gpr::R13), mem(Gpr::Rsp, 8))));
        assert!(asm.ops.contains(&TraceOp::Movq(reg(Gpr::R14), mem(Gpr::Rsp, 16))));
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(Operand::Imm(0x4000), reg(Gpr::Rdi)))
        );
        assert!(asm.ops.contains(&TraceOp::Callq(reg(Gpr::Rdi))));
    }

    #[test]
    #[should_panic(expected = "bcopy requires a registered block-copy routine")]
    fn bcopy_without_a_routine_panics() {
        let registry = Registry::new();
        let mut b = builder::Builder::new();
        b.ldap(0, P0);
        b.ldap(1, P1);
        b.ldaq(2, R0);
        b.bcopy(P1, R0, P0);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, FnLayout::on_stack(&[true, true, false], &[]));
        cg.compile(&mut TraceAsm::new(), &program);
    }

    // ── Prologue ────────────────────────────────────────────────────────

    #[test]
    fn prologue_saves_in_register_arguments_to_their_slots() {
        let registry = Registry::new();
        let layout = FnLayout::new(
            vec![
                Parameter::in_reg(Gpr::Rdi, false),
                Parameter::on_stack(0, false),
            ],
            vec![],
        );

        let mut b = builder::Builder::new();
        b.ldaq(0, R0);
        b.ldaq(1, R1);
        b.halt();
        let program = b.build();

        let mut cg = CodeGen::new(&registry, layout);
        let mut asm = TraceAsm::new();
        cg.compile(&mut asm, &program);

        let save = cg.argv(0);
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(reg(Gpr::Rdi), Operand::Mem(save))),
            "in-register argument saved in the prologue"
        );
        // ldaq(0) reads the save slot, ldaq(1) the caller's stack slot.
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(Operand::Mem(save), reg(Gpr::Rbx)))
        );
        let caller_slot = (cg.frame + 8) as i32;
        assert!(
            asm.ops
                .contains(&TraceOp::Movq(mem(Gpr::Rsp, caller_slot), reg(Gpr::R13)))
        );
    }

    // ── End to end through dynasmrt ─────────────────────────────────────

    #[test]
    fn compiles_to_executable_memory() {
        let registry = Registry::new();
        let mut b = builder::Builder::new();
        b.label("top");
        b.addi(R0, -1, R0);
        b.bne(R0, Rz, "top");
        b.halt();
        let program = b.build();

        let unit = compile(&program, &registry, FnLayout::default());
        assert!(!unit.buf.is_empty());
        assert!(!unit.entry_ptr().is_null());
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn compiled_increment_runs_with_native_register_layout() {
        // A layout that happens to coincide with the C convention, so the
        // finished code is callable from the test directly.
        let registry = Registry::new();
        let layout = FnLayout::new(
            vec![Parameter::in_reg(Gpr::Rdi, false)],
            vec![Parameter::in_reg(Gpr::Rax, false)],
        );

        let mut b = builder::Builder::new();
        b.ldaq(0, R0);
        b.addi(R0, 1, R1);
        b.strq(R1, 0);
        b.halt();
        let program = b.build();

        let unit = compile(&program, &registry, layout);
        let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(unit.entry_ptr()) };
        assert_eq!(f(41), 42);
        assert_eq!(f(0), 1);
    }

    // ── Registry interaction ────────────────────────────────────────────

    #[test]
    fn method_targets_resolve_to_slots() {
        let mut registry = Registry::new();
        let m = registry.register_method(5, FnLayout::default());
        assert_eq!(registry.entry(m).target, CallTarget::Slot(5));
    }
}
