//! Host-runtime binding for amd64.
//!
//! Everything in this file is keyed to one supported host runtime version:
//! the stack-guard offset inside the per-thread control block, the
//! segment-prefixed byte sequence that fetches that block, the vtable
//! layout, and the register conventions. A new host version gets a new
//! file, selected at build time — these values are not tunable at runtime.

use crate::arch::x64::{Asm, AsmLabel, Cond, Gpr, Operand, ptr};
use crate::backend::CodeGen;
use crate::ir::{GenericRegister, PointerRegister, Register};

/// Integer argument registers, in call order.
pub const ARG_ORDER: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Callee-saved registers under the host convention. Saved at entry,
/// restored around every runtime call and at exit.
pub const RESERVED: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Physical homes handed to virtual registers, in assignment order. `rax`
/// and `r12` stay scratch: `rax` is the native-call target and zero
/// materialization scratch, `r12` the runtime-call target.
pub const ALLOC_ORDER: [Gpr; 12] = [
    Gpr::Rbx,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
    Gpr::R10,
    Gpr::R11,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::Rdx,
    Gpr::Rcx,
    Gpr::R8,
    Gpr::R9,
];

/// Registers the host memmove clobbers: argument registers plus the
/// call-clobbered scratch set.
pub const MEMMOVE_CLOBBERS: [Gpr; 9] = [
    Gpr::Rdi,
    Gpr::Rsi,
    Gpr::Rdx,
    Gpr::Rcx,
    Gpr::R8,
    Gpr::R9,
    Gpr::Rax,
    Gpr::R10,
    Gpr::R11,
];

/// Stack bytes the host memmove consumes for its three arguments.
pub const MEMMOVE_ARGS: u32 = 24;

/// Offset of the stack-guard pointer inside the thread control block.
pub const STACK_GUARD_OFFSET: i32 = 0x10;

/// `mov %gs:0x30, %rcx` — fetch the thread control block. The assembler
/// has no form for this segment-prefixed load, so the bytes are emitted
/// verbatim.
pub const TCB_LOAD: [u8; 9] = [0x65, 0x48, 0x8b, 0x0c, 0x25, 0x30, 0x00, 0x00, 0x00];

/// Byte offset of the method table's function array.
pub const VTAB_FUNC_BASE: i32 = 24;

pub const PTR_SIZE: i32 = 8;

impl<'r> CodeGen<'r> {
    /// Entry stack check: branch to `to` (the grow-stack stub) when
    /// `rsp - frame - extra` falls below the guard. Runs before the frame
    /// is allocated; clobbers `rax` and `rcx` only.
    pub(crate) fn abi_stack_check<A: Asm>(&self, asm: &mut A, to: AsmLabel, extra: u32) {
        asm.raw(&TCB_LOAD);
        asm.leaq(ptr(Gpr::Rsp, -((self.frame + extra) as i32)), Gpr::Rax);
        asm.cmpq(
            Operand::Mem(ptr(Gpr::Rcx, STACK_GUARD_OFFSET)),
            Operand::Reg(Gpr::Rax),
        );
        asm.jcc(Cond::Be, to);
    }

    /// Lower `bcopy`: spill whatever the host memmove clobbers, stage
    /// `(dst, src, len)` on the outgoing stack area, call, reload.
    pub(crate) fn abi_block_copy<A: Asm>(
        &self,
        asm: &mut A,
        pd: PointerRegister,
        ps: PointerRegister,
        nb: GenericRegister,
    ) {
        let memmove = match self.block_copy {
            Some(handle) => self.fn_addr(handle),
            None => panic!("bcopy requires a registered block-copy routine"),
        };
        let rd = self.r(Register::Pointer(pd));
        let rs = self.r(Register::Pointer(ps));
        let rl = self.r(Register::Generic(nb));

        for (i, &v) in self.live.iter().enumerate() {
            let rr = self.homes[i];
            if MEMMOVE_CLOBBERS.contains(&rr) {
                asm.movq(Operand::Reg(rr), Operand::Mem(self.slot(v)));
            }
        }

        asm.movq(Operand::Reg(rd), Operand::Mem(ptr(Gpr::Rsp, 0)));
        asm.movq(Operand::Reg(rs), Operand::Mem(ptr(Gpr::Rsp, 8)));
        asm.movq(Operand::Reg(rl), Operand::Mem(ptr(Gpr::Rsp, 16)));
        asm.movq(Operand::Imm(memmove as i64), Operand::Reg(Gpr::Rdi));
        asm.callq(Operand::Reg(Gpr::Rdi));

        for (i, &v) in self.live.iter().enumerate() {
            let rr = self.homes[i];
            if MEMMOVE_CLOBBERS.contains(&rr) {
                asm.movq(Operand::Mem(self.slot(v)), Operand::Reg(rr));
            }
        }
    }
}
