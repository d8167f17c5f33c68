//! Call descriptors: how a callee expects arguments and returns laid out.
//!
//! Call sites in abstract-machine programs name their callee through an
//! opaque [`CallHandle`]; the [`Registry`] resolves a handle to a function
//! pointer (or vtable slot) plus its [`FnLayout`]. This keeps compiled
//! programs free of direct symbol references and lets the code generator
//! marshal arguments without knowing anything else about the callee.

use std::fmt;

use crate::arch::x64::Gpr;

/// Where one argument or return value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Passed in a physical register.
    InRegister(Gpr),
    /// Passed on the stack at this byte offset. Offsets are relative to the
    /// stack pointer at the call instruction (outgoing view); for the
    /// enclosing function's own parameters they index the incoming
    /// argument block.
    OnStack(u32),
}

/// One parameter of a function layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    pub kind: ParamKind,
    /// Pointer-kind parameters must be fed from pointer registers and vice
    /// versa; the code generator enforces this.
    pub pointer: bool,
}

impl Parameter {
    pub fn in_reg(reg: Gpr, pointer: bool) -> Parameter {
        Parameter {
            kind: ParamKind::InRegister(reg),
            pointer,
        }
    }

    pub fn on_stack(offset: u32, pointer: bool) -> Parameter {
        Parameter {
            kind: ParamKind::OnStack(offset),
            pointer,
        }
    }

    pub fn in_register(&self) -> bool {
        matches!(self.kind, ParamKind::InRegister(_))
    }
}

/// Argument and return layout of one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FnLayout {
    pub args: Vec<Parameter>,
    pub rets: Vec<Parameter>,
}

impl FnLayout {
    pub fn new(args: Vec<Parameter>, rets: Vec<Parameter>) -> FnLayout {
        FnLayout { args, rets }
    }

    /// Lay a signature out fully on the stack at 8-byte stride, returns
    /// following arguments — the host convention's stack form. Each entry
    /// is the parameter's pointer-ness.
    pub fn on_stack(args: &[bool], rets: &[bool]) -> FnLayout {
        let arg_params = args
            .iter()
            .enumerate()
            .map(|(i, &pointer)| Parameter::on_stack(i as u32 * 8, pointer))
            .collect();
        let ret_params = rets
            .iter()
            .enumerate()
            .map(|(i, &pointer)| Parameter::on_stack((args.len() + i) as u32 * 8, pointer))
            .collect();
        FnLayout {
            args: arg_params,
            rets: ret_params,
        }
    }

    /// Bytes of stack this layout occupies at a call site: the extent of
    /// its highest stack-passed slot.
    pub fn stack_extent(&self) -> u32 {
        self.args
            .iter()
            .chain(&self.rets)
            .filter_map(|p| match p.kind {
                ParamKind::OnStack(off) => Some(off + 8),
                ParamKind::InRegister(_) => None,
            })
            .max()
            .unwrap_or(0)
    }
}

/// Opaque key naming a registered callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle {
    id: u32,
}

impl CallHandle {
    pub fn id(self) -> u32 {
        self.id
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.id)
    }
}

/// What a handle calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// A function entry point.
    Addr(usize),
    /// A method slot, dispatched through a vtable at call time.
    Slot(u32),
}

/// A registered callee: target plus layout.
#[derive(Debug, Clone)]
pub struct FnEntry {
    pub target: CallTarget,
    pub layout: FnLayout,
}

/// Resolves call handles for one code generator. Owned by the caller;
/// nothing here is process-global.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<FnEntry>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    fn add(&mut self, entry: FnEntry) -> CallHandle {
        let id = self.entries.len() as u32;
        self.entries.push(entry);
        CallHandle { id }
    }

    /// Register a function by entry address.
    pub fn register_function(&mut self, addr: usize, layout: FnLayout) -> CallHandle {
        self.add(FnEntry {
            target: CallTarget::Addr(addr),
            layout,
        })
    }

    /// Register a method by vtable slot. The receiver is an implicit first
    /// argument of the layout.
    pub fn register_method(&mut self, slot: u32, layout: FnLayout) -> CallHandle {
        self.add(FnEntry {
            target: CallTarget::Slot(slot),
            layout,
        })
    }

    /// Resolve a handle. Unknown handles are a construction-time failure.
    pub fn entry(&self, handle: CallHandle) -> &FnEntry {
        match self.entries.get(handle.id as usize) {
            Some(entry) => entry,
            None => panic!("unregistered call handle: {}", handle.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_layout_places_rets_after_args() {
        let layout = FnLayout::on_stack(&[false, true], &[false]);
        assert_eq!(layout.args[0].kind, ParamKind::OnStack(0));
        assert_eq!(layout.args[1].kind, ParamKind::OnStack(8));
        assert!(layout.args[1].pointer);
        assert_eq!(layout.rets[0].kind, ParamKind::OnStack(16));
        assert_eq!(layout.stack_extent(), 24);
    }

    #[test]
    fn register_parameters_do_not_count_toward_stack_extent() {
        let layout = FnLayout::new(
            vec![Parameter::in_reg(Gpr::Rdi, true)],
            vec![Parameter::in_reg(Gpr::Rax, false)],
        );
        assert_eq!(layout.stack_extent(), 0);
    }

    #[test]
    fn registry_resolves_in_registration_order() {
        let mut reg = Registry::new();
        let f = reg.register_function(0x1000, FnLayout::default());
        let m = reg.register_method(3, FnLayout::default());
        assert_eq!(reg.entry(f).target, CallTarget::Addr(0x1000));
        assert_eq!(reg.entry(m).target, CallTarget::Slot(3));
    }

    #[test]
    #[should_panic(expected = "unregistered call handle")]
    fn unknown_handle_panics() {
        let reg = Registry::new();
        let other = {
            let mut tmp = Registry::new();
            tmp.register_function(0x1000, FnLayout::default())
        };
        reg.entry(other);
    }
}
